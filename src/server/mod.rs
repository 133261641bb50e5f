use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::acceptor::Acceptor;
use crate::config::Config;
use crate::geoip::GeoResolver;
use crate::metrics::TarpitMetrics;
use crate::pacer::Pacer;
use crate::recorder::{RecordEntry, Recorder};

/// How often the recorder is asked to evict stale metric series. The
/// horizon bounds cardinality; this cadence only batches the sweeps.
const CLEAN_PERIOD: Duration = Duration::from_secs(60);

/// How often the live-client count is logged.
const STATS_PERIOD: Duration = Duration::from_secs(60);

/// Owns all shared tarpit state and wires the components together.
///
/// The live-client counter, the record channel and the metric registry all
/// live here and are handed to components explicitly; there are no
/// process-wide singletons to trip over.
pub struct Server {
    cfg: Config,
    live: Arc<AtomicI64>,
    metrics: Option<Arc<TarpitMetrics>>,
    local_addrs: Vec<SocketAddr>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(cfg: Config) -> Result<Self> {
        let metrics = if cfg.prometheus.enabled {
            let host = cfg.effective_host(&cfg.prometheus.host);
            let addr = format!("{host}:{}", cfg.prometheus.port);

            Some(Arc::new(
                TarpitMetrics::new(&addr, &cfg.prometheus.entry)
                    .context("creating metrics registry")?,
            ))
        } else {
            None
        };

        Ok(Self {
            cfg,
            live: Arc::new(AtomicI64::new(0)),
            metrics,
            local_addrs: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin trapping.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Metrics exposition first, so scrapes work as soon as the first
        //    connection lands.
        if let Some(metrics) = &self.metrics {
            metrics.start().await.context("starting metrics server")?;
        }

        // 2. The recording pipeline.
        let resolver = GeoResolver::new(&self.cfg.geoip);
        let (records_tx, records_rx) = mpsc::channel(self.cfg.max_clients);
        let recorder = Recorder::new(
            records_rx,
            self.metrics.clone(),
            resolver,
            self.cfg.clean_horizon(),
        );
        tokio::spawn(recorder.run());

        // 3. The pacer.
        let pacer = Pacer::new(
            self.cfg.max_clients,
            self.cfg.line_length,
            records_tx.clone(),
        );
        let queue = pacer.queue();
        tokio::spawn(pacer.run());

        // 4. One acceptor per port.
        let host = self.cfg.effective_host(&self.cfg.host);
        let ports = self.cfg.ports.clone();
        for port in ports {
            let acceptor = Acceptor::new(
                self.cfg.conn_type,
                host.clone(),
                port,
                self.cfg.interval,
                self.cfg.max_clients,
                Arc::clone(&self.live),
                queue.clone(),
                records_tx.clone(),
            );

            let listener = acceptor.bind().await?;
            self.local_addrs
                .push(listener.local_addr().context("getting local address")?);

            tokio::spawn(acceptor.run(listener));
        }

        // 5. Background timers.
        if self.metrics.is_some() && self.cfg.clean_horizon().is_some() {
            self.spawn_cleaner(records_tx);
        }
        self.spawn_stats_reporter();

        info!(
            ports = ?self.local_addrs.iter().map(|a| a.port()).collect::<Vec<_>>(),
            max_clients = self.cfg.max_clients,
            interval_ms = self.cfg.interval.as_millis() as u64,
            "tarpit started",
        );

        Ok(())
    }

    /// Stop background timers and the metrics endpoint.
    ///
    /// Trapped sockets are deliberately not drained: they die with the
    /// process, and making peers wait out the teardown costs nothing.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(metrics) = &self.metrics {
            metrics.stop().await?;
        }

        Ok(())
    }

    /// Addresses the tarpit listeners actually bound, in port order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// The metric registry, when exposition is enabled.
    pub fn metrics(&self) -> Option<&Arc<TarpitMetrics>> {
        self.metrics.as_ref()
    }

    /// Spawn the timer that triggers metric series eviction.
    fn spawn_cleaner(&self, records: mpsc::Sender<RecordEntry>) {
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEAN_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the immediate first tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if records.send(RecordEntry::Clean).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Spawn the periodic live-client count reporter.
    fn spawn_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let live = Arc::clone(&self.live);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let trapped = live.load(Ordering::SeqCst);
                        if trapped > 0 {
                            info!(trapped, "trapped clients");
                        }
                    }
                }
            }
        });
    }
}
