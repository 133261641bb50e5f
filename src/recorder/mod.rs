pub mod priority_queue;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::warn;

use crate::geoip::{GeoLocation, GeoResolver};
use crate::metrics::TarpitMetrics;

use priority_queue::UpdatablePriorityQueue;

/// One observation produced by an acceptor or the pacer.
///
/// Entries for the same client arrive in lifecycle order: one `Start`, any
/// number of `Send`s, then at most one `Stop`. `Clean` is injected by a
/// timer and belongs to no client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEntry {
    /// A client connected and claimed a slot.
    Start { ip: String, local_port: String },
    /// One line went out to a client.
    Send {
        ip: String,
        local_port: String,
        bytes_sent: u64,
        milliseconds_spent: i64,
    },
    /// A client went away; carries the time since its last send.
    Stop {
        ip: String,
        local_port: String,
        milliseconds_spent: i64,
    },
    /// Evict metric series for IPs not seen within the horizon.
    Clean,
}

/// The exact label sets created for one client IP.
///
/// The prometheus crate removes series by full label set, so eviction
/// needs to remember every combination it has created per IP.
#[derive(Debug, Default)]
struct IpSeries {
    /// (local_port, geohash, country, location) of open-count series.
    opens: HashSet<(String, String, String, String)>,
    /// local_port of trapped-time series.
    seconds: HashSet<String>,
}

/// Single consumer of the record channel.
///
/// Owns the counters, the freshness queue and the label index outright;
/// processing one entry at a time is what makes the counters safe without
/// locks. GeoIP lookups run inline here, which is fine: records are
/// buffered, and if lookups fall behind, the full channel throttles the
/// acceptors instead of growing memory.
pub struct Recorder {
    records: mpsc::Receiver<RecordEntry>,
    metrics: Option<Arc<TarpitMetrics>>,
    resolver: GeoResolver,
    horizon: Option<Duration>,
    last_seen: UpdatablePriorityQueue,
    series: HashMap<String, IpSeries>,
}

impl Recorder {
    /// Create a recorder. With `metrics` unset, entries are drained and
    /// dropped so producers never block on a disabled pipeline.
    pub fn new(
        records: mpsc::Receiver<RecordEntry>,
        metrics: Option<Arc<TarpitMetrics>>,
        resolver: GeoResolver,
        horizon: Option<Duration>,
    ) -> Self {
        Self {
            records,
            metrics,
            resolver,
            horizon,
            last_seen: UpdatablePriorityQueue::new(),
            series: HashMap::new(),
        }
    }

    /// Consume records until every producer handle is gone.
    pub async fn run(mut self) {
        while let Some(entry) = self.records.recv().await {
            self.record(entry).await;
        }
    }

    async fn record(&mut self, entry: RecordEntry) {
        let Some(metrics) = self.metrics.clone() else {
            return;
        };

        match entry {
            RecordEntry::Start { ip, local_port } => {
                let location = match self.resolver.resolve(&ip).await {
                    Ok(location) => location,
                    Err(e) => {
                        warn!(ip = %ip, error = %e, "geoip lookup failed");
                        GeoLocation::unknown()
                    }
                };

                metrics
                    .client_opens
                    .with_label_values(&[
                        &ip,
                        &local_port,
                        &location.geohash,
                        &location.country,
                        &location.location,
                    ])
                    .inc();
                metrics.opens_total.with_label_values(&[&local_port]).inc();

                self.series.entry(ip.clone()).or_default().opens.insert((
                    local_port,
                    location.geohash,
                    location.country,
                    location.location,
                ));
                self.last_seen.update(&ip, Instant::now());
            }
            RecordEntry::Send {
                ip,
                local_port,
                bytes_sent,
                milliseconds_spent,
            } => {
                let seconds_spent = milliseconds_spent as f64 / 1000.0;

                metrics
                    .client_seconds
                    .with_label_values(&[&ip, &local_port])
                    .inc_by(seconds_spent);
                metrics
                    .trapped_seconds_total
                    .with_label_values(&[&local_port])
                    .inc_by(seconds_spent);
                metrics
                    .bytes_total
                    .with_label_values(&[&local_port])
                    .inc_by(bytes_sent as f64);

                self.series
                    .entry(ip.clone())
                    .or_default()
                    .seconds
                    .insert(local_port);
                self.last_seen.update(&ip, Instant::now());
            }
            RecordEntry::Stop {
                ip,
                local_port,
                milliseconds_spent,
            } => {
                let seconds_spent = milliseconds_spent as f64 / 1000.0;

                metrics
                    .client_seconds
                    .with_label_values(&[&ip, &local_port])
                    .inc_by(seconds_spent);
                metrics
                    .trapped_seconds_total
                    .with_label_values(&[&local_port])
                    .inc_by(seconds_spent);
                metrics.closes_total.with_label_values(&[&local_port]).inc();

                self.series
                    .entry(ip.clone())
                    .or_default()
                    .seconds
                    .insert(local_port);
                self.last_seen.update(&ip, Instant::now());
            }
            RecordEntry::Clean => self.clean(&metrics),
        }
    }

    /// Evict labeled series for every IP silent longer than the horizon.
    ///
    /// The per-port totals are untouched; only the high-cardinality per-IP
    /// series go away. An IP that returns later simply starts new series.
    fn clean(&mut self, metrics: &TarpitMetrics) {
        let Some(horizon) = self.horizon else {
            return;
        };
        let Some(deadline) = Instant::now().checked_sub(horizon) else {
            return;
        };

        while let Some(top) = self.last_seen.peek() {
            if top.value >= deadline {
                break;
            }

            let ip = top.key.clone();
            if let Some(series) = self.series.remove(&ip) {
                for (local_port, geohash, country, location) in &series.opens {
                    let _ = metrics.client_opens.remove_label_values(&[
                        &ip, local_port, geohash, country, location,
                    ]);
                }
                for local_port in &series.seconds {
                    let _ = metrics.client_seconds.remove_label_values(&[&ip, local_port]);
                }
            }

            self.last_seen.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::GeoIpConfig;

    fn test_metrics() -> Arc<TarpitMetrics> {
        Arc::new(TarpitMetrics::new("127.0.0.1:0", "metrics").expect("metrics"))
    }

    fn recorder_with(
        metrics: Option<Arc<TarpitMetrics>>,
        horizon: Option<Duration>,
    ) -> (mpsc::Sender<RecordEntry>, Recorder) {
        let (tx, rx) = mpsc::channel(64);
        let resolver = GeoResolver::new(&GeoIpConfig::default());
        (tx, Recorder::new(rx, metrics, resolver, horizon))
    }

    fn start(ip: &str, port: &str) -> RecordEntry {
        RecordEntry::Start {
            ip: ip.to_string(),
            local_port: port.to_string(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_accounting() {
        let metrics = test_metrics();
        let (tx, recorder) = recorder_with(Some(Arc::clone(&metrics)), None);

        tx.send(start("192.0.2.7", "2222")).await.expect("send");
        tx.send(RecordEntry::Send {
            ip: "192.0.2.7".to_string(),
            local_port: "2222".to_string(),
            bytes_sent: 10,
            milliseconds_spent: 1500,
        })
        .await
        .expect("send");
        tx.send(RecordEntry::Stop {
            ip: "192.0.2.7".to_string(),
            local_port: "2222".to_string(),
            milliseconds_spent: 500,
        })
        .await
        .expect("send");
        drop(tx);

        recorder.run().await;

        let port = &["2222"][..];
        assert_eq!(metrics.opens_total.with_label_values(port).get(), 1.0);
        assert_eq!(metrics.closes_total.with_label_values(port).get(), 1.0);
        assert_eq!(metrics.bytes_total.with_label_values(port).get(), 10.0);
        assert!(
            (metrics.trapped_seconds_total.with_label_values(port).get() - 2.0).abs() < 1e-9,
        );
        assert!(
            (metrics
                .client_seconds
                .with_label_values(&["192.0.2.7", "2222"])
                .get()
                - 2.0)
                .abs()
                < 1e-9,
        );

        // With geoip off, the open series carries the "Geohash off" labels.
        assert_eq!(
            metrics
                .client_opens
                .with_label_values(&["192.0.2.7", "2222", "s000", "Geohash off", "Geohash off"])
                .get(),
            1.0,
        );
    }

    #[tokio::test]
    async fn test_per_port_counters_stay_separate() {
        let metrics = test_metrics();
        let (tx, recorder) = recorder_with(Some(Arc::clone(&metrics)), None);

        tx.send(start("192.0.2.1", "22")).await.expect("send");
        tx.send(start("192.0.2.2", "2222")).await.expect("send");
        tx.send(start("192.0.2.3", "2222")).await.expect("send");
        drop(tx);

        recorder.run().await;

        assert_eq!(metrics.opens_total.with_label_values(&["22"]).get(), 1.0);
        assert_eq!(metrics.opens_total.with_label_values(&["2222"]).get(), 2.0);
    }

    #[tokio::test]
    async fn test_disabled_metrics_drain_without_effect() {
        let (tx, recorder) = recorder_with(None, None);

        tx.send(start("192.0.2.9", "22")).await.expect("send");
        tx.send(RecordEntry::Clean).await.expect("send");
        drop(tx);

        // Completes without touching any registry.
        recorder.run().await;
    }

    #[tokio::test]
    async fn test_clean_evicts_silent_ips_only() {
        let metrics = test_metrics();
        let horizon = Duration::from_millis(100);
        let (tx, recorder) = recorder_with(Some(Arc::clone(&metrics)), Some(horizon));

        let handle = tokio::spawn(recorder.run());

        tx.send(start("192.0.2.66", "2222")).await.expect("send");
        tx.send(RecordEntry::Stop {
            ip: "192.0.2.66".to_string(),
            local_port: "2222".to_string(),
            milliseconds_spent: 50,
        })
        .await
        .expect("send");

        tokio::time::sleep(Duration::from_millis(200)).await;

        // A fresh IP inside the horizon must survive the sweep.
        tx.send(start("192.0.2.77", "2222")).await.expect("send");
        tx.send(RecordEntry::Clean).await.expect("send");
        drop(tx);
        handle.await.expect("recorder");

        let text = metrics.render().expect("render");
        assert!(
            !text.contains("192.0.2.66"),
            "silent ip still present:\n{text}",
        );
        assert!(text.contains("192.0.2.77"), "fresh ip evicted:\n{text}");

        // Per-port totals survive eviction.
        assert_eq!(metrics.opens_total.with_label_values(&["2222"]).get(), 2.0);
        assert_eq!(metrics.closes_total.with_label_values(&["2222"]).get(), 1.0);
    }

    #[tokio::test]
    async fn test_clean_without_horizon_is_a_no_op() {
        let metrics = test_metrics();
        let (tx, recorder) = recorder_with(Some(Arc::clone(&metrics)), None);

        tx.send(start("192.0.2.5", "22")).await.expect("send");
        tx.send(RecordEntry::Clean).await.expect("send");
        drop(tx);

        recorder.run().await;

        assert!(metrics.render().expect("render").contains("192.0.2.5"));
    }
}
