use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Prometheus counters for the tarpit, plus their exposition server.
///
/// Counters are only ever mutated by the recorder task, which serializes
/// all updates; the HTTP handler just reads the registry.
pub struct TarpitMetrics {
    registry: Registry,
    addr: String,
    entry: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total clients that connected, per listening port.
    pub opens_total: CounterVec,
    /// Total clients that went away, per listening port.
    pub closes_total: CounterVec,
    /// Total junk bytes written, per listening port.
    pub bytes_total: CounterVec,
    /// Total seconds clients spent trapped, per listening port.
    pub trapped_seconds_total: CounterVec,
    /// Connections per client IP, with location labels.
    pub client_opens: CounterVec,
    /// Seconds trapped per client IP and port.
    pub client_seconds: CounterVec,
}

impl TarpitMetrics {
    /// Create the registry with all counters registered.
    ///
    /// `addr` is the exposition bind address; `entry` the path component the
    /// metrics are served under.
    pub fn new(addr: &str, entry: &str) -> Result<Self> {
        let registry = Registry::new();

        let opens_total = CounterVec::new(
            Opts::new(
                "endlessh_client_open_count_total",
                "Total number of clients that tried to connect to this host.",
            ),
            &["local_port"],
        )?;
        let closes_total = CounterVec::new(
            Opts::new(
                "endlessh_client_closed_count_total",
                "Total number of clients that stopped connecting to this host.",
            ),
            &["local_port"],
        )?;
        let bytes_total = CounterVec::new(
            Opts::new(
                "endlessh_sent_bytes_total",
                "Total bytes sent to clients that tried to connect to this host.",
            ),
            &["local_port"],
        )?;
        let trapped_seconds_total = CounterVec::new(
            Opts::new(
                "endlessh_trapped_time_seconds_total",
                "Total seconds clients spent on endlessh.",
            ),
            &["local_port"],
        )?;
        let client_opens = CounterVec::new(
            Opts::new(
                "endlessh_client_open_count",
                "Number of connections of clients.",
            ),
            &["ip", "local_port", "geohash", "country", "location"],
        )?;
        let client_seconds = CounterVec::new(
            Opts::new(
                "endlessh_client_trapped_time_seconds",
                "Seconds a client spends on endlessh.",
            ),
            &["ip", "local_port"],
        )?;

        registry.register(Box::new(opens_total.clone()))?;
        registry.register(Box::new(closes_total.clone()))?;
        registry.register(Box::new(bytes_total.clone()))?;
        registry.register(Box::new(trapped_seconds_total.clone()))?;
        registry.register(Box::new(client_opens.clone()))?;
        registry.register(Box::new(client_seconds.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            entry: entry.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            opens_total,
            closes_total,
            bytes_total,
            trapped_seconds_total,
            client_opens,
            client_seconds,
        })
    }

    /// Bind the exposition listener and start serving in the background.
    pub async fn start(&self) -> Result<()> {
        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route(&format!("/{}", self.entry), get(metrics_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(self.addr.as_str())
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let entry = self.entry.clone();
        tokio::spawn(async move {
            info!(addr = %local_addr, entry = %entry, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                // A dead metrics endpoint defeats the point of running one;
                // let the supervisor restart the whole process.
                error!(error = %e, "metrics server error");
                std::process::exit(1);
            }
        });

        Ok(())
    }

    /// Gracefully shut down the exposition server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// Encode a registry in the Prometheus text format.
fn render_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("metrics are not valid UTF-8")
}

/// GET /{entry} - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render_with_expected_names() {
        let metrics = TarpitMetrics::new("127.0.0.1:0", "metrics").expect("metrics");

        metrics.opens_total.with_label_values(&["2222"]).inc();
        metrics
            .bytes_total
            .with_label_values(&["2222"])
            .inc_by(17.0);
        metrics
            .client_opens
            .with_label_values(&["192.0.2.7", "2222", "s000", "Unknown", "Unknown"])
            .inc();

        let text = metrics.render().expect("render");
        assert!(text.contains("endlessh_client_open_count_total{local_port=\"2222\"} 1"));
        assert!(text.contains("endlessh_sent_bytes_total{local_port=\"2222\"} 17"));
        assert!(text.contains("endlessh_client_open_count{"));
        assert!(text.contains("ip=\"192.0.2.7\""));
    }

    #[test]
    fn test_removed_series_disappear_from_exposition() {
        let metrics = TarpitMetrics::new("127.0.0.1:0", "metrics").expect("metrics");

        metrics
            .client_seconds
            .with_label_values(&["192.0.2.7", "2222"])
            .inc_by(1.5);
        assert!(metrics.render().expect("render").contains("192.0.2.7"));

        metrics
            .client_seconds
            .remove_label_values(&["192.0.2.7", "2222"])
            .expect("series exists");
        assert!(!metrics.render().expect("render").contains("192.0.2.7"));
    }

    #[tokio::test]
    async fn test_exposition_endpoint_serves_metrics() {
        let metrics = TarpitMetrics::new("127.0.0.1:0", "metrics").expect("metrics");
        metrics.opens_total.with_label_values(&["22"]).inc();

        // Bind directly so the test can learn the ephemeral port.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let app_state = Arc::new(AppState {
            registry: metrics.registry.clone(),
        });
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(app_state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert!(body.contains("endlessh_client_open_count_total{local_port=\"22\"} 1"));
    }
}
