use anyhow::{Context, Result};
use axum::{Router, extract::State, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Install the Prometheus recorder
/// Returns a handle that can be used to render metrics for scraping
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        // Item age at delivery, 1ms .. 5s
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("hub.delivery.latency_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0],
        )
        .context("Failed to set buckets for hub.delivery.latency_seconds")?
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Background task to update process metrics
/// Updates uptime and memory usage metrics every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        // Get memory usage using procfs (Linux-specific)
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        // Parse RSS memory in kB
                        if let Some(kb_str) = line.split_whitespace().nth(1)
                            && let Ok(kb) = kb_str.parse::<f64>()
                        {
                            metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
                        }
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Initialize hub and adapter metrics to zero/default values
/// This ensures metrics always appear in Prometheus queries even if no events have occurred
pub fn initialize_hub_metrics() {
    // Hub routing
    metrics::counter!("hub.items.published_total").absolute(0);
    metrics::counter!("hub.items.delivered_total").absolute(0);
    metrics::counter!("hub.items.dropped_total").absolute(0);
    metrics::counter!("hub.items.rejected_total").absolute(0);
    metrics::counter!("hub.inbound_queue.full_total").absolute(0);
    metrics::gauge!("hub.inbound_queue.depth").set(0.0);
    metrics::gauge!("hub.consumers.registered").set(0.0);

    // Transformation
    metrics::counter!("pipeline.items.received_total").absolute(0);
    metrics::counter!("pipeline.decode_errors_total").absolute(0);

    // Inputs
    metrics::counter!("sbs1.lines.published_total").absolute(0);
    metrics::counter!("sbs1.connection.failed_total").absolute(0);
    metrics::gauge!("sbs1.connection.connected").set(0.0);
    metrics::counter!("udp.datagrams.received_total").absolute(0);
    metrics::counter!("gnss.sentences.published_total").absolute(0);
    metrics::counter!("gnss.sentences.invalid_total").absolute(0);

    // Broadcast output
    metrics::gauge!("broadcast.clients.connected").set(0.0);
    metrics::counter!("broadcast.items.sent_total").absolute(0);
    metrics::counter!("broadcast.items.dropped_total").absolute(0);

    // Lifecycle
    metrics::gauge!("lifecycle.adapters.running").set(0.0);
    metrics::counter!("lifecycle.shutdown_timeouts_total").absolute(0);
}

/// Serve `/metrics` on the given port until `shutdown` fires
pub async fn start_metrics_server(port: u16, shutdown: CancellationToken) -> Result<()> {
    let handle = init_metrics()?;
    initialize_hub_metrics();

    let process_task = tokio::spawn(process_metrics_task());

    let app = Router::new()
        .route(
            "/metrics",
            get(|State(handle): State<PrometheusHandle>| async move { handle.render() }),
        )
        .with_state(handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {addr}"))?;
    info!("Starting metrics server on http://{}/metrics", addr);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed");
    process_task.abort();
    result
}
