use anyhow::{Result, bail};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flightbox::config::{FlightBoxConfig, config_path};
use flightbox::lifecycle::{Coordinator, shutdown_signal};
use flightbox::metrics::{initialize_hub_metrics, start_metrics_server};

pub async fn handle_run(config: Option<&Path>) -> Result<()> {
    let path = config_path(config);
    let config = FlightBoxConfig::load_or_default(&path)?;
    info!(
        config = ?path,
        inputs = config.inputs.len(),
        outputs = config.outputs.len(),
        transformation = config.transformation.enabled,
        "Starting FlightBox"
    );

    let metrics_shutdown = CancellationToken::new();
    let metrics_task = match config.metrics_port {
        Some(port) => {
            let shutdown = metrics_shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = start_metrics_server(port, shutdown).await {
                    error!("Metrics server stopped: {:#}", e);
                }
            }))
        }
        None => {
            initialize_hub_metrics();
            None
        }
    };

    let coordinator = Coordinator::new(
        config.hub.hub_config(),
        config.lifecycle.lifecycle_config(),
    );
    let report = coordinator
        .run_until(config.build_adapters(), shutdown_signal())
        .await?;

    metrics_shutdown.cancel();
    if let Some(task) = metrics_task
        && let Err(e) = task.await
    {
        warn!("Metrics task failed: {}", e);
    }

    if !report.is_clean() {
        let stuck: Vec<String> = report
            .timed_out
            .iter()
            .map(|t| t.adapter.clone())
            .chain(report.panicked.iter().cloned())
            .collect();
        bail!("FlightBox stopped uncleanly, adapters not stopped: {}", stuck.join(", "));
    }

    info!("FlightBox stopped");
    Ok(())
}
