//! Start order and shutdown sequencing for a set of adapters
//!
//! The hub task starts first, then every consuming adapter (registered before
//! its task is spawned), then the producers. Shutdown runs the other way round:
//! producers are cancelled, the hub sentinel is sent, consumers get a bounded
//! time to drain and exit, stragglers are aborted and reported.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::adapter::{Adapter, AdapterContext, Role};
use crate::data_hub::{DataHub, HubConfig, HubHandle};
use crate::error::{ProducerIoError, ShutdownTimeout};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Pause between starting consumers and starting producers
    pub settle_delay: Duration,
    /// How long cancelled producers get to return
    pub producer_stop_timeout: Duration,
    /// How long consumers get to exit after the sentinel was sent
    pub consumer_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            producer_stop_timeout: Duration::from_secs(2),
            consumer_grace: Duration::from_secs(10),
        }
    }
}

struct RunningAdapter {
    name: String,
    role: Role,
    handle: JoinHandle<()>,
}

/// Outcome of [`Coordinator::shutdown`]
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Adapters that returned on their own
    pub stopped: Vec<String>,
    /// Adapters aborted after their deadline
    pub timed_out: Vec<ShutdownTimeout>,
    /// Adapter tasks that panicked
    pub panicked: Vec<String>,
    /// Whether the hub loop finished by itself
    pub hub_stopped: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty() && self.panicked.is_empty() && self.hub_stopped
    }
}

pub struct Coordinator {
    hub: HubHandle,
    hub_task: JoinHandle<()>,
    hub_grace: Duration,
    config: LifecycleConfig,
    consumers: Vec<RunningAdapter>,
    producers: Vec<RunningAdapter>,
    producer_cancel: CancellationToken,
    fatal: CancellationToken,
}

impl Coordinator {
    /// Spawn the hub loop; adapters are added with [`start`](Self::start)
    pub fn new(hub_config: HubConfig, config: LifecycleConfig) -> Self {
        let hub_grace = hub_config.shutdown_grace;
        let (hub, handle) = DataHub::new(hub_config);
        let hub_task = tokio::spawn(hub.run().instrument(info_span!("data_hub")));
        Self {
            hub: handle,
            hub_task,
            hub_grace,
            config,
            consumers: Vec::new(),
            producers: Vec::new(),
            producer_cancel: CancellationToken::new(),
            fatal: CancellationToken::new(),
        }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Cancelled when a consuming adapter fails and the system has to stop
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Start adapters: consumers and transformers first, then producers
    pub async fn start(&mut self, adapters: Vec<Box<dyn Adapter>>) -> anyhow::Result<()> {
        let (producers, consumers): (Vec<_>, Vec<_>) = adapters
            .into_iter()
            .partition(|a| a.role() == Role::Producer);

        for adapter in consumers {
            let name = adapter.name().to_string();
            let role = adapter.role();
            let Some(subscription) = adapter.subscribed_types() else {
                continue;
            };
            let inbox = self
                .hub
                .register(&name, subscription.clone(), adapter.republishes())
                .await?;
            info!(adapter = %name, role = ?role, subscription = %subscription, consumer = %inbox.id(), "Starting consumer");

            let ctx = AdapterContext {
                hub: self.hub.clone(),
                inbox: Some(inbox),
                cancel: CancellationToken::new(),
            };
            let handle = self.spawn(adapter, ctx, name.clone(), role);
            self.consumers.push(RunningAdapter { name, role, handle });
        }

        if !producers.is_empty() && !self.config.settle_delay.is_zero() {
            sleep(self.config.settle_delay).await;
        }

        for adapter in producers {
            let name = adapter.name().to_string();
            info!(adapter = %name, "Starting producer");
            let ctx = AdapterContext {
                hub: self.hub.clone(),
                inbox: None,
                cancel: self.producer_cancel.child_token(),
            };
            let handle = self.spawn(adapter, ctx, name.clone(), Role::Producer);
            self.producers.push(RunningAdapter {
                name,
                role: Role::Producer,
                handle,
            });
        }

        metrics::gauge!("lifecycle.adapters.running")
            .set((self.consumers.len() + self.producers.len()) as f64);
        Ok(())
    }

    fn spawn(
        &self,
        adapter: Box<dyn Adapter>,
        ctx: AdapterContext,
        name: String,
        role: Role,
    ) -> JoinHandle<()> {
        let fatal = self.fatal.clone();
        let span = info_span!("adapter", name = %name);
        tokio::spawn(
            async move {
                match adapter.run(ctx).await {
                    Ok(()) => info!("Adapter finished"),
                    Err(e) if role == Role::Producer || e.is::<ProducerIoError>() => {
                        // Input failures stay local to the input
                        metrics::counter!("lifecycle.producer_failures_total").increment(1);
                        error!(error = %format!("{e:#}"), "Input adapter stopped");
                    }
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "Adapter failed, stopping the system");
                        fatal.cancel();
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Start everything, wait for `stop` (or a fatal adapter failure), then
    /// shut down
    pub async fn run_until<F>(mut self, adapters: Vec<Box<dyn Adapter>>, stop: F) -> anyhow::Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        self.start(adapters).await?;
        let fatal = self.fatal.clone();
        tokio::select! {
            _ = stop => info!("Stop requested"),
            _ = fatal.cancelled() => warn!("Adapter failure, shutting down"),
        }
        Ok(self.shutdown().await)
    }

    /// Stop producers, send the sentinel and wait for consumers
    pub async fn shutdown(self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        info!(
            producers = self.producers.len(),
            consumers = self.consumers.len(),
            "Shutting down"
        );

        self.producer_cancel.cancel();
        let deadline = Instant::now() + self.config.producer_stop_timeout;
        for adapter in self.producers {
            join_until(adapter, deadline, self.config.producer_stop_timeout, &mut report).await;
        }

        if let Err(e) = self.hub.shutdown().await {
            warn!(error = %e, "Hub already closed before shutdown");
        }

        // Consumers may wait for transformers for the whole hub grace period
        let consumer_grace = self.config.consumer_grace.max(self.hub_grace);
        let deadline = Instant::now() + consumer_grace;
        for adapter in self.consumers {
            join_until(adapter, deadline, consumer_grace, &mut report).await;
        }

        drop(self.hub);
        let mut hub_task = self.hub_task;
        match timeout_at(Instant::now() + self.hub_grace, &mut hub_task).await {
            Ok(Ok(())) => report.hub_stopped = true,
            Ok(Err(e)) => error!(error = %e, "Data hub task failed"),
            Err(_) => {
                warn!("Data hub did not stop, aborting");
                hub_task.abort();
            }
        }

        metrics::gauge!("lifecycle.adapters.running").set(0.0);
        if report.is_clean() {
            info!(stopped = report.stopped.len(), "Shutdown complete");
        } else {
            warn!(
                timed_out = report.timed_out.len(),
                panicked = report.panicked.len(),
                "Shutdown finished with problems"
            );
        }
        report
    }
}

async fn join_until(
    adapter: RunningAdapter,
    deadline: Instant,
    grace: Duration,
    report: &mut ShutdownReport,
) {
    let RunningAdapter {
        name,
        role,
        mut handle,
    } = adapter;
    match timeout_at(deadline, &mut handle).await {
        Ok(Ok(())) => report.stopped.push(name),
        Ok(Err(e)) => {
            error!(adapter = %name, error = %e, "Adapter task panicked");
            report.panicked.push(name);
        }
        Err(_) => {
            handle.abort();
            let timeout = ShutdownTimeout {
                adapter: name,
                grace,
            };
            warn!(role = ?role, "{}", timeout);
            metrics::counter!("lifecycle.shutdown_timeouts_total").increment(1);
            report.timed_out.push(timeout);
        }
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C only on non-unix targets)
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT (Ctrl+C), shutting down..."),
            Err(err) => {
                error!("Failed to listen for SIGINT signal: {}", err);
                std::future::pending::<()>().await;
            }
        }
    }
}
