//! Content-routed data hub
//!
//! Producers call [`HubHandle::publish`]; the single hub loop ([`DataHub::run`])
//! pulls items in arrival order and copies each one into the inbox of every
//! consumer whose [`Subscription`] matches the item's content type.
//! Registration, deregistration and shutdown travel over the same queue as the
//! data, so the registry has exactly one writer and a producer's own
//! register/publish sequence is applied in order.
//!
//! Shutdown is two-phased. Stages that republish into the hub receive the
//! sentinel first and answer with [`HubHandle::propagate_shutdown`] once their
//! last result is published; only then (or when the grace period runs out) do
//! the remaining consumers get the sentinel and the loop exits.

pub mod subscription;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, trace, warn};

use crate::error::{PublishError, RegistrationError};
use crate::item::{Item, Message};
use crate::queue_config::{CONSUMER_INBOX_SIZE, HUB_INBOUND_QUEUE_SIZE, queue_warning_threshold};

pub use subscription::{ANY, ConsumerId, Subscription};
use subscription::{ConsumerEntry, Registry};

/// What the hub does when a consumer inbox is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Drop the item for that consumer only
    Drop,
    /// Wait up to `HubConfig::delivery_wait` for room, then drop
    Wait,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub inbound_queue_size: usize,
    pub inbox_size: usize,
    pub overflow: OverflowPolicy,
    /// How long `publish` may wait for room in the inbound queue
    pub publish_wait: Duration,
    /// Bounded wait per consumer under [`OverflowPolicy::Wait`]
    pub delivery_wait: Duration,
    /// How long republishing stages get to propagate the sentinel
    pub shutdown_grace: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbound_queue_size: HUB_INBOUND_QUEUE_SIZE,
            inbox_size: CONSUMER_INBOX_SIZE,
            overflow: OverflowPolicy::Drop,
            publish_wait: Duration::from_millis(500),
            delivery_wait: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

enum HubCommand {
    Publish(Item),
    Register {
        id: ConsumerId,
        name: String,
        subscription: Subscription,
        republishes: bool,
        inbox: Sender<Message>,
    },
    Deregister(ConsumerId),
    Shutdown,
    /// A republishing stage has flushed its output and passed the sentinel on
    Propagated(ConsumerId),
}

/// Cloneable handle used by producers and consumers to talk to the hub
#[derive(Clone)]
pub struct HubHandle {
    tx: Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
    inbox_size: usize,
    publish_wait: Duration,
}

impl HubHandle {
    /// Enqueue an item for routing
    ///
    /// Returns immediately when the inbound queue has room, otherwise waits at
    /// most `publish_wait` before giving up with
    /// [`PublishError::BackpressureOverflow`].
    pub async fn publish(&self, item: Item) -> Result<(), PublishError> {
        match self.tx.try_send(HubCommand::Publish(item)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(PublishError::HubClosed),
            Err(TrySendError::Full(cmd)) => {
                metrics::counter!("hub.inbound_queue.full_total").increment(1);
                match timeout(self.publish_wait, self.tx.send_async(cmd)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(PublishError::HubClosed),
                    Err(_) => {
                        metrics::counter!("hub.items.rejected_total").increment(1);
                        Err(PublishError::BackpressureOverflow(self.publish_wait))
                    }
                }
            }
        }
    }

    /// Blocking variant of [`publish`](Self::publish) for producers running on
    /// their own OS thread (serial readers)
    pub fn publish_blocking(&self, item: Item) -> Result<(), PublishError> {
        match self
            .tx
            .send_timeout(HubCommand::Publish(item), self.publish_wait)
        {
            Ok(()) => Ok(()),
            Err(flume::SendTimeoutError::Disconnected(_)) => Err(PublishError::HubClosed),
            Err(flume::SendTimeoutError::Timeout(_)) => {
                metrics::counter!("hub.items.rejected_total").increment(1);
                Err(PublishError::BackpressureOverflow(self.publish_wait))
            }
        }
    }

    /// Register a consumer and get its inbox
    ///
    /// The registration is queued ahead of anything this caller publishes
    /// afterwards, so the consumer sees every matching item published after
    /// this call returns.
    pub async fn register(
        &self,
        name: impl Into<String>,
        subscription: Subscription,
        republishes: bool,
    ) -> Result<Inbox, RegistrationError> {
        let name = name.into();
        if subscription.is_empty() {
            return Err(RegistrationError::EmptySubscription(name));
        }

        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (inbox_tx, inbox_rx) = flume::bounded(self.inbox_size);

        self.tx
            .send_async(HubCommand::Register {
                id,
                name: name.clone(),
                subscription,
                republishes,
                inbox: inbox_tx,
            })
            .await
            .map_err(|_| RegistrationError::HubClosed)?;

        Ok(Inbox {
            id,
            name,
            rx: inbox_rx,
            hub: self.clone(),
        })
    }

    /// Remove a consumer; unknown ids are logged and ignored
    pub async fn deregister(&self, id: ConsumerId) {
        // A closed hub has no registry left to clean up
        let _ = self.tx.send_async(HubCommand::Deregister(id)).await;
    }

    /// Start the shutdown sequence; calling it more than once is harmless
    pub async fn shutdown(&self) -> Result<(), PublishError> {
        self.tx
            .send_async(HubCommand::Shutdown)
            .await
            .map_err(|_| PublishError::HubClosed)
    }

    /// Pass the sentinel back to the hub after the stage's last publish
    pub async fn propagate_shutdown(&self, id: ConsumerId) -> Result<(), PublishError> {
        self.tx
            .send_async(HubCommand::Propagated(id))
            .await
            .map_err(|_| PublishError::HubClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }

    /// Items waiting in the hub inbound queue
    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }
}

/// Receiving end of a consumer registration
pub struct Inbox {
    id: ConsumerId,
    name: String,
    rx: Receiver<Message>,
    hub: HubHandle,
}

impl Inbox {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next message; `None` once the hub has gone away without a sentinel
    pub async fn recv(&self) -> Option<Message> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Deregister explicitly; dropping the inbox has the same effect on the
    /// next dispatch that targets it
    pub async fn close(self) {
        self.hub.deregister(self.id).await;
    }
}

enum Delivery {
    Delivered,
    Dropped,
    Closed,
}

enum Phase {
    Running,
    /// Waiting for republishing stages to propagate the sentinel
    Draining {
        deadline: Instant,
        waiting: HashSet<ConsumerId>,
    },
}

/// The hub processing loop; owns the subscription registry
pub struct DataHub {
    rx: Receiver<HubCommand>,
    registry: Registry,
    config: HubConfig,
    phase: Phase,
}

impl DataHub {
    pub fn new(config: HubConfig) -> (DataHub, HubHandle) {
        let (tx, rx) = flume::bounded(config.inbound_queue_size);
        let handle = HubHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            inbox_size: config.inbox_size,
            publish_wait: config.publish_wait,
        };
        let hub = DataHub {
            rx,
            registry: Registry::default(),
            config,
            phase: Phase::Running,
        };
        (hub, handle)
    }

    /// Route items until shutdown completes or every handle is dropped
    pub async fn run(mut self) {
        info!(
            inbound_queue_size = self.config.inbound_queue_size,
            overflow = ?self.config.overflow,
            "Data hub running"
        );
        let warn_depth = queue_warning_threshold(self.config.inbound_queue_size);

        loop {
            let next = match &self.phase {
                Phase::Running => self.rx.recv_async().await.ok(),
                Phase::Draining { deadline, waiting } => {
                    match timeout_at(*deadline, self.rx.recv_async()).await {
                        Ok(cmd) => cmd.ok(),
                        Err(_) => {
                            let names: Vec<String> = waiting
                                .iter()
                                .filter_map(|id| self.registry.get(*id).map(|e| e.name.clone()))
                                .collect();
                            warn!(
                                stages = ?names,
                                "Grace period expired before all stages propagated shutdown"
                            );
                            break;
                        }
                    }
                }
            };

            let Some(cmd) = next else {
                info!("All hub handles dropped");
                break;
            };

            let depth = self.rx.len();
            metrics::gauge!("hub.inbound_queue.depth").set(depth as f64);
            if depth >= warn_depth {
                warn!(depth, "Data hub inbound queue is filling up");
            }

            if self.handle(cmd).await {
                break;
            }
        }

        self.finish().await;
        info!("Data hub stopped");
    }

    /// Returns true when the loop should stop
    async fn handle(&mut self, cmd: HubCommand) -> bool {
        match cmd {
            HubCommand::Publish(item) => {
                self.dispatch(item).await;
                false
            }
            HubCommand::Register {
                id,
                name,
                subscription,
                republishes,
                inbox,
            } => {
                let entry = ConsumerEntry {
                    name: name.clone(),
                    subscription: subscription.clone(),
                    inbox,
                    republishes,
                    pilled: false,
                };
                match self.registry.register(id, entry) {
                    Ok(()) => {
                        info!(consumer = %id, name = %name, subscription = %subscription, "Consumer registered");
                        metrics::gauge!("hub.consumers.registered").set(self.registry.len() as f64);
                    }
                    Err(e) => warn!(consumer = %id, name = %name, error = %e, "Registration rejected"),
                }
                false
            }
            HubCommand::Deregister(id) => {
                self.remove(id);
                self.propagation_done(id)
            }
            HubCommand::Shutdown => self.begin_shutdown().await,
            HubCommand::Propagated(id) => {
                debug!(consumer = %id, "Stage propagated shutdown");
                self.remove(id);
                self.propagation_done(id)
            }
        }
    }

    async fn dispatch(&mut self, item: Item) {
        metrics::counter!("hub.items.published_total").increment(1);
        let targets = self.registry.matching(item.content_type());
        if targets.is_empty() {
            trace!(content_type = %item.content_type(), "No subscriber for item");
            return;
        }

        let mut closed = Vec::new();
        for id in targets {
            let Some(entry) = self.registry.get(id) else {
                continue;
            };
            if entry.pilled {
                debug!(consumer = %id, content_type = %item.content_type(), "Consumer already stopping, item not delivered");
                continue;
            }

            match self
                .deliver(&entry.inbox, Message::Data(item.clone()))
                .await
            {
                Delivery::Delivered => {
                    metrics::counter!("hub.items.delivered_total").increment(1);
                    metrics::histogram!("hub.delivery.latency_seconds")
                        .record(item.age().as_secs_f64());
                }
                Delivery::Dropped => {
                    metrics::counter!("hub.items.dropped_total").increment(1);
                    warn!(consumer = %id, name = %entry.name, content_type = %item.content_type(), "Consumer inbox full, item dropped");
                }
                Delivery::Closed => closed.push(id),
            }
        }

        for id in closed {
            info!(consumer = %id, "Consumer inbox closed, deregistering");
            self.remove(id);
        }
    }

    async fn deliver(&self, inbox: &Sender<Message>, message: Message) -> Delivery {
        match inbox.try_send(message) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Disconnected(_)) => Delivery::Closed,
            Err(TrySendError::Full(message)) => match self.config.overflow {
                OverflowPolicy::Drop => Delivery::Dropped,
                OverflowPolicy::Wait => {
                    match timeout(self.config.delivery_wait, inbox.send_async(message)).await {
                        Ok(Ok(())) => Delivery::Delivered,
                        Ok(Err(_)) => Delivery::Closed,
                        Err(_) => Delivery::Dropped,
                    }
                }
            },
        }
    }

    fn remove(&mut self, id: ConsumerId) {
        match self.registry.deregister(id) {
            Ok(entry) => {
                info!(consumer = %id, name = %entry.name, "Consumer deregistered");
                metrics::gauge!("hub.consumers.registered").set(self.registry.len() as f64);
            }
            Err(e) => debug!(error = %e, "Deregister ignored"),
        }
    }

    /// Returns true when the last awaited stage is gone
    fn propagation_done(&mut self, id: ConsumerId) -> bool {
        match &mut self.phase {
            Phase::Running => false,
            Phase::Draining { waiting, .. } => {
                waiting.remove(&id);
                waiting.is_empty()
            }
        }
    }

    async fn begin_shutdown(&mut self) -> bool {
        if matches!(self.phase, Phase::Draining { .. }) {
            debug!("Shutdown already in progress");
            return false;
        }

        let stages: Vec<ConsumerId> = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| self.registry.get(*id).is_some_and(|e| e.republishes))
            .collect();
        info!(
            consumers = self.registry.len(),
            republishing_stages = stages.len(),
            "Shutdown requested"
        );

        let mut waiting = HashSet::new();
        for id in stages {
            if self.send_sentinel(id).await {
                waiting.insert(id);
            }
        }

        if waiting.is_empty() {
            return true;
        }
        self.phase = Phase::Draining {
            deadline: Instant::now() + self.config.shutdown_grace,
            waiting,
        };
        false
    }

    /// Hand the sentinel to one consumer; false if it could not be delivered
    async fn send_sentinel(&mut self, id: ConsumerId) -> bool {
        let grace = self.config.shutdown_grace;
        let Some(entry) = self.registry.get_mut(id) else {
            return false;
        };
        entry.pilled = true;
        match timeout(grace, entry.inbox.send_async(Message::Shutdown)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                debug!(consumer = %id, "Inbox closed before shutdown sentinel");
                false
            }
            Err(_) => {
                warn!(consumer = %id, name = %entry.name, "Could not deliver shutdown sentinel within grace period");
                false
            }
        }
    }

    /// Sentinel to every consumer that has not had one yet
    async fn finish(&mut self) {
        for id in self.registry.ids() {
            if self.registry.get(id).is_some_and(|e| !e.pilled) {
                self.send_sentinel(id).await;
            }
        }
        metrics::gauge!("hub.consumers.registered").set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ContentType;

    fn test_config() -> HubConfig {
        HubConfig {
            inbound_queue_size: 16,
            inbox_size: 4,
            overflow: OverflowPolicy::Drop,
            publish_wait: Duration::from_millis(20),
            delivery_wait: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(500),
        }
    }

    async fn expect_data(inbox: &Inbox) -> Item {
        match timeout(Duration::from_secs(1), inbox.recv()).await {
            Ok(Some(Message::Data(item))) => item,
            other => panic!("expected data, got {:?}", other.map(|m| m.map(|_| ()))),
        }
    }

    #[tokio::test]
    async fn test_routes_by_content_type() {
        let (hub, handle) = DataHub::new(test_config());
        let task = tokio::spawn(hub.run());

        let nmea = handle
            .register("nmea-only", Subscription::to(["nmea"]), false)
            .await
            .unwrap();
        let sbs = handle
            .register("sbs-only", Subscription::to(["sbs1"]), false)
            .await
            .unwrap();

        handle
            .publish(Item::text(ContentType::Nmea, "$A*00"))
            .await
            .unwrap();

        let got = expect_data(&nmea).await;
        assert_eq!(got.payload_str(), Some("$A*00"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sbs.try_recv().is_none());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_inbox_drops_for_that_consumer_only() {
        let (hub, handle) = DataHub::new(test_config());
        let task = tokio::spawn(hub.run());

        let slow = handle
            .register("slow", Subscription::Any, false)
            .await
            .unwrap();
        let fast = handle
            .register("fast", Subscription::Any, false)
            .await
            .unwrap();

        for i in 0..10 {
            handle
                .publish(Item::text(ContentType::Sbs1, format!("line {i}")))
                .await
                .unwrap();
            // keep the fast consumer drained
            expect_data(&fast).await;
        }

        let mut slow_count = 0;
        while let Some(Message::Data(_)) = slow.try_recv() {
            slow_count += 1;
        }
        assert_eq!(slow_count, 4);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_inbox_is_deregistered() {
        let (hub, handle) = DataHub::new(test_config());
        let task = tokio::spawn(hub.run());

        let gone = handle
            .register("gone", Subscription::Any, false)
            .await
            .unwrap();
        let stays = handle
            .register("stays", Subscription::Any, false)
            .await
            .unwrap();
        drop(gone);

        handle
            .publish(Item::text(ContentType::Gnss, "$GPGGA*00"))
            .await
            .unwrap();
        expect_data(&stays).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(stays.recv().await, Some(Message::Shutdown)));
    }

    #[tokio::test]
    async fn test_deregister_twice_is_harmless() {
        let (hub, handle) = DataHub::new(test_config());
        let task = tokio::spawn(hub.run());

        let inbox = handle
            .register("twice", Subscription::Any, false)
            .await
            .unwrap();
        let id = inbox.id();
        handle.deregister(id).await;
        handle.deregister(id).await;
        inbox.close().await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let (hub, handle) = DataHub::new(test_config());
        let task = tokio::spawn(hub.run());

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(
            handle
                .publish(Item::text(ContentType::Nmea, "late"))
                .await
                .err(),
            Some(PublishError::HubClosed)
        );
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_empty_subscription_rejected() {
        let (_hub, handle) = DataHub::new(test_config());
        let result = handle
            .register("nothing", Subscription::to(Vec::<&str>::new()), false)
            .await;
        assert_eq!(
            result.err().map(|e| e.to_string()),
            Some("consumer 'nothing' subscribed to an empty content type set".to_string())
        );
    }
}
