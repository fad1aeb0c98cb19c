//! Capability contract shared by inputs, transformations and outputs
//!
//! The coordinator starts an adapter by registering its subscription (if any)
//! and spawning [`Adapter::run`]; it stops producers through the context's
//! cancellation token and consumers through the hub's shutdown sentinel.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::data_hub::{HubHandle, Inbox, Subscription};

/// How an adapter relates to the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes only
    Producer,
    /// Consumes only
    Consumer,
    /// Consumes and publishes results back (transformation stages)
    Transformer,
}

/// Everything an adapter needs at run time, handed down by the coordinator
pub struct AdapterContext {
    pub hub: HubHandle,
    /// Present for adapters that declared a subscription
    pub inbox: Option<Inbox>,
    /// Cancelled when producers must stop reading their source
    pub cancel: CancellationToken,
}

impl AdapterContext {
    /// Inbox of a consuming adapter
    pub fn take_inbox(&mut self) -> anyhow::Result<Inbox> {
        self.inbox
            .take()
            .ok_or_else(|| anyhow::anyhow!("adapter was started without a subscription"))
    }
}

#[async_trait]
pub trait Adapter: Send + 'static {
    /// Stable name used in logs and `list_clients`-style diagnostics
    fn name(&self) -> &str;

    /// Content types this adapter consumes; `None` for pure producers
    fn subscribed_types(&self) -> Option<Subscription> {
        None
    }

    /// Whether results are published back into the hub while consuming
    fn republishes(&self) -> bool {
        false
    }

    fn role(&self) -> Role {
        match (self.subscribed_types().is_some(), self.republishes()) {
            (false, _) => Role::Producer,
            (true, false) => Role::Consumer,
            (true, true) => Role::Transformer,
        }
    }

    /// Run until the source is exhausted, the token is cancelled or the
    /// shutdown sentinel arrives
    async fn run(self: Box<Self>, ctx: AdapterContext) -> anyhow::Result<()>;
}
