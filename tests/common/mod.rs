//! Shared helpers for hub integration tests
//!
//! `Recorder` is a consuming adapter that forwards every data item it gets to
//! a channel the test can read from, and reports when it saw the sentinel.

#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use flightbox::{Adapter, AdapterContext, Item, Message, Subscription};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub enum Recorded {
    Item(Item),
    Sentinel,
}

pub struct Recorder {
    name: String,
    subscription: Subscription,
    tx: flume::Sender<Recorded>,
}

impl Recorder {
    pub fn new(name: &str, subscription: Subscription) -> (Self, flume::Receiver<Recorded>) {
        let (tx, rx) = flume::unbounded();
        (
            Self {
                name: name.to_string(),
                subscription,
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Adapter for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribed_types(&self) -> Option<Subscription> {
        Some(self.subscription.clone())
    }

    async fn run(self: Box<Self>, mut ctx: AdapterContext) -> anyhow::Result<()> {
        let inbox = ctx.take_inbox()?;
        while let Some(message) = inbox.recv().await {
            match message {
                Message::Data(item) => {
                    let _ = self.tx.send(Recorded::Item(item));
                }
                Message::Shutdown => {
                    let _ = self.tx.send(Recorded::Sentinel);
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Every item recorded until the sentinel (or the channel goes quiet)
pub async fn drain_items(rx: &flume::Receiver<Recorded>) -> (Vec<Item>, bool) {
    let mut items = Vec::new();
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, rx.recv_async()).await {
            Ok(Ok(Recorded::Item(item))) => items.push(item),
            Ok(Ok(Recorded::Sentinel)) => return (items, true),
            Ok(Err(_)) | Err(_) => return (items, false),
        }
    }
}

/// Next recorded item, failing the test after `RECV_TIMEOUT`
pub async fn next_item(rx: &flume::Receiver<Recorded>) -> Item {
    match tokio::time::timeout(RECV_TIMEOUT, rx.recv_async()).await {
        Ok(Ok(Recorded::Item(item))) => item,
        Ok(Ok(Recorded::Sentinel)) => panic!("got sentinel instead of an item"),
        _ => panic!("no item within {RECV_TIMEOUT:?}"),
    }
}
