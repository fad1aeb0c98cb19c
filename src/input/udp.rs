use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::adapter::{Adapter, AdapterContext};
use crate::error::{ProducerIoError, PublishError};
use crate::item::{ContentType, Item};

const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpInputConfig {
    pub bind_address: String,
    /// SoftRF telemetry port
    pub port: u16,
    /// Content type attached to every datagram
    pub content_type: ContentType,
}

impl Default for UdpInputConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 10110,
            content_type: ContentType::Nmea,
        }
    }
}

/// Publishes each datagram, trimmed, as one item
pub struct UdpInput {
    name: String,
    config: UdpInputConfig,
    socket: Option<UdpSocket>,
}

impl UdpInput {
    pub fn new(name: impl Into<String>, config: UdpInputConfig) -> Self {
        Self {
            name: name.into(),
            config,
            socket: None,
        }
    }

    /// Use an already bound socket (tests bind port 0)
    pub fn with_socket(name: impl Into<String>, config: UdpInputConfig, socket: UdpSocket) -> Self {
        Self {
            name: name.into(),
            config,
            socket: Some(socket),
        }
    }
}

#[async_trait]
impl Adapter for UdpInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, ctx: AdapterContext) -> Result<()> {
        let socket = match self.socket {
            Some(socket) => socket,
            None => {
                let address = format!("{}:{}", self.config.bind_address, self.config.port);
                UdpSocket::bind(&address)
                    .await
                    .map_err(|source| ProducerIoError {
                        adapter: self.name.clone(),
                        source,
                    })
                    .with_context(|| format!("Failed to bind UDP input on {address}"))?
            }
        };
        info!(
            local = ?socket.local_addr().ok(),
            content_type = %self.config.content_type,
            "UDP input listening"
        );

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, peer) = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP errors surface here on some platforms; the socket stays usable
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                },
            };
            metrics::counter!("udp.datagrams.received_total").increment(1);

            let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                debug!(%peer, len, "dropping non UTF-8 datagram");
                metrics::counter!("udp.datagrams.invalid_total").increment(1);
                continue;
            };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            trace!(%peer, "datagram: {}", text);

            match ctx
                .hub
                .publish(Item::text(self.config.content_type.clone(), text))
                .await
            {
                Ok(()) => {}
                Err(PublishError::HubClosed) => break,
                Err(e) => warn!(error = %e, "dropping datagram"),
            }
        }

        info!("UDP input stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_hub::{DataHub, HubConfig, Subscription};
    use crate::item::Message;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_datagram_becomes_trimmed_nmea_item() {
        let (hub, handle) = DataHub::new(HubConfig::default());
        tokio::spawn(hub.run());
        let inbox = handle
            .register("test", Subscription::to([ContentType::Nmea]), false)
            .await
            .unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = socket.local_addr().unwrap();
        let input = Box::new(UdpInput::with_socket("softrf", UdpInputConfig::default(), socket));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(input.run(AdapterContext {
            hub: handle.clone(),
            inbox: None,
            cancel: cancel.clone(),
        }));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"  $PFLAU,0,0,0,1,0,,0,,*4F\r\n", target)
            .await
            .unwrap();

        match inbox.recv().await {
            Some(Message::Data(item)) => {
                assert_eq!(item.content_type(), &ContentType::Nmea);
                assert_eq!(item.payload_str(), Some("$PFLAU,0,0,0,1,0,,0,,*4F"));
            }
            _ => panic!("expected a data item"),
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
