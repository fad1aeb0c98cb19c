use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::adapter::{Adapter, AdapterContext};
use crate::data_hub::HubHandle;
use crate::error::{ProducerIoError, PublishError};
use crate::item::{ContentType, Item};

/// Result type for connection attempts
enum ConnectionResult {
    /// Cancelled, or the server closed the stream cleanly
    Finished,
    /// Connection failed immediately (couldn't establish connection)
    ConnectionFailed(std::io::Error),
    /// Connection was established but failed during operation
    OperationFailed(anyhow::Error),
}

/// Configuration for the SBS1 client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sbs1ClientConfig {
    pub host: String,
    /// Typically 30003
    pub port: u16,
    /// Consecutive failed connection attempts before giving up
    pub max_retries: u32,
    /// Initial delay between reconnection attempts (doubles up to the cap)
    pub retry_delay_seconds: u64,
    pub max_retry_delay_seconds: u64,
    /// Reconnect when the server stays silent this long
    pub idle_timeout_seconds: u64,
}

impl Default for Sbs1ClientConfig {
    fn default() -> Self {
        Self {
            host: "rbpi2".to_string(),
            port: 30003,
            max_retries: 5,
            retry_delay_seconds: 1,
            max_retry_delay_seconds: 60,
            idle_timeout_seconds: 300,
        }
    }
}

/// Reads SBS1 records from a BaseStation-style TCP feed and publishes each
/// complete line as an `sbs1` item
pub struct Sbs1Client {
    name: String,
    config: Sbs1ClientConfig,
}

impl Sbs1Client {
    pub fn new(name: impl Into<String>, config: Sbs1ClientConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    async fn connect_and_process(&self, hub: &HubHandle, cancel: &CancellationToken) -> ConnectionResult {
        let address = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to SBS1 server at {}", address);

        let stream = tokio::select! {
            _ = cancel.cancelled() => return ConnectionResult::Finished,
            result = TcpStream::connect(&address) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    metrics::gauge!("sbs1.connection.connected").set(0.0);
                    return ConnectionResult::ConnectionFailed(e);
                }
            },
        };

        info!("Connected to SBS1 server at {}", address);
        metrics::gauge!("sbs1.connection.connected").set(1.0);
        let result = self.process_connection(stream, hub, cancel).await;
        metrics::gauge!("sbs1.connection.connected").set(0.0);
        result
    }

    async fn process_connection(
        &self,
        stream: TcpStream,
        hub: &HubHandle,
        cancel: &CancellationToken,
    ) -> ConnectionResult {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_seconds);
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(256);
        let mut line_count = 0u64;
        let connection_start = std::time::Instant::now();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        "Closing SBS1 connection to {} after {:.1}s, received {} lines",
                        peer,
                        connection_start.elapsed().as_secs_f64(),
                        line_count
                    );
                    return ConnectionResult::Finished;
                }
                result = tokio::time::timeout(idle_timeout, reader.read_until(b'\n', &mut buf)) => result,
            };

            match read {
                Err(_) => {
                    warn!(
                        "SBS1 connection to {} idle for {}s",
                        peer,
                        idle_timeout.as_secs()
                    );
                    return ConnectionResult::OperationFailed(anyhow::anyhow!("connection timed out"));
                }
                Ok(Ok(0)) => {
                    if !buf.is_empty() {
                        // Never publish the incomplete tail of the stream
                        metrics::counter!("sbs1.lines.partial_total").increment(1);
                        trace!("Discarding {} bytes of partial record", buf.len());
                    }
                    info!(
                        "SBS1 connection closed by server {} after {:.1}s, received {} lines",
                        peer,
                        connection_start.elapsed().as_secs_f64(),
                        line_count
                    );
                    return ConnectionResult::OperationFailed(anyhow::anyhow!("connection closed by server"));
                }
                Ok(Ok(_)) => {
                    if buf.last() != Some(&b'\n') {
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    buf.clear();
                    if line.is_empty() {
                        continue;
                    }
                    metrics::counter!("sbs1.bytes.received_total").increment(line.len() as u64);
                    line_count += 1;
                    if let Err(PublishError::HubClosed) = publish_line(hub, line).await {
                        return ConnectionResult::Finished;
                    }
                }
                Ok(Err(e)) => {
                    error!("SBS1 read error from {}: {}", peer, e);
                    return ConnectionResult::OperationFailed(e.into());
                }
            }
        }
    }
}

async fn publish_line(hub: &HubHandle, line: String) -> Result<(), PublishError> {
    trace!("Received SBS1 line: {}", line);
    match hub.publish(Item::text(ContentType::Sbs1, line)).await {
        Ok(()) => {
            metrics::counter!("sbs1.lines.published_total").increment(1);
            Ok(())
        }
        Err(e) => {
            metrics::counter!("sbs1.lines.dropped_total").increment(1);
            warn!("Failed to publish SBS1 line: {}", e);
            Err(e)
        }
    }
}

#[async_trait]
impl Adapter for Sbs1Client {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, ctx: AdapterContext) -> Result<()> {
        let mut retry_count = 0;
        let mut current_delay = self.config.retry_delay_seconds;

        loop {
            match self.connect_and_process(&ctx.hub, &ctx.cancel).await {
                ConnectionResult::Finished => break,
                ConnectionResult::ConnectionFailed(e) => {
                    retry_count += 1;
                    metrics::counter!("sbs1.connection.failed_total").increment(1);
                    if retry_count > self.config.max_retries {
                        error!(
                            "Max retries ({}) exceeded for SBS1 server {}:{}, giving up",
                            self.config.max_retries, self.config.host, self.config.port
                        );
                        return Err(ProducerIoError {
                            adapter: self.name.clone(),
                            source: e,
                        }
                        .into());
                    }
                    warn!(
                        "Failed to connect to SBS1 server {}:{} (attempt {}/{}): {} - retrying in {}s",
                        self.config.host,
                        self.config.port,
                        retry_count,
                        self.config.max_retries,
                        e,
                        current_delay
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => break,
                        _ = sleep(Duration::from_secs(current_delay)) => {}
                    }
                    current_delay = (current_delay * 2).clamp(1, self.config.max_retry_delay_seconds.max(1));
                }
                ConnectionResult::OperationFailed(e) => {
                    metrics::counter!("sbs1.connection.operation_failed_total").increment(1);
                    warn!("SBS1 connection failed during operation: {} - reconnecting in 1s", e);
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                    // The connection worked, start backing off from scratch
                    retry_count = 0;
                    current_delay = self.config.retry_delay_seconds;
                }
            }
        }

        info!("SBS1 client stopped");
        Ok(())
    }
}
