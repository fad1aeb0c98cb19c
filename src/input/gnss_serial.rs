//! GNSS receiver on a serial line
//!
//! A blocking reader thread assembles NMEA lines from the port and forwards
//! every complete, checksum-valid sentence to the async side, which publishes
//! it as a `gnss` item. Partial and corrupted lines never leave the reader.

use std::io::{ErrorKind, Read};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adapter::{Adapter, AdapterContext};
use crate::codec::Sentence;
use crate::error::{ProducerIoError, PublishError};
use crate::item::{ContentType, Item};
use crate::queue_config::SERIAL_LINE_QUEUE_SIZE;

/// NMEA 0183 caps sentences at 82 characters; leave room for proprietary ones
const MAX_LINE_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssSerialConfig {
    pub device: String,
    pub baud_rate: u32,
}

impl Default for GnssSerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyAMA0".to_string(),
            baud_rate: 9600,
        }
    }
}

/// Splits a byte stream into lines, discarding anything that grows past
/// `MAX_LINE_LEN` without a terminator
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
    overflowed: bool,
}

impl LineAssembler {
    /// Feed bytes, returning every line completed by them (without CR/LF)
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            match b {
                b'\n' => {
                    if !self.overflowed && !self.buf.is_empty() {
                        let line = String::from_utf8_lossy(&self.buf);
                        let line = line.trim_end_matches('\r');
                        if !line.is_empty() {
                            lines.push(line.to_string());
                        }
                    }
                    self.buf.clear();
                    self.overflowed = false;
                }
                _ if self.overflowed => {}
                _ => {
                    if self.buf.len() >= MAX_LINE_LEN {
                        self.overflowed = true;
                        self.buf.clear();
                    } else {
                        self.buf.push(b);
                    }
                }
            }
        }
        lines
    }
}

/// Blocking read loop; returns when the source ends, fails, the consumer side
/// goes away or `cancel` fires
fn read_lines<R: Read>(
    mut source: R,
    tx: &flume::Sender<String>,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let mut assembler = LineAssembler::default();
    let mut chunk = [0u8; 512];

    while !cancel.is_cancelled() {
        let n = match source.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => continue,
            Err(e) => return Err(e),
        };

        for line in assembler.push(&chunk[..n]) {
            if let Err(e) = Sentence::parse(&line) {
                metrics::counter!("gnss.sentences.invalid_total").increment(1);
                trace!(error = %e, "discarding GNSS line: {}", line);
                continue;
            }
            match tx.try_send(line) {
                Ok(()) => {}
                Err(flume::TrySendError::Full(_)) => {
                    metrics::counter!("gnss.sentences.dropped_total").increment(1);
                }
                Err(flume::TrySendError::Disconnected(_)) => return Ok(()),
            }
        }
    }
    Ok(())
}

pub struct GnssSerialInput {
    name: String,
    config: GnssSerialConfig,
}

impl GnssSerialInput {
    pub fn new(name: impl Into<String>, config: GnssSerialConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Forward verified lines from the reader thread into the hub
async fn publish_lines(
    rx: flume::Receiver<String>,
    ctx: &AdapterContext,
) {
    loop {
        let line = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            line = rx.recv_async() => match line {
                Ok(line) => line,
                Err(_) => break,
            },
        };
        match ctx.hub.publish(Item::text(ContentType::Gnss, line)).await {
            Ok(()) => metrics::counter!("gnss.sentences.published_total").increment(1),
            Err(PublishError::HubClosed) => break,
            Err(e) => debug!(error = %e, "dropping GNSS sentence"),
        }
    }
}

#[async_trait]
impl Adapter for GnssSerialInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, ctx: AdapterContext) -> Result<()> {
        let port = serialport::new(&self.config.device, self.config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| ProducerIoError {
                adapter: self.name.clone(),
                source: e.into(),
            })?;
        info!(
            device = %self.config.device,
            baud = self.config.baud_rate,
            "Opened GNSS serial port"
        );

        let (tx, rx) = flume::bounded::<String>(SERIAL_LINE_QUEUE_SIZE);
        let reader_cancel = ctx.cancel.clone();
        let reader = tokio::task::spawn_blocking(move || read_lines(port, &tx, &reader_cancel));

        publish_lines(rx, &ctx).await;

        // Dropping the receiver above lets a reader blocked on a full queue exit
        match reader.await {
            Ok(Ok(())) => {
                info!("GNSS serial input stopped");
                Ok(())
            }
            Ok(Err(source)) => {
                warn!(error = %source, "GNSS serial port failed");
                Err(ProducerIoError {
                    adapter: self.name.clone(),
                    source,
                }
                .into())
            }
            Err(e) => Err(anyhow::anyhow!("GNSS reader thread panicked: {e}")),
        }
    }
}
