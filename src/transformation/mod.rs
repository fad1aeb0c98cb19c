//! SBS1 to traffic-frame transformation stage
//!
//! Each SBS1 record carrying a position is re-encoded as a `$PFBTP` sentence,
//! the sentence is decoded again (checksum verified) and turned into a binary
//! traffic frame relative to the current reference position. Both results go
//! back into the hub as new items: the sentence as `nmea`, the frame as `flarm`.

pub mod state;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::adapter::{Adapter, AdapterContext};
use crate::codec::{self, AlarmThresholds, TrafficFrame, TrafficPosition, sbs1};
use crate::data_hub::Subscription;
use crate::error::DecodeError;
use crate::geometry::Position;
use crate::item::{ContentType, Item, Message};

pub use state::{PipelineState, StateMachine};

#[derive(Debug, Clone)]
pub struct TransformationConfig {
    /// Fallback reference when no GNSS fix is available
    pub static_reference: Option<Position>,
    /// Also subscribe to `gnss` and track the own-ship fix
    pub use_gnss_reference: bool,
    pub thresholds: AlarmThresholds,
    /// Pass the sentinel back to the hub instead of just leaving
    pub propagate_shutdown: bool,
    /// Publish the intermediate `$PFBTP` sentence as an `nmea` item
    pub emit_nmea: bool,
}

impl Default for TransformationConfig {
    fn default() -> Self {
        Self {
            static_reference: None,
            use_gnss_reference: false,
            thresholds: AlarmThresholds::default(),
            propagate_shutdown: true,
            emit_nmea: true,
        }
    }
}

/// Where the current reference position came from
#[derive(Debug, Default)]
struct ReferenceTracker {
    gnss: Option<Position>,
    fallback: Option<Position>,
}

impl ReferenceTracker {
    fn current(&self) -> Option<&Position> {
        self.gnss.as_ref().or(self.fallback.as_ref())
    }

    /// RMC fixes carry no altitude; the last known one is kept
    fn update(&mut self, fix: Position) {
        let altitude_m = fix
            .altitude_m
            .or_else(|| self.gnss.as_ref().and_then(|p| p.altitude_m));
        self.gnss = Some(Position { altitude_m, ..fix });
    }

    fn lost(&mut self) {
        self.gnss = None;
    }
}

pub struct Sbs1ToFlarmTransformation {
    name: String,
    config: TransformationConfig,
    reference: ReferenceTracker,
    state: StateMachine,
}

impl Sbs1ToFlarmTransformation {
    pub fn new(name: impl Into<String>, config: TransformationConfig) -> Self {
        let reference = ReferenceTracker {
            gnss: None,
            fallback: config.static_reference,
        };
        Self {
            name: name.into(),
            config,
            reference,
            state: StateMachine::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    /// Watch the stage state from another task
    pub fn state_watch(&self) -> tokio::sync::watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Items to publish for one input item
    ///
    /// SBS1 records without a position and GNSS fixes produce nothing.
    pub fn transform(&mut self, item: &Item) -> Result<Vec<Item>, DecodeError> {
        let line = codec::payload_line(item.payload())?;
        match item.content_type() {
            ContentType::Gnss => {
                self.apply_gnss(line);
                Ok(Vec::new())
            }
            _ => self.transform_sbs1(line),
        }
    }

    fn transform_sbs1(&self, line: &str) -> Result<Vec<Item>, DecodeError> {
        let record = sbs1::decode(line)?;
        let Some(position) = codec::sbs1_to_traffic_position(&record) else {
            trace!(hex_ident = %record.hex_ident, "record carries no position");
            return Ok(Vec::new());
        };

        let sentence = position.encode();
        // The frame is built from the verified sentence, not from the record
        let verified = TrafficPosition::decode(&sentence)?;
        let frame = TrafficFrame::build(
            &verified,
            self.reference.current(),
            &self.config.thresholds,
        )?;

        let mut out = Vec::with_capacity(2);
        if self.config.emit_nmea {
            out.push(Item::text(ContentType::Nmea, sentence));
        }
        out.push(Item::new(ContentType::Flarm, frame.encode().to_vec()));
        Ok(out)
    }

    fn apply_gnss(&mut self, line: &str) {
        match codec::decode_gnss_fix(line) {
            Ok(fix) => {
                trace!(lat = fix.latitude, lon = fix.longitude, "reference updated");
                self.reference.update(fix);
            }
            Err(DecodeError::NoFix) => {
                if self.reference.gnss.is_some() {
                    info!(stage = %self.name, "GNSS fix lost, falling back to static reference");
                }
                self.reference.lost();
            }
            Err(DecodeError::UnsupportedSentence(_)) => {}
            Err(e) => debug!(stage = %self.name, error = %e, "ignoring GNSS sentence"),
        }
    }
}

#[async_trait]
impl Adapter for Sbs1ToFlarmTransformation {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribed_types(&self) -> Option<Subscription> {
        let mut types = vec![ContentType::Sbs1];
        if self.config.use_gnss_reference {
            types.push(ContentType::Gnss);
        }
        Some(Subscription::to(types))
    }

    fn republishes(&self) -> bool {
        true
    }

    async fn run(mut self: Box<Self>, mut ctx: AdapterContext) -> anyhow::Result<()> {
        let inbox = ctx.take_inbox()?;
        self.state.transition(PipelineState::Running)?;
        info!(
            stage = %self.name,
            reference = ?self.reference.current(),
            gnss = self.config.use_gnss_reference,
            "Transformation running"
        );

        let mut published: u64 = 0;
        let mut skipped: u64 = 0;

        loop {
            let item = match inbox.recv().await {
                Some(Message::Data(item)) => item,
                Some(Message::Shutdown) => break,
                None => {
                    warn!(stage = %self.name, "hub went away without a shutdown sentinel");
                    break;
                }
            };
            metrics::counter!("pipeline.items.received_total").increment(1);

            let outputs = match self.transform(&item) {
                Ok(outputs) => outputs,
                Err(e) => {
                    skipped += 1;
                    metrics::counter!("pipeline.decode_errors_total").increment(1);
                    debug!(stage = %self.name, error = %e, item = %item, "skipping item");
                    continue;
                }
            };

            for output in outputs {
                let content_type = output.content_type().clone();
                match ctx.hub.publish(output).await {
                    Ok(()) => {
                        published += 1;
                        metrics::counter!("pipeline.items.published_total", "content_type" => content_type.to_string())
                            .increment(1);
                    }
                    Err(e) => {
                        warn!(stage = %self.name, content_type = %content_type, error = %e, "failed to publish result");
                    }
                }
            }
        }

        self.state.transition(PipelineState::Draining)?;
        if self.config.propagate_shutdown {
            if let Err(e) = ctx.hub.propagate_shutdown(inbox.id()).await {
                debug!(stage = %self.name, error = %e, "shutdown not propagated, hub already closed");
            }
        } else {
            inbox.close().await;
        }
        self.state.transition(PipelineState::Stopped)?;

        info!(stage = %self.name, published, skipped, "Transformation stopped");
        Ok(())
    }
}
