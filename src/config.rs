use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapter::Adapter;
use crate::codec::AlarmThresholds;
use crate::data_hub::{HubConfig, OverflowPolicy};
use crate::geometry::Position;
use crate::input::{
    GnssSerialConfig, GnssSerialInput, Sbs1Client, Sbs1ClientConfig, TestDataConfig,
    TestDataInput, UdpInput, UdpInputConfig,
};
use crate::lifecycle::LifecycleConfig;
use crate::output::{BroadcastConfig, BroadcastServer};
use crate::queue_config::{CONSUMER_INBOX_SIZE, HUB_INBOUND_QUEUE_SIZE};
use crate::transformation::{Sbs1ToFlarmTransformation, TransformationConfig};

/// `[hub]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub inbound_queue_size: usize,
    pub inbox_size: usize,
    pub overflow: OverflowPolicy,
    pub publish_wait_ms: u64,
    pub delivery_wait_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            inbound_queue_size: HUB_INBOUND_QUEUE_SIZE,
            inbox_size: CONSUMER_INBOX_SIZE,
            overflow: OverflowPolicy::Drop,
            publish_wait_ms: 500,
            delivery_wait_ms: 50,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl HubSection {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            inbound_queue_size: self.inbound_queue_size,
            inbox_size: self.inbox_size,
            overflow: self.overflow,
            publish_wait: Duration::from_millis(self.publish_wait_ms),
            delivery_wait: Duration::from_millis(self.delivery_wait_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

/// `[lifecycle]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub settle_delay_ms: u64,
    pub producer_stop_timeout_ms: u64,
    pub consumer_grace_ms: u64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            settle_delay_ms: 100,
            producer_stop_timeout_ms: 2_000,
            consumer_grace_ms: 10_000,
        }
    }
}

impl LifecycleSection {
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            producer_stop_timeout: Duration::from_millis(self.producer_stop_timeout_ms),
            consumer_grace: Duration::from_millis(self.consumer_grace_ms),
        }
    }
}

/// Static own-ship position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePosition {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_m: Option<f64>,
}

impl From<ReferencePosition> for Position {
    fn from(r: ReferencePosition) -> Self {
        let position = Position::new(r.lat, r.lon);
        match r.alt_m {
            Some(alt) => position.with_altitude(alt),
            None => position,
        }
    }
}

/// `[transformation]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformationSection {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferencePosition>,
    pub use_gnss_reference: bool,
    pub propagate_shutdown: bool,
    pub emit_nmea: bool,
    pub thresholds: AlarmThresholds,
}

impl Default for TransformationSection {
    fn default() -> Self {
        let defaults = TransformationConfig::default();
        Self {
            enabled: true,
            reference: None,
            use_gnss_reference: defaults.use_gnss_reference,
            propagate_shutdown: defaults.propagate_shutdown,
            emit_nmea: defaults.emit_nmea,
            thresholds: defaults.thresholds,
        }
    }
}

impl TransformationSection {
    pub fn transformation_config(&self) -> TransformationConfig {
        TransformationConfig {
            static_reference: self.reference.map(Position::from),
            use_gnss_reference: self.use_gnss_reference,
            thresholds: self.thresholds,
            propagate_shutdown: self.propagate_shutdown,
            emit_nmea: self.emit_nmea,
        }
    }
}

/// One `[[inputs]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputConfig {
    Sbs1(Sbs1ClientConfig),
    Udp(UdpInputConfig),
    GnssSerial(GnssSerialConfig),
    TestData(TestDataConfig),
}

impl InputConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            InputConfig::Sbs1(_) => "sbs1",
            InputConfig::Udp(_) => "udp",
            InputConfig::GnssSerial(_) => "gnss_serial",
            InputConfig::TestData(_) => "test_data",
        }
    }

    pub fn build(&self, name: String) -> Box<dyn Adapter> {
        match self {
            InputConfig::Sbs1(c) => Box::new(Sbs1Client::new(name, c.clone())),
            InputConfig::Udp(c) => Box::new(UdpInput::new(name, c.clone())),
            InputConfig::GnssSerial(c) => Box::new(GnssSerialInput::new(name, c.clone())),
            InputConfig::TestData(c) => Box::new(TestDataInput::new(name, c.clone())),
        }
    }
}

/// One `[[outputs]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputConfig {
    Broadcast(BroadcastConfig),
}

impl OutputConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            OutputConfig::Broadcast(_) => "broadcast",
        }
    }

    pub fn build(&self, name: String) -> Box<dyn Adapter> {
        match self {
            OutputConfig::Broadcast(c) => Box::new(BroadcastServer::new(name, c.clone())),
        }
    }
}

/// Top-level configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightBoxConfig {
    /// Serve Prometheus metrics on this port when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
    pub hub: HubSection,
    pub lifecycle: LifecycleSection,
    pub transformation: TransformationSection,
    pub inputs: Vec<InputConfig>,
    pub outputs: Vec<OutputConfig>,
}

impl Default for FlightBoxConfig {
    /// SBS1 feed into the SBS1 to FLARM transformation, no outputs
    fn default() -> Self {
        Self {
            metrics_port: None,
            hub: HubSection::default(),
            lifecycle: LifecycleSection::default(),
            transformation: TransformationSection::default(),
            inputs: vec![InputConfig::Sbs1(Sbs1ClientConfig::default())],
            outputs: Vec::new(),
        }
    }
}

impl FlightBoxConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: FlightBoxConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, built-in defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save config to a TOML file (atomic: write to .tmp then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, &contents)
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", tmp_path, path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.hub.inbound_queue_size == 0 || self.hub.inbox_size == 0 {
            bail!("hub queue sizes must be greater than zero");
        }
        if let Some(reference) = &self.transformation.reference {
            if !Position::from(*reference).is_valid() {
                bail!(
                    "reference position {},{} is out of range",
                    reference.lat,
                    reference.lon
                );
            }
        }
        for output in &self.outputs {
            let OutputConfig::Broadcast(c) = output;
            if c.content_types.is_empty() {
                bail!("broadcast output on port {} has no content types", c.port);
            }
        }
        Ok(())
    }

    /// Instantiate every configured adapter, named `<kind>-<index>`
    pub fn build_adapters(&self) -> Vec<Box<dyn Adapter>> {
        let mut adapters: Vec<Box<dyn Adapter>> = Vec::new();
        for (i, output) in self.outputs.iter().enumerate() {
            adapters.push(output.build(format!("{}-{}", output.kind(), i)));
        }
        if self.transformation.enabled {
            adapters.push(Box::new(Sbs1ToFlarmTransformation::new(
                "sbs1-flarm",
                self.transformation.transformation_config(),
            )));
        }
        for (i, input) in self.inputs.iter().enumerate() {
            adapters.push(input.build(format!("{}-{}", input.kind(), i)));
        }
        adapters
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `--config` command-line flag
/// 2. `FLIGHTBOX_CONFIG` env var
/// 3. `./flightbox.toml`
pub fn config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("FLIGHTBOX_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("./flightbox.toml")
}
