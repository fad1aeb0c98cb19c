use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::adapter::{Adapter, AdapterContext};
use crate::error::PublishError;
use crate::item::{ContentType, Item};

/// Canned SBS1 traffic: identification, airborne positions and velocity
pub const SAMPLE_LINES: &[&str] = &[
    "MSG,1,111,11111,4CA2C5,111111,2024/01/01,12:00:00.000,2024/01/01,12:00:00.000,RYR1427,,,,,,,,,,,0",
    "MSG,3,111,11111,4CA2C5,111111,2024/01/01,12:00:00.100,2024/01/01,12:00:00.100,,38000,,,51.5,-0.1,,,0,0,0,0",
    "MSG,4,111,11111,4CA2C5,111111,2024/01/01,12:00:00.200,2024/01/01,12:00:00.200,,,452,275,,,-64,,,,,0",
    "MSG,3,111,11111,3C6586,111111,2024/01/01,12:00:00.300,2024/01/01,12:00:00.300,,2500,,,51.4775,-0.4614,,,0,0,0,0",
    "MSG,6,111,11111,3C6586,111111,2024/01/01,12:00:00.400,2024/01/01,12:00:00.400,,,,,,,,7000,0,0,0,0",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestDataConfig {
    pub interval_ms: u64,
    /// Stop after this many rounds; `None` repeats forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rounds: Option<u32>,
}

impl Default for TestDataConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            rounds: None,
        }
    }
}

/// Publishes [`SAMPLE_LINES`] once per tick, for bench runs without a receiver
pub struct TestDataInput {
    name: String,
    config: TestDataConfig,
}

impl TestDataInput {
    pub fn new(name: impl Into<String>, config: TestDataConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

#[async_trait]
impl Adapter for TestDataInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, ctx: AdapterContext) -> Result<()> {
        info!(interval_ms = self.config.interval_ms, "Test data input running");
        let mut ticker = interval(Duration::from_millis(self.config.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut round = 0u32;

        'rounds: while self.config.rounds.is_none_or(|limit| round < limit) {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for line in SAMPLE_LINES {
                match ctx.hub.publish(Item::text(ContentType::Sbs1, *line)).await {
                    Ok(()) => {}
                    Err(PublishError::HubClosed) => break 'rounds,
                    Err(e) => debug!(error = %e, "test line dropped"),
                }
            }
            round += 1;
        }

        info!(rounds = round, "Test data input stopped");
        Ok(())
    }
}
