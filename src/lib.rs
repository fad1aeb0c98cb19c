//! FlightBox - content-routed telemetry hub
//!
//! Input adapters publish ADS-B (SBS1), GNSS and FLARM telemetry as typed
//! items into a central data hub, which routes each item to every consumer
//! subscribed to its content type. The SBS1 transformation turns traffic
//! records into NMEA sentences and binary traffic frames, and the broadcast
//! output serves the results to TCP clients.

pub mod adapter;
pub mod codec;
pub mod config;
pub mod data_hub;
pub mod error;
pub mod geometry;
pub mod input;
pub mod item;
pub mod lifecycle;
pub mod log_format;
pub mod metrics;
pub mod output;
pub mod queue_config;
pub mod transformation;

pub use adapter::{Adapter, AdapterContext, Role};
pub use data_hub::{DataHub, HubConfig, HubHandle, Inbox, OverflowPolicy, Subscription};
pub use error::{DecodeError, PublishError, RegistrationError};
pub use item::{ContentType, Item, Message};
pub use lifecycle::{Coordinator, LifecycleConfig, ShutdownReport};
