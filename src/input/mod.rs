//! Producers: adapters that read an external source and publish items

pub mod gnss_serial;
pub mod sbs1_client;
pub mod test_data;
pub mod udp;

pub use gnss_serial::{GnssSerialConfig, GnssSerialInput};
pub use sbs1_client::{Sbs1Client, Sbs1ClientConfig};
pub use test_data::{TestDataConfig, TestDataInput};
pub use udp::{UdpInput, UdpInputConfig};
