//! Protocol codecs: SBS1 text records, NMEA sentences and binary traffic frames

pub mod nmea;
pub mod sbs1;
pub mod traffic_frame;

pub use nmea::{Sentence, TrafficPosition, decode_gnss_fix};
pub use sbs1::{Sbs1Record, TransmissionType};
pub use traffic_frame::{AlarmLevel, AlarmThresholds, TrafficFrame};

use crate::error::DecodeError;

/// Traffic sentence for an SBS1 record that carries a position
///
/// Returns `None` for records without position data (identification,
/// velocity, squawk-only messages); those are not errors.
pub fn sbs1_to_traffic_position(record: &Sbs1Record) -> Option<TrafficPosition> {
    let (latitude, longitude) = record.position()?;
    Some(TrafficPosition {
        hex_ident: record.hex_ident.clone(),
        callsign: record.callsign.clone(),
        latitude,
        longitude,
        altitude_ft: record.altitude,
        ground_speed_kt: record.ground_speed,
        track_deg: record.track,
        vertical_rate_fpm: record.vertical_rate,
        squawk: record.squawk.clone(),
    })
}

/// Decode a UTF-8 payload line, failing softly on binary garbage
pub fn payload_line(payload: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(payload)
        .map(|s| s.trim_end_matches(['\r', '\n']))
        .map_err(|_| DecodeError::NotUtf8)
}
