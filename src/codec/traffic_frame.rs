//! Binary traffic frames for proximity displays
//!
//! Fixed 18-byte layout, all multi-byte fields big-endian:
//!
//! | offset | size | field                                             |
//! |--------|------|---------------------------------------------------|
//! | 0      | 2    | magic `FB`                                        |
//! | 2      | 1    | version (1)                                       |
//! | 3      | 1    | alarm level 0-3                                   |
//! | 4      | 4    | identifier (24-bit ICAO address)                  |
//! | 8      | 2    | bearing, tenths of degrees, `0xFFFF` unknown      |
//! | 10     | 4    | distance in meters, `0xFFFFFFFF` unknown          |
//! | 14     | 2    | relative altitude in meters, `0x8000` unknown     |
//! | 16     | 1    | flags: bit0 reference fix, bit1 target altitude   |
//! | 17     | 1    | XOR of bytes 0..17                                |

use serde::{Deserialize, Serialize};

use super::nmea::TrafficPosition;
use crate::error::DecodeError;
use crate::geometry::{Position, haversine_distance, initial_bearing};

pub const FRAME_LEN: usize = 18;
pub const MAGIC: [u8; 2] = *b"FB";
pub const VERSION: u8 = 1;

const BEARING_UNKNOWN: u16 = 0xFFFF;
const DISTANCE_UNKNOWN: u32 = u32::MAX;
const RELATIVE_ALTITUDE_UNKNOWN: i16 = i16::MIN;

const FLAG_REFERENCE_FIX: u8 = 0x01;
const FLAG_TARGET_ALTITUDE: u8 = 0x02;

/// Alarm level as shown by the display, 0 (none) to 3 (urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlarmLevel {
    None = 0,
    Low = 1,
    Important = 2,
    Urgent = 3,
}

impl AlarmLevel {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Low),
            2 => Some(Self::Important),
            3 => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Horizontal and vertical separation below which a level applies
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub distance_m: f64,
    pub vertical_m: f64,
}

impl Threshold {
    fn contains(&self, distance_m: f64, vertical_m: f64) -> bool {
        distance_m < self.distance_m && vertical_m.abs() < self.vertical_m
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmThresholds {
    pub urgent: Threshold,
    pub important: Threshold,
    pub low: Threshold,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            urgent: Threshold {
                distance_m: 500.0,
                vertical_m: 150.0,
            },
            important: Threshold {
                distance_m: 1_000.0,
                vertical_m: 300.0,
            },
            low: Threshold {
                distance_m: 2_000.0,
                vertical_m: 500.0,
            },
        }
    }
}

impl AlarmThresholds {
    /// Unknown relative altitude never raises an alarm
    pub fn classify(&self, relative: Option<&RelativePosition>) -> AlarmLevel {
        let Some(rel) = relative else {
            return AlarmLevel::None;
        };
        let Some(vertical) = rel.relative_altitude_m else {
            return AlarmLevel::None;
        };

        if self.urgent.contains(rel.distance_m, vertical) {
            AlarmLevel::Urgent
        } else if self.important.contains(rel.distance_m, vertical) {
            AlarmLevel::Important
        } else if self.low.contains(rel.distance_m, vertical) {
            AlarmLevel::Low
        } else {
            AlarmLevel::None
        }
    }
}

/// Target as seen from the reference position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelativePosition {
    /// Degrees true, [0, 360)
    pub bearing_deg: f64,
    pub distance_m: f64,
    /// Target minus reference, meters
    pub relative_altitude_m: Option<f64>,
}

impl RelativePosition {
    pub fn between(reference: &Position, target: &Position) -> Self {
        let relative_altitude_m = match (reference.altitude_m, target.altitude_m) {
            (Some(own), Some(other)) => Some(other - own),
            _ => None,
        };
        Self {
            bearing_deg: initial_bearing(
                reference.latitude,
                reference.longitude,
                target.latitude,
                target.longitude,
            ),
            distance_m: haversine_distance(
                reference.latitude,
                reference.longitude,
                target.latitude,
                target.longitude,
            ),
            relative_altitude_m,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrafficFrame {
    pub identifier: u32,
    pub alarm_level: AlarmLevel,
    /// `None` when no reference fix is available
    pub relative: Option<RelativePosition>,
}

impl TrafficFrame {
    /// Frame for a decoded traffic sentence
    ///
    /// Without a usable reference the frame still goes out, carrying the
    /// unknown-position sentinels and alarm level 0.
    pub fn build(
        target: &TrafficPosition,
        reference: Option<&Position>,
        thresholds: &AlarmThresholds,
    ) -> Result<Self, DecodeError> {
        let identifier = u32::from_str_radix(&target.hex_ident, 16)
            .ok()
            .filter(|id| *id <= 0x00FF_FFFF)
            .ok_or_else(|| DecodeError::InvalidField {
                field: "hex ident",
                value: target.hex_ident.clone(),
            })?;

        let target = target.position();
        let relative = reference
            .filter(|r| r.is_valid() && target.is_valid())
            .map(|r| RelativePosition::between(r, &target));

        Ok(Self {
            identifier,
            alarm_level: thresholds.classify(relative.as_ref()),
            relative,
        })
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0..2].copy_from_slice(&MAGIC);
        frame[2] = VERSION;
        frame[3] = self.alarm_level as u8;
        frame[4..8].copy_from_slice(&(self.identifier & 0x00FF_FFFF).to_be_bytes());

        let mut flags = 0u8;
        let (bearing, distance, relative_altitude) = match &self.relative {
            Some(rel) => {
                flags |= FLAG_REFERENCE_FIX;
                let bearing = ((rel.bearing_deg.rem_euclid(360.0) * 10.0).round() as u16) % 3600;
                let distance = rel.distance_m.round().clamp(0.0, f64::from(u32::MAX - 1)) as u32;
                let relative_altitude = match rel.relative_altitude_m {
                    Some(alt) => {
                        flags |= FLAG_TARGET_ALTITUDE;
                        alt.round().clamp(-f64::from(i16::MAX), f64::from(i16::MAX)) as i16
                    }
                    None => RELATIVE_ALTITUDE_UNKNOWN,
                };
                (bearing, distance, relative_altitude)
            }
            None => (BEARING_UNKNOWN, DISTANCE_UNKNOWN, RELATIVE_ALTITUDE_UNKNOWN),
        };

        frame[8..10].copy_from_slice(&bearing.to_be_bytes());
        frame[10..14].copy_from_slice(&distance.to_be_bytes());
        frame[14..16].copy_from_slice(&relative_altitude.to_be_bytes());
        frame[16] = flags;
        frame[17] = frame[..17].iter().fold(0u8, |acc, b| acc ^ b);
        frame
    }

    /// Parse a frame back, verifying length, magic and checksum
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < FRAME_LEN {
            return Err(DecodeError::Truncated {
                expected: FRAME_LEN,
                got: bytes.len(),
            });
        }
        let frame = &bytes[..FRAME_LEN];
        if frame[0..2] != MAGIC || frame[2] != VERSION {
            return Err(DecodeError::BadPrefix(hex::encode(&frame[0..3])));
        }
        let computed = frame[..17].iter().fold(0u8, |acc, b| acc ^ b);
        if computed != frame[17] {
            return Err(DecodeError::ChecksumMismatch {
                expected: frame[17],
                computed,
            });
        }

        let alarm_level = AlarmLevel::from_u8(frame[3]).ok_or_else(|| DecodeError::InvalidField {
            field: "alarm level",
            value: frame[3].to_string(),
        })?;
        let identifier = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let bearing = u16::from_be_bytes([frame[8], frame[9]]);
        let distance = u32::from_be_bytes([frame[10], frame[11], frame[12], frame[13]]);
        let relative_altitude = i16::from_be_bytes([frame[14], frame[15]]);
        let flags = frame[16];

        let relative = (flags & FLAG_REFERENCE_FIX != 0).then(|| RelativePosition {
            bearing_deg: f64::from(bearing) / 10.0,
            distance_m: f64::from(distance),
            relative_altitude_m: (flags & FLAG_TARGET_ALTITUDE != 0)
                .then_some(f64::from(relative_altitude)),
        });

        Ok(Self {
            identifier,
            alarm_level,
            relative,
        })
    }
}
