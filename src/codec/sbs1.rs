use chrono::NaiveDateTime;

use crate::error::DecodeError;

/// Record kind from field 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Transmission message, the only kind carrying flight data
    Msg,
    /// Selection change
    Sel,
    /// New identification
    Id,
    /// New aircraft
    Air,
    /// Status change
    Sta,
    /// Click
    Clk,
}

impl RecordKind {
    fn parse(field: &str) -> Option<Self> {
        match field {
            "MSG" => Some(Self::Msg),
            "SEL" => Some(Self::Sel),
            "ID" => Some(Self::Id),
            "AIR" => Some(Self::Air),
            "STA" => Some(Self::Sta),
            "CLK" => Some(Self::Clk),
            _ => None,
        }
    }
}

/// Transmission types of `MSG` records (MSG,1 through MSG,8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    /// MSG,1: ES Identification and Category (callsign)
    EsIdentification = 1,
    /// MSG,2: ES Surface Position Message (surface position)
    EsSurfacePosition = 2,
    /// MSG,3: ES Airborne Position Message (altitude, lat/lon)
    EsAirbornePosition = 3,
    /// MSG,4: ES Airborne Velocity Message (speed, track, vertical rate)
    EsAirborneVelocity = 4,
    /// MSG,5: Surveillance Alt Message (altitude only)
    SurveillanceAlt = 5,
    /// MSG,6: Surveillance ID Message (squawk)
    SurveillanceId = 6,
    /// MSG,7: Air To Air Message (altitude)
    AirToAir = 7,
    /// MSG,8: All Call Reply (no data)
    AllCallReply = 8,
}

impl TransmissionType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::EsIdentification),
            2 => Some(Self::EsSurfacePosition),
            3 => Some(Self::EsAirbornePosition),
            4 => Some(Self::EsAirborneVelocity),
            5 => Some(Self::SurveillanceAlt),
            6 => Some(Self::SurveillanceId),
            7 => Some(Self::AirToAir),
            8 => Some(Self::AllCallReply),
            _ => None,
        }
    }

    /// Only surface and airborne position messages carry lat/lon
    pub fn carries_position(self) -> bool {
        matches!(self, Self::EsSurfacePosition | Self::EsAirbornePosition)
    }
}

/// One decoded SBS1 line
///
/// Everything after the hex ident is optional: feeds leave fields empty when
/// the transponder did not send them, and some truncate the record.
#[derive(Debug, Clone, PartialEq)]
pub struct Sbs1Record {
    pub kind: RecordKind,
    /// Present for `MSG` records only
    pub transmission_type: Option<TransmissionType>,
    pub session_id: Option<String>,
    pub aircraft_id: Option<String>,
    /// ICAO 24-bit address as six hex digits, upper case
    pub hex_ident: String,
    pub flight_id: Option<String>,
    pub generated_at: Option<NaiveDateTime>,
    pub logged_at: Option<NaiveDateTime>,
    pub callsign: Option<String>,
    /// Feet
    pub altitude: Option<i32>,
    /// Knots
    pub ground_speed: Option<f32>,
    /// Degrees true
    pub track: Option<f32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Feet per minute
    pub vertical_rate: Option<i32>,
    pub squawk: Option<String>,
    pub alert: Option<bool>,
    pub emergency: Option<bool>,
    pub spi: Option<bool>,
    pub on_ground: Option<bool>,
}

impl Sbs1Record {
    /// Parse the hex ident as an ICAO address
    pub fn icao_address(&self) -> Option<u32> {
        u32::from_str_radix(&self.hex_ident, 16).ok()
    }

    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    pub fn has_velocity(&self) -> bool {
        self.ground_speed.is_some() || self.vertical_rate.is_some()
    }

    /// Latitude/longitude when both are present and in range
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon))
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) =>
            {
                Some((lat, lon))
            }
            _ => None,
        }
    }
}

/// Parse an SBS1 CSV line
///
/// SBS format: MSG,<type>,<session_id>,<aircraft_id>,<hex_ident>,<flight_id>,
///             <date_gen>,<time_gen>,<date_log>,<time_log>,<callsign>,<altitude>,
///             <ground_speed>,<track>,<latitude>,<longitude>,<vertical_rate>,<squawk>,
///             <alert>,<emergency>,<spi>,<on_ground>
pub fn decode(line: &str) -> Result<Sbs1Record, DecodeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split(',').collect();

    // Minimum: MSG,<type>,,,<hex_ident> = at least 5 fields
    if fields.len() < 5 {
        return Err(DecodeError::TooShort {
            expected: 5,
            got: fields.len(),
        });
    }

    let kind = RecordKind::parse(fields[0].trim())
        .ok_or_else(|| DecodeError::BadPrefix(fields[0].to_string()))?;

    let transmission_type = if kind == RecordKind::Msg {
        let raw = fields[1].trim();
        let parsed = raw
            .parse::<u8>()
            .ok()
            .and_then(TransmissionType::from_u8)
            .ok_or_else(|| DecodeError::InvalidField {
                field: "transmission type",
                value: raw.to_string(),
            })?;
        Some(parsed)
    } else {
        None
    };

    let hex_ident = fields[4].trim();
    if hex_ident.is_empty() {
        return Err(DecodeError::MissingField("hex ident"));
    }
    if !hex_ident.chars().all(|c| c.is_ascii_hexdigit()) || hex_ident.len() > 6 {
        return Err(DecodeError::InvalidField {
            field: "hex ident",
            value: hex_ident.to_string(),
        });
    }

    let field = |i: usize| fields.get(i).copied();

    Ok(Sbs1Record {
        kind,
        transmission_type,
        session_id: parse_optional_string(field(2)),
        aircraft_id: parse_optional_string(field(3)),
        hex_ident: hex_ident.to_ascii_uppercase(),
        flight_id: parse_optional_string(field(5)),
        generated_at: parse_optional_timestamp(field(6), field(7)),
        logged_at: parse_optional_timestamp(field(8), field(9)),
        callsign: parse_optional_string(field(10)),
        altitude: parse_optional(field(11)),
        ground_speed: parse_optional(field(12)),
        track: parse_optional(field(13)),
        latitude: parse_optional(field(14)),
        longitude: parse_optional(field(15)),
        vertical_rate: parse_optional(field(16)),
        squawk: parse_optional_string(field(17)),
        alert: parse_optional_bool(field(18)),
        emergency: parse_optional_bool(field(19)),
        spi: parse_optional_bool(field(20)),
        on_ground: parse_optional_bool(field(21)),
    })
}

fn parse_optional_string(field: Option<&str>) -> Option<String> {
    field
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_optional<T: std::str::FromStr>(field: Option<&str>) -> Option<T> {
    field
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

fn parse_optional_bool(field: Option<&str>) -> Option<bool> {
    field.map(str::trim).and_then(|s| match s {
        "0" => Some(false),
        "1" | "-1" => Some(true),
        _ => None,
    })
}

/// Dates come as 2008/11/28 from BaseStation and 2024-01-01 from some
/// dump1090 forks; times may or may not carry milliseconds
fn parse_optional_timestamp(date: Option<&str>, time: Option<&str>) -> Option<NaiveDateTime> {
    let date = date.map(str::trim).filter(|s| !s.is_empty())?;
    let time = time.map(str::trim).filter(|s| !s.is_empty())?;
    let joined = format!("{} {}", date.replace('/', "-"), time);
    NaiveDateTime::parse_from_str(&joined, "%Y-%m-%d %H:%M:%S%.f").ok()
}
