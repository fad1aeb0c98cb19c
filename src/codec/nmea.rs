//! NMEA 0183 sentences
//!
//! `$<address>,<field>,...*<CS>\r\n` where `<CS>` is the XOR of every byte
//! between `$` and `*`, as two upper-case hex digits. Decoding verifies the
//! checksum before any field is looked at.

use crate::error::DecodeError;
use crate::geometry::Position;

/// Address of the traffic position sentence produced from SBS1 records
pub const TRAFFIC_SENTENCE: &str = "PFBTP";

/// XOR checksum over the sentence body (the bytes between `$` and `*`)
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Build a complete sentence from its address and fields
pub fn encode_sentence<S: AsRef<str>>(address: &str, fields: &[S]) -> String {
    let mut body = String::with_capacity(address.len() + fields.len() * 8);
    body.push_str(address);
    for field in fields {
        body.push(',');
        body.push_str(field.as_ref());
    }
    format!("${}*{:02X}\r\n", body, checksum(body.as_bytes()))
}

/// A checksum-verified sentence split into its address and fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub address: String,
    pub fields: Vec<String>,
}

impl Sentence {
    /// Parse and verify one sentence; trailing CR/LF is optional
    pub fn parse(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let rest = line
            .strip_prefix('$')
            .ok_or_else(|| DecodeError::BadPrefix(line.chars().take(1).collect()))?;

        let (body, cs) = rest.split_once('*').ok_or(DecodeError::MissingChecksum)?;
        if cs.len() != 2 {
            return Err(DecodeError::InvalidField {
                field: "checksum",
                value: cs.to_string(),
            });
        }
        let expected = u8::from_str_radix(cs, 16).map_err(|_| DecodeError::InvalidField {
            field: "checksum",
            value: cs.to_string(),
        })?;
        let computed = checksum(body.as_bytes());
        if expected != computed {
            return Err(DecodeError::ChecksumMismatch { expected, computed });
        }

        let mut parts = body.split(',');
        let address = parts.next().unwrap_or_default().to_string();
        if address.is_empty() {
            return Err(DecodeError::MissingField("sentence address"));
        }
        Ok(Self {
            address,
            fields: parts.map(str::to_string).collect(),
        })
    }

    /// Sentence type without the two-letter talker, e.g. `GGA` for `GPGGA`
    pub fn sentence_type(&self) -> &str {
        if self.address.starts_with('P') {
            &self.address
        } else {
            self.address.get(2..).unwrap_or(&self.address)
        }
    }

    fn field(&self, index: usize) -> Option<&str> {
        self.fields
            .get(index)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Traffic position for one aircraft (`$PFBTP`)
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficPosition {
    pub hex_ident: String,
    pub callsign: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_ft: Option<i32>,
    pub ground_speed_kt: Option<f32>,
    pub track_deg: Option<f32>,
    pub vertical_rate_fpm: Option<i32>,
    pub squawk: Option<String>,
}

impl TrafficPosition {
    /// Encoding is lossless for anything [`decode`](Self::decode) accepts
    pub fn encode(&self) -> String {
        let (lat, ns) = format_latitude(self.latitude);
        let (lon, ew) = format_longitude(self.longitude);
        let fields = [
            strip_framing(&self.hex_ident),
            self.callsign.as_deref().map(strip_framing).unwrap_or_default(),
            lat,
            ns.to_string(),
            lon,
            ew.to_string(),
            opt(self.altitude_ft),
            opt(self.ground_speed_kt),
            opt(self.track_deg),
            opt(self.vertical_rate_fpm),
            self.squawk.as_deref().map(strip_framing).unwrap_or_default(),
        ];
        encode_sentence(TRAFFIC_SENTENCE, &fields)
    }

    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let sentence = Sentence::parse(line)?;
        Self::from_sentence(&sentence)
    }

    pub fn from_sentence(sentence: &Sentence) -> Result<Self, DecodeError> {
        if sentence.address != TRAFFIC_SENTENCE {
            return Err(DecodeError::UnsupportedSentence(sentence.address.clone()));
        }
        if sentence.fields.len() < 11 {
            return Err(DecodeError::TooShort {
                expected: 11,
                got: sentence.fields.len(),
            });
        }

        let hex_ident = sentence
            .field(0)
            .ok_or(DecodeError::MissingField("hex ident"))?
            .to_string();
        let latitude = parse_coordinate(sentence.field(2), sentence.field(3), 2, "latitude")?;
        let longitude = parse_coordinate(sentence.field(4), sentence.field(5), 3, "longitude")?;

        Ok(Self {
            hex_ident,
            callsign: sentence.field(1).map(str::to_string),
            latitude,
            longitude,
            altitude_ft: parse_number(sentence.field(6), "altitude")?,
            ground_speed_kt: parse_finite(sentence.field(7), "ground speed")?,
            track_deg: parse_finite(sentence.field(8), "track")?,
            vertical_rate_fpm: parse_number(sentence.field(9), "vertical rate")?,
            squawk: sentence.field(10).map(str::to_string),
        })
    }

    pub fn position(&self) -> Position {
        let position = Position::new(self.latitude, self.longitude);
        match self.altitude_ft {
            Some(ft) => position.with_altitude(f64::from(ft) * FEET_TO_METERS),
            None => position,
        }
    }
}

pub const FEET_TO_METERS: f64 = 0.3048;

/// Own-ship fix from a GGA or RMC sentence
///
/// Other sentence types are rejected with [`DecodeError::UnsupportedSentence`],
/// receivers without a fix with [`DecodeError::NoFix`].
pub fn decode_gnss_fix(line: &str) -> Result<Position, DecodeError> {
    let sentence = Sentence::parse(line)?;
    match sentence.sentence_type() {
        "GGA" => {
            let quality: u8 = parse_number(sentence.field(5), "fix quality")?.unwrap_or(0);
            if quality == 0 {
                return Err(DecodeError::NoFix);
            }
            let lat = parse_coordinate(sentence.field(1), sentence.field(2), 2, "latitude")?;
            let lon = parse_coordinate(sentence.field(3), sentence.field(4), 3, "longitude")?;
            let position = Position::new(lat, lon);
            Ok(match parse_number::<f64>(sentence.field(8), "altitude")? {
                Some(alt) => position.with_altitude(alt),
                None => position,
            })
        }
        "RMC" => {
            if sentence.field(1) != Some("A") {
                return Err(DecodeError::NoFix);
            }
            let lat = parse_coordinate(sentence.field(2), sentence.field(3), 2, "latitude")?;
            let lon = parse_coordinate(sentence.field(4), sentence.field(5), 3, "longitude")?;
            Ok(Position::new(lat, lon))
        }
        other => Err(DecodeError::UnsupportedSentence(other.to_string())),
    }
}

/// `ddmm.mmmm` (or `dddmm.mmmm`) that decodes back to exactly `value`
///
/// Four decimals are used when they are enough; otherwise more digits, and as
/// a last resort the shortest minutes text that parses back bit for bit.
/// Minutes are never rendered as 60.
fn format_coordinate(value: f64, degree_digits: usize) -> String {
    let magnitude = value.abs();
    let degrees = magnitude.trunc();
    let minutes = (magnitude - degrees) * 60.0;
    let render = |text: String| format!("{:0degree_digits$}{text}", degrees as u64);
    let exact = |text: &str| {
        text.parse::<f64>()
            .is_ok_and(|m| (0.0..60.0).contains(&m) && degrees + m / 60.0 == magnitude)
    };

    for precision in 4..=12 {
        let text = format!("{:0width$.precision$}", minutes, width = precision + 3);
        if exact(&text) {
            return render(text);
        }
    }

    // The product above can be a few ulps away from the minutes that were
    // originally decoded; walk outwards until one lands on `magnitude`
    let mut up = minutes;
    let mut down = minutes;
    for _ in 0..MINUTE_SEARCH_STEPS {
        for candidate in [up, down] {
            let text = minutes_text(candidate);
            if exact(&text) {
                return render(text);
            }
        }
        up = f64::from_bits(up.to_bits() + 1);
        if down > 0.0 {
            down = f64::from_bits(down.to_bits() - 1);
        }
    }

    // Not a decoded value; the closest minutes we have
    let below_sixty = f64::from_bits(60.0f64.to_bits() - 1);
    render(minutes_text(minutes.clamp(0.0, below_sixty)))
}

const MINUTE_SEARCH_STEPS: usize = 64;

/// Shortest round-tripping text, zero padded to two integer digits
fn minutes_text(minutes: f64) -> String {
    let mut text = minutes.to_string();
    if !text.contains('.') {
        text.push_str(".0");
    }
    if minutes < 10.0 {
        text.insert(0, '0');
    }
    text
}

fn format_latitude(lat: f64) -> (String, char) {
    (format_coordinate(lat, 2), if lat < 0.0 { 'S' } else { 'N' })
}

fn format_longitude(lon: f64) -> (String, char) {
    (format_coordinate(lon, 3), if lon < 0.0 { 'W' } else { 'E' })
}

fn parse_coordinate(
    value: Option<&str>,
    hemisphere: Option<&str>,
    degree_digits: usize,
    field: &'static str,
) -> Result<f64, DecodeError> {
    let value = value.ok_or(DecodeError::MissingField(field))?;
    let invalid = || DecodeError::InvalidField {
        field,
        value: value.to_string(),
    };

    if value.len() < degree_digits + 2 || !value.is_char_boundary(degree_digits) {
        return Err(invalid());
    }
    let (deg, min) = value.split_at(degree_digits);
    if !deg.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let degrees: f64 = deg.parse().map_err(|_| invalid())?;
    let minutes: f64 = min.parse().map_err(|_| invalid())?;
    if !(0.0..60.0).contains(&minutes) {
        return Err(invalid());
    }
    let magnitude = degrees + minutes / 60.0;

    match hemisphere {
        Some("N") | Some("E") => Ok(magnitude),
        Some("S") | Some("W") => Ok(-magnitude),
        Some(other) => Err(DecodeError::InvalidField {
            field: "hemisphere",
            value: other.to_string(),
        }),
        None => Err(DecodeError::MissingField("hemisphere")),
    }
}

fn parse_number<T: std::str::FromStr>(
    value: Option<&str>,
    field: &'static str,
) -> Result<Option<T>, DecodeError> {
    value
        .map(|v| {
            v.parse().map_err(|_| DecodeError::InvalidField {
                field,
                value: v.to_string(),
            })
        })
        .transpose()
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Like [`parse_number`] but rejects NaN and infinities
fn parse_finite(value: Option<&str>, field: &'static str) -> Result<Option<f32>, DecodeError> {
    match parse_number::<f32>(value, field)? {
        Some(v) if !v.is_finite() => Err(DecodeError::InvalidField {
            field,
            value: v.to_string(),
        }),
        other => Ok(other),
    }
}

/// Drop the characters that delimit fields and the checksum; decoded fields
/// never contain them
fn strip_framing(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, ',' | '*'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TrafficPosition {
        TrafficPosition {
            hex_ident: "4CA2C5".to_string(),
            callsign: Some("EIN154".to_string()),
            latitude: 51.5,
            longitude: -0.1,
            altitude_ft: Some(38000),
            ground_speed_kt: Some(452.0),
            track_deg: Some(271.5),
            vertical_rate_fpm: Some(-64),
            squawk: Some("2235".to_string()),
        }
    }

    #[test]
    fn test_checksum_known_sentence() {
        // Reference GGA from the NMEA 0183 documentation examples
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        let sentence = Sentence::parse(line).unwrap();
        assert_eq!(sentence.address, "GPGGA");
        assert_eq!(sentence.sentence_type(), "GGA");
        assert_eq!(sentence.fields[0], "123519");
    }

    #[test]
    fn test_encode_layout() {
        let line = sample().encode();
        assert!(line.starts_with("$PFBTP,4CA2C5,EIN154,5130.0000,N,00006.0000,W,38000,452,271.5,-64,2235*"));
        assert!(line.ends_with("\r\n"));

        let star = line.find('*').unwrap();
        let cs = u8::from_str_radix(&line[star + 1..star + 3], 16).unwrap();
        assert_eq!(cs, checksum(line[1..star].as_bytes()));
        assert_eq!(&line[star + 1..star + 3], line[star + 1..star + 3].to_uppercase());
    }

    #[test]
    fn test_round_trip() {
        let original = sample();
        assert_eq!(TrafficPosition::decode(&original.encode()), Ok(original));
    }

    #[test]
    fn test_round_trip_with_absent_fields() {
        let original = TrafficPosition {
            callsign: None,
            altitude_ft: None,
            ground_speed_kt: None,
            track_deg: None,
            vertical_rate_fpm: None,
            squawk: None,
            ..sample()
        };
        let line = original.encode();
        assert!(line.contains("W,,,,,*"));
        assert_eq!(TrafficPosition::decode(&line), Ok(original));
    }

    #[test]
    fn test_round_trip_from_wire_is_stable() {
        let wire = encode_sentence(
            TRAFFIC_SENTENCE,
            &[
                "3C6586", "DLH4AB", "4807.0383", "N", "01131.0001", "E", "12000", "310.4", "88.5",
                "1536", "1000",
            ],
        );
        let decoded = TrafficPosition::decode(&wire).unwrap();
        assert_eq!(decoded.encode(), wire);
        assert_eq!(TrafficPosition::decode(&decoded.encode()), Ok(decoded));
    }

    #[test]
    fn test_corrupted_checksum_fails() {
        let line = sample().encode();
        let star = line.find('*').unwrap();
        let cs = u8::from_str_radix(&line[star + 1..star + 3], 16).unwrap();
        let corrupted = format!("{}*{:02X}\r\n", &line[..star], cs ^ 0x01);

        assert!(matches!(
            TrafficPosition::decode(&corrupted),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupted_body_fails() {
        let line = sample().encode().replace("38000", "39000");
        assert!(matches!(
            TrafficPosition::decode(&line),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_checksum() {
        assert_eq!(
            Sentence::parse("$GPGGA,1,2,3"),
            Err(DecodeError::MissingChecksum)
        );
        assert!(Sentence::parse("GPGGA,1*00").is_err());
        assert!(Sentence::parse("$GPGGA,1*0").is_err());
        assert!(Sentence::parse("$GPGGA,1*ZZ").is_err());
    }

    #[test]
    fn test_coordinate_never_renders_sixty_minutes() {
        let text = format_coordinate(51.999_999_99, 2);
        let minutes: f64 = text[2..].parse().unwrap();
        assert!(minutes < 60.0, "{text}");
        assert_eq!(&text[..2], "51");
        assert_eq!(format_coordinate(0.1, 3), "00006.0000");
    }

    #[test]
    fn test_five_decimal_minutes_survive_round_trip() {
        let wire = encode_sentence(
            TRAFFIC_SENTENCE,
            &[
                "3C6586", "DLH4AB", "4807.03833", "N", "01131.00017", "E", "12000", "310.45",
                "88.25", "1536", "1000",
            ],
        );
        let decoded = TrafficPosition::decode(&wire).unwrap();
        assert_eq!(decoded.ground_speed_kt, Some(310.45));
        assert_eq!(TrafficPosition::decode(&decoded.encode()), Ok(decoded));
    }

    #[test]
    fn test_padded_callsign_is_kept() {
        let wire = encode_sentence(
            TRAFFIC_SENTENCE,
            &[
                "3C6586", "DLH4AB  ", "4807.03833", "N", "01131.00017", "E", "", "", "", "", " 7000",
            ],
        );
        let decoded = TrafficPosition::decode(&wire).unwrap();
        assert_eq!(decoded.callsign.as_deref(), Some("DLH4AB  "));
        assert_eq!(TrafficPosition::decode(&decoded.encode()), Ok(decoded));
    }

    #[test]
    fn test_long_coordinates_keep_full_precision() {
        // SBS1 positions carry more digits than NMEA minutes usually do
        let original = TrafficPosition {
            latitude: 51.477_512_345_678,
            longitude: -0.461_398_765_432_1,
            ..sample()
        };
        let decoded = TrafficPosition::decode(&original.encode()).unwrap();
        assert!((decoded.latitude - original.latitude).abs() < 1e-12);
        assert!((decoded.longitude - original.longitude).abs() < 1e-12);
        assert_eq!(decoded.hex_ident, original.hex_ident);
    }

    #[test]
    fn test_checksum_delimiter_is_first_star() {
        let body = "PFBTP,4CA2C5,A*B,5130.0000,N,00006.0000,W,,,,,";
        let line = format!("${}*{:02X}\r\n", body, checksum(body.as_bytes()));
        assert!(Sentence::parse(&line).is_err());
    }

    #[test]
    fn test_non_finite_speed_is_rejected() {
        let wire = encode_sentence(
            TRAFFIC_SENTENCE,
            &["4CA2C5", "", "5130.0", "N", "00006.0", "W", "", "NaN", "", "", ""],
        );
        assert!(matches!(
            TrafficPosition::decode(&wire),
            Err(DecodeError::InvalidField { field: "ground speed", .. })
        ));
    }

    #[test]
    fn test_decode_gga_fix() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        let fix = decode_gnss_fix(line).unwrap();
        assert!((fix.latitude - 48.1173).abs() < 1e-6);
        assert!((fix.longitude - 11.516_666).abs() < 1e-5);
        assert_eq!(fix.altitude_m, Some(545.4));
    }

    #[test]
    fn test_decode_rmc_fix() {
        let line = encode_sentence(
            "GNRMC",
            &[
                "081836", "A", "3751.65", "S", "14507.36", "E", "000.0", "360.0", "130998",
                "011.3", "E",
            ],
        );
        let fix = decode_gnss_fix(&line).unwrap();
        assert!((fix.latitude + 37.860_833).abs() < 1e-5);
        assert!((fix.longitude - 145.122_666).abs() < 1e-5);
        assert!(fix.altitude_m.is_none());
    }

    #[test]
    fn test_gnss_without_fix() {
        let gga = encode_sentence(
            "GPGGA",
            &["123519", "", "", "", "", "0", "00", "", "", "M", "", "M", "", ""],
        );
        assert_eq!(decode_gnss_fix(&gga), Err(DecodeError::NoFix));

        let rmc = encode_sentence("GPRMC", &["081836", "V", "", "", "", ""]);
        assert_eq!(decode_gnss_fix(&rmc), Err(DecodeError::NoFix));

        let gsv = encode_sentence("GPGSV", &["3", "1", "11"]);
        assert_eq!(
            decode_gnss_fix(&gsv),
            Err(DecodeError::UnsupportedSentence("GSV".to_string()))
        );
    }

    #[test]
    fn test_traffic_position_altitude_in_meters() {
        let pos = sample().position();
        assert!((pos.altitude_m.unwrap() - 11_582.4).abs() < 1e-6);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    // A coordinate field as a receiver writes it: degrees, two minute digits
    // and three to six decimals
    prop_compose! {
        fn arb_coordinate(max_degrees: u32, degree_digits: usize)
            (degrees in 0..max_degrees, minutes in 0u32..60, decimals in 3usize..=6, fraction in 0u32..1_000_000)
            -> String
        {
            let fraction = fraction % 10u32.pow(decimals as u32);
            format!("{degrees:0degree_digits$}{minutes:02}.{fraction:0decimals$}")
        }
    }

    prop_compose! {
        fn arb_decimal()(whole in 0u32..1000, fraction in 0u32..100, decimals in 0usize..=2) -> String {
            match decimals {
                0 => whole.to_string(),
                1 => format!("{whole}.{}", fraction % 10),
                _ => format!("{whole}.{fraction:02}"),
            }
        }
    }

    fn optional(field: impl Strategy<Value = String>) -> impl Strategy<Value = String> {
        prop_oneof![Just(String::new()), field]
    }

    prop_compose! {
        fn arb_sentence()(
            hex_ident in "[0-9A-F]{6}",
            callsign in optional("[A-Z0-9]{2,8} {0,2}".boxed()),
            lat in arb_coordinate(90, 2),
            ns in prop::sample::select(vec!["N", "S"]),
            lon in arb_coordinate(180, 3),
            ew in prop::sample::select(vec!["E", "W"]),
            altitude in optional((-1000i32..60_000).prop_map(|v| v.to_string()).boxed()),
            speed in optional(arb_decimal().boxed()),
            track in optional(arb_decimal().boxed()),
            vertical_rate in optional((-6000i32..6000).prop_map(|v| v.to_string()).boxed()),
            squawk in optional("[0-7]{4}".boxed()),
        ) -> String {
            encode_sentence(
                TRAFFIC_SENTENCE,
                &[hex_ident, callsign, lat, ns.to_string(), lon, ew.to_string(), altitude, speed, track, vertical_rate, squawk],
            )
        }
    }

    proptest! {
        #[test]
        fn test_decoded_records_survive_encoding(wire in arb_sentence()) {
            let decoded = TrafficPosition::decode(&wire).unwrap();
            prop_assert_eq!(TrafficPosition::decode(&decoded.encode()), Ok(decoded));
        }

        #[test]
        fn test_any_single_bit_flip_in_checksum_is_caught(wire in arb_sentence(), bit in 0u8..8) {
            let star = wire.find('*').unwrap();
            let cs = u8::from_str_radix(&wire[star + 1..star + 3], 16).unwrap();
            let corrupted = format!("{}*{:02X}\r\n", &wire[..star], cs ^ (1 << bit));
            let is_mismatch = matches!(
                Sentence::parse(&corrupted),
                Err(DecodeError::ChecksumMismatch { .. })
            );
            prop_assert!(is_mismatch);
        }
    }
}
