//! Items exchanged through the data hub
//!
//! An [`Item`] is one unit of telemetry tagged with a [`ContentType`]. Items are
//! never mutated after publication: transformations build a new item and publish
//! it again. Consumers receive [`Message`]s, which are either data or the
//! shutdown sentinel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Semantic kind of an item payload
///
/// Known identifiers are a closed set; anything else is kept verbatim in
/// [`ContentType::Other`] so adapters can introduce new feeds without touching
/// the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ContentType {
    /// BaseStation/dump1090 SBS1 text records
    Sbs1,
    /// NMEA 0183 sentences (including proprietary traffic sentences)
    Nmea,
    /// Binary traffic frames for proximity displays
    Flarm,
    /// NMEA fixes from the own-ship GNSS receiver
    Gnss,
    Other(String),
}

impl ContentType {
    pub fn as_str(&self) -> &str {
        match self {
            ContentType::Sbs1 => "sbs1",
            ContentType::Nmea => "nmea",
            ContentType::Flarm => "flarm",
            ContentType::Gnss => "gnss",
            ContentType::Other(s) => s,
        }
    }

    /// Whether payloads of this type are newline-delimited text
    pub fn is_line_oriented(&self) -> bool {
        matches!(
            self,
            ContentType::Sbs1 | ContentType::Nmea | ContentType::Gnss
        )
    }
}

impl From<&str> for ContentType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "sbs1" | "sbs" => ContentType::Sbs1,
            "nmea" => ContentType::Nmea,
            "flarm" => ContentType::Flarm,
            "gnss" => ContentType::Gnss,
            _ => ContentType::Other(value.trim().to_string()),
        }
    }
}

impl From<String> for ContentType {
    fn from(value: String) -> Self {
        ContentType::from(value.as_str())
    }
}

impl From<ContentType> for String {
    fn from(value: ContentType) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for ContentType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ContentType::from(s))
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of telemetry data
#[derive(Debug, Clone)]
pub struct Item {
    content_type: ContentType,
    payload: Bytes,
    created_at: Instant,
}

impl Item {
    pub fn new(content_type: ContentType, payload: impl Into<Bytes>) -> Self {
        Self {
            content_type,
            payload: payload.into(),
            created_at: Instant::now(),
        }
    }

    /// Build a text item; the string is stored as UTF-8 bytes
    pub fn text(content_type: ContentType, text: impl Into<String>) -> Self {
        Self::new(content_type, Bytes::from(text.into()))
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Creation time, for diagnostics only
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload_str() {
            Some(text) => write!(f, "Item({}, {:?})", self.content_type, text.trim_end()),
            None => write!(
                f,
                "Item({}, {} bytes)",
                self.content_type,
                self.payload.len()
            ),
        }
    }
}

/// What a consumer finds in its inbox
#[derive(Debug, Clone)]
pub enum Message {
    Data(Item),
    /// Stop consuming; republishing stages propagate it back to the hub
    Shutdown,
}
