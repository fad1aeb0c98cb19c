//! Error taxonomy shared by the hub, the codecs and the lifecycle coordinator

use std::time::Duration;
use thiserror::Error;

/// Malformed input to one of the codecs
///
/// Always recovered locally: the offending item is logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record too short: expected at least {expected} fields, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("unexpected record prefix '{0}'")]
    BadPrefix(String),

    #[error("invalid {field}: '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("checksum mismatch: sentence says {expected:02X}, computed {computed:02X}")]
    ChecksumMismatch { expected: u8, computed: u8 },

    #[error("sentence has no checksum delimiter")]
    MissingChecksum,

    #[error("unsupported sentence type '{0}'")]
    UnsupportedSentence(String),

    #[error("receiver reports no position fix")]
    NoFix,

    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// Failure to hand an item to the hub
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The hub loop has stopped; nothing will be routed any more
    #[error("data hub is closed")]
    HubClosed,

    /// The hub inbound queue stayed full for the whole bounded wait
    #[error("data hub inbound queue full for {0:?}, item dropped")]
    BackpressureOverflow(Duration),
}

/// Registry bookkeeping problems; never fatal to the hub
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("consumer #{0} is already registered")]
    Duplicate(u64),

    #[error("consumer #{0} is not registered")]
    NotRegistered(u64),

    #[error("consumer '{0}' subscribed to an empty content type set")]
    EmptySubscription(String),

    #[error("data hub is closed")]
    HubClosed,
}

/// An input adapter lost its source for good
#[derive(Debug, Error)]
#[error("input '{adapter}' I/O failure: {source}")]
pub struct ProducerIoError {
    pub adapter: String,
    #[source]
    pub source: std::io::Error,
}

/// A consumer did not exit within the shutdown grace period
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("adapter '{adapter}' did not stop within {grace:?}, terminated")]
pub struct ShutdownTimeout {
    pub adapter: String,
    pub grace: Duration,
}

/// Illegal move in a transformation stage state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal pipeline transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}
