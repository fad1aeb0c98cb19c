//! Centralized queue sizes for every channel in FlightBox
//!
//! All queues are bounded. Sizes are picked against a busy dump1090 feed, which
//! peaks around 1,000 SBS1 lines per second with a few hundred aircraft in range.

/// Hub inbound queue shared by all producers
/// Roughly two seconds of a busy SBS1 feed plus the transformation output it
/// triggers (one NMEA sentence and one traffic frame per position record)
pub const HUB_INBOUND_QUEUE_SIZE: usize = 4_096;

/// Per-consumer inbox filled by the hub
/// Smaller than the inbound queue so a stalled consumer starts dropping
/// (and shows up in `hub.items.dropped_total`) long before the hub backs up
pub const CONSUMER_INBOX_SIZE: usize = 1_024;

/// Per-client outbound queue in the TCP broadcast server
/// A client that falls this far behind loses items instead of slowing the others
pub const BROADCAST_CLIENT_QUEUE_SIZE: usize = 256;

/// Lines buffered between a serial reader thread and its async publisher
pub const SERIAL_LINE_QUEUE_SIZE: usize = 64;

/// Calculate the warning threshold for queue depth monitoring
///
/// Returns 80% of queue capacity as the warning threshold. When a queue
/// exceeds this threshold, warnings are logged to indicate potential backpressure.
///
/// # Examples
/// ```
/// use flightbox::queue_config::queue_warning_threshold;
///
/// assert_eq!(queue_warning_threshold(100), 80);
/// assert_eq!(queue_warning_threshold(4096), 3276);
/// ```
pub const fn queue_warning_threshold(size: usize) -> usize {
    (size * 80) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_warning_threshold() {
        assert_eq!(queue_warning_threshold(100), 80);
        assert_eq!(queue_warning_threshold(1_024), 819);
        assert_eq!(queue_warning_threshold(HUB_INBOUND_QUEUE_SIZE), 3_276);
    }

    #[test]
    fn test_inbox_smaller_than_hub_queue() {
        const { assert!(CONSUMER_INBOX_SIZE < HUB_INBOUND_QUEUE_SIZE) };
    }
}
