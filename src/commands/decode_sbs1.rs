use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{debug, info};

use flightbox::codec::TrafficFrame;
use flightbox::geometry::Position;
use flightbox::item::{ContentType, Item};
use flightbox::transformation::{Sbs1ToFlarmTransformation, TransformationConfig};

/// Run an SBS1 capture through the transformation offline
///
/// Prints each `$PFBTP` sentence followed by the hex-encoded traffic frame.
pub fn handle_decode_sbs1(file: &Path, reference: Option<Position>) -> Result<()> {
    let input =
        std::fs::File::open(file).with_context(|| format!("Failed to open {:?}", file))?;
    let mut stage = Sbs1ToFlarmTransformation::new(
        "decode-sbs1",
        TransformationConfig {
            static_reference: reference,
            ..Default::default()
        },
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let (mut lines, mut frames, mut errors) = (0u64, 0u64, 0u64);

    for line in BufReader::new(input).lines() {
        let line = line.with_context(|| format!("Failed to read {:?}", file))?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;

        let items = match stage.transform(&Item::text(ContentType::Sbs1, line.trim())) {
            Ok(items) => items,
            Err(e) => {
                errors += 1;
                debug!("line {}: {}", lines, e);
                continue;
            }
        };

        for item in items {
            match item.content_type() {
                ContentType::Flarm => {
                    frames += 1;
                    let summary = TrafficFrame::decode(item.payload())
                        .map(|f| format!("id={:06X} alarm={:?}", f.identifier, f.alarm_level))
                        .unwrap_or_default();
                    writeln!(out, "{}  {}", hex::encode(item.payload()), summary)?;
                }
                _ => write!(out, "{}", item.payload_str().unwrap_or_default())?,
            }
        }
    }

    out.flush()?;
    info!(lines, frames, errors, "Decoded {:?}", file);
    Ok(())
}
