// End-to-end: SBS1 in, `$PFBTP` sentence and traffic frame out

mod common;

use std::time::Duration;

use common::{Recorder, drain_items, next_item};
use flightbox::codec::nmea::{Sentence, checksum};
use flightbox::codec::{AlarmLevel, TrafficFrame, TrafficPosition};
use flightbox::transformation::{PipelineState, Sbs1ToFlarmTransformation, TransformationConfig};
use flightbox::{ContentType, Coordinator, HubConfig, Item, LifecycleConfig, Subscription};

const SCENARIO: &str =
    "MSG,3,1,1,4CA2C5,1,2024-01-01,00:00:00,2024-01-01,00:00:00,,38000,,,51.5,-0.1,,,,,,0";

fn lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        settle_delay: Duration::ZERO,
        producer_stop_timeout: Duration::from_millis(500),
        consumer_grace: Duration::from_secs(2),
    }
}

fn stage() -> Sbs1ToFlarmTransformation {
    Sbs1ToFlarmTransformation::new("sbs1-flarm", TransformationConfig::default())
}

#[tokio::test]
async fn test_sbs1_record_becomes_sentence_and_frame() {
    let (recorder, rx) = Recorder::new(
        "display",
        Subscription::to([ContentType::Nmea, ContentType::Flarm]),
    );
    let mut coordinator = Coordinator::new(HubConfig::default(), lifecycle());
    coordinator
        .start(vec![Box::new(stage()), Box::new(recorder)])
        .await
        .unwrap();

    coordinator
        .hub()
        .publish(Item::text(ContentType::Sbs1, SCENARIO))
        .await
        .unwrap();

    let nmea = next_item(&rx).await;
    assert_eq!(nmea.content_type(), &ContentType::Nmea);
    let line = nmea.payload_str().unwrap();
    assert!(line.starts_with("$PFBTP,4CA2C5,"));
    assert!(line.ends_with("\r\n"));

    let sentence = Sentence::parse(line).unwrap();
    let body = line.trim_end().trim_start_matches('$');
    let (body, sum) = body.split_once('*').unwrap();
    assert_eq!(format!("{:02X}", checksum(body.as_bytes())), sum);
    let position = TrafficPosition::from_sentence(&sentence).unwrap();
    assert!((position.latitude - 51.5).abs() < 1e-6);
    assert!((position.longitude + 0.1).abs() < 1e-6);
    assert_eq!(position.altitude_ft, Some(38_000));

    let flarm = next_item(&rx).await;
    assert_eq!(flarm.content_type(), &ContentType::Flarm);
    let frame = TrafficFrame::decode(flarm.payload()).unwrap();
    assert_eq!(frame.identifier, 0x4CA2C5);
    assert_eq!(frame.alarm_level, AlarmLevel::None);

    let report = coordinator.shutdown().await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_shutdown_waits_for_transformation_outputs() {
    const LINES: usize = 100;

    let (recorder, rx) = Recorder::new(
        "display",
        Subscription::to([ContentType::Nmea, ContentType::Flarm]),
    );
    let stage = stage();
    let mut state = stage.state_watch();

    let mut coordinator = Coordinator::new(HubConfig::default(), lifecycle());
    coordinator
        .start(vec![Box::new(stage), Box::new(recorder)])
        .await
        .unwrap();

    for _ in 0..LINES {
        coordinator
            .hub()
            .publish(Item::text(ContentType::Sbs1, SCENARIO))
            .await
            .unwrap();
    }
    // Shut down straight away; the sentinel must reach the recorder only
    // after everything the stage produced for those lines
    let report = coordinator.shutdown().await;
    assert!(report.is_clean(), "{report:?}");

    let (items, pilled) = drain_items(&rx).await;
    assert!(pilled);
    assert_eq!(items.len(), LINES * 2);
    let frames = items
        .iter()
        .filter(|i| i.content_type() == &ContentType::Flarm)
        .count();
    assert_eq!(frames, LINES);

    state
        .wait_for(|s| *s == PipelineState::Stopped)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_gnss_reference_drives_alarm_level() {
    let (recorder, rx) = Recorder::new("display", Subscription::to([ContentType::Flarm]));
    let stage = Sbs1ToFlarmTransformation::new(
        "sbs1-flarm",
        TransformationConfig {
            use_gnss_reference: true,
            emit_nmea: false,
            ..Default::default()
        },
    );

    let mut coordinator = Coordinator::new(HubConfig::default(), lifecycle());
    coordinator
        .start(vec![Box::new(stage), Box::new(recorder)])
        .await
        .unwrap();

    // Own ship right below the target, same altitude
    let fix = flightbox::codec::nmea::encode_sentence(
        "GPGGA",
        &[
            "120000", "5130.000", "N", "00006.000", "W", "1", "08", "0.9", "11582.4", "M", "", "",
            "", "",
        ],
    );
    let hub = coordinator.hub().clone();
    hub.publish(Item::text(ContentType::Gnss, fix)).await.unwrap();
    hub.publish(Item::text(ContentType::Sbs1, SCENARIO))
        .await
        .unwrap();

    let frame = TrafficFrame::decode(next_item(&rx).await.payload()).unwrap();
    assert_eq!(frame.identifier, 0x4CA2C5);
    assert_eq!(frame.alarm_level, AlarmLevel::Urgent);
    assert!(frame.relative.is_some());

    coordinator.shutdown().await;
}
