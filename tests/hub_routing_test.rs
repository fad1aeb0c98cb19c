// Integration tests for content-type routing through the data hub

mod common;

use std::time::Duration;

use common::{Recorder, drain_items, next_item};
use flightbox::data_hub::ANY;
use flightbox::{
    ContentType, Coordinator, DataHub, HubConfig, Item, LifecycleConfig, Message, OverflowPolicy,
    Subscription,
};

fn lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        settle_delay: Duration::ZERO,
        producer_stop_timeout: Duration::from_millis(500),
        consumer_grace: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_nmea_and_any_outputs() {
    let (nmea_only, nmea_rx) = Recorder::new("nmea-out", Subscription::to(["nmea"]));
    let (everything, any_rx) = Recorder::new("any-out", Subscription::to([ANY]));

    let mut coordinator = Coordinator::new(HubConfig::default(), lifecycle());
    coordinator
        .start(vec![Box::new(nmea_only), Box::new(everything)])
        .await
        .unwrap();

    let hub = coordinator.hub().clone();
    hub.publish(Item::text(ContentType::Sbs1, "MSG,3,1,1,4CA2C5,1"))
        .await
        .unwrap();
    hub.publish(Item::text(ContentType::Nmea, "$GPGGA,1*00"))
        .await
        .unwrap();

    let report = coordinator.shutdown().await;
    assert!(report.is_clean());

    let (any_items, any_pilled) = drain_items(&any_rx).await;
    let (nmea_items, nmea_pilled) = drain_items(&nmea_rx).await;
    assert!(any_pilled && nmea_pilled);

    let any_types: Vec<&ContentType> = any_items.iter().map(|i| i.content_type()).collect();
    assert_eq!(any_types, vec![&ContentType::Sbs1, &ContentType::Nmea]);
    assert_eq!(nmea_items.len(), 1);
    assert_eq!(nmea_items[0].payload_str(), Some("$GPGGA,1*00"));
}

#[tokio::test]
async fn test_unmatched_items_reach_nobody() {
    let (flarm, flarm_rx) = Recorder::new("flarm-out", Subscription::to([ContentType::Flarm]));
    let mut coordinator = Coordinator::new(HubConfig::default(), lifecycle());
    coordinator.start(vec![Box::new(flarm)]).await.unwrap();

    coordinator
        .hub()
        .publish(Item::text(ContentType::Gnss, "$GPRMC"))
        .await
        .unwrap();
    coordinator.shutdown().await;

    let (items, pilled) = drain_items(&flarm_rx).await;
    assert!(items.is_empty());
    assert!(pilled);
}

#[tokio::test]
async fn test_per_producer_order_is_kept() {
    let (recorder, rx) = Recorder::new("ordered", Subscription::any());
    let mut coordinator = Coordinator::new(HubConfig::default(), lifecycle());
    coordinator.start(vec![Box::new(recorder)]).await.unwrap();

    const PER_PRODUCER: usize = 300;
    let mut producers = Vec::new();
    for producer in ["a", "b", "c"] {
        let hub = coordinator.hub().clone();
        producers.push(tokio::spawn(async move {
            for seq in 0..PER_PRODUCER {
                hub.publish(Item::text(ContentType::Sbs1, format!("{producer},{seq}")))
                    .await
                    .unwrap();
                if seq % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    coordinator.shutdown().await;

    let (items, _) = drain_items(&rx).await;
    assert_eq!(items.len(), PER_PRODUCER * 3);

    for producer in ["a", "b", "c"] {
        let seqs: Vec<usize> = items
            .iter()
            .filter_map(|i| i.payload_str())
            .filter_map(|p| p.split_once(','))
            .filter(|(name, _)| *name == producer)
            .map(|(_, seq)| seq.parse().unwrap())
            .collect();
        assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>(), "producer {producer}");
    }
}

#[tokio::test]
async fn test_slow_consumer_does_not_block_others() {
    let (hub, handle) = DataHub::new(HubConfig {
        inbox_size: 4,
        overflow: OverflowPolicy::Drop,
        ..Default::default()
    });
    let hub_task = tokio::spawn(hub.run());

    // Never read until the end
    let slow = handle
        .register("slow", Subscription::any(), false)
        .await
        .unwrap();
    let (fast, fast_rx) = Recorder::new("fast", Subscription::any());
    let fast_inbox = handle
        .register("fast", Subscription::any(), false)
        .await
        .unwrap();
    let fast_task = tokio::spawn(<Recorder as flightbox::Adapter>::run(
        Box::new(fast),
        flightbox::AdapterContext {
            hub: handle.clone(),
            inbox: Some(fast_inbox),
            cancel: Default::default(),
        },
    ));

    for i in 0..50 {
        handle
            .publish(Item::text(ContentType::Nmea, format!("{i}")))
            .await
            .unwrap();
        // Let the fast consumer keep up with its small inbox
        next_item(&fast_rx).await;
    }

    let mut slow_count = 0;
    while let Some(Message::Data(_)) = slow.try_recv() {
        slow_count += 1;
    }
    assert_eq!(slow_count, 4);

    handle.shutdown().await.unwrap();
    fast_task.await.unwrap().unwrap();
    drop(slow);
    hub_task.await.unwrap();
}

#[tokio::test]
async fn test_wait_policy_delivers_to_a_draining_consumer() {
    let (hub, handle) = DataHub::new(HubConfig {
        inbox_size: 2,
        overflow: OverflowPolicy::Wait,
        delivery_wait: Duration::from_secs(1),
        ..Default::default()
    });
    tokio::spawn(hub.run());
    let inbox = handle
        .register("reader", Subscription::any(), false)
        .await
        .unwrap();

    let reader = tokio::spawn(async move {
        let mut count = 0;
        while let Some(Message::Data(_)) = inbox.recv().await {
            count += 1;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        count
    });

    for i in 0..20 {
        handle
            .publish(Item::text(ContentType::Sbs1, format!("{i}")))
            .await
            .unwrap();
    }
    handle.shutdown().await.unwrap();
    assert_eq!(reader.await.unwrap(), 20);
}

#[tokio::test]
async fn test_redundant_subscription_entries_deliver_once() {
    let (recorder, rx) = Recorder::new("dup", Subscription::to(["nmea", "NMEA", "nmea"]));
    let mut coordinator = Coordinator::new(HubConfig::default(), lifecycle());
    coordinator.start(vec![Box::new(recorder)]).await.unwrap();

    coordinator
        .hub()
        .publish(Item::text(ContentType::Nmea, "$X*00"))
        .await
        .unwrap();
    coordinator.shutdown().await;

    let (items, _) = drain_items(&rx).await;
    assert_eq!(items.len(), 1);
}
