/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use warren::prelude::*;

use crate::setup::handlers::{OrderDesk, Picky, Replier};
use crate::setup::messages::OrderPlaced;
use crate::setup::*;

mod setup;

async fn send_orders(setup: &BusSetup, ids: &[u32]) -> anyhow::Result<()> {
    let mut bus = setup.create_bus(BusOptions::default()).await?;
    for &id in ids {
        bus.send(&OrderPlaced { id }, Some("orders")).await?;
    }
    bus.close().await?;
    Ok(())
}

#[tokio::test]
async fn deliveries_are_processed_one_at_a_time_in_order() -> anyhow::Result<()> {
    let mut config = test_config();
    config.consumer.prefetch_count = 1;
    let (broker, setup) = setup_with(config);
    let desk = OrderDesk::slow(Duration::from_millis(10));
    setup.add_handler::<OrderPlaced, _>(desk.clone());
    setup
        .init(&ConsumeOptions::queue("audit").subscribe("OrderAccepted"))
        .await?;
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    assert!(wait_until(PATIENCE, || setup.channel_count() == 1).await);

    send_orders(&setup, &[1, 2, 3]).await?;

    assert!(wait_until(PATIENCE, || broker.acked().len() == 3).await);
    assert_eq!(desk.seen(), vec![1, 2, 3]);
    assert_eq!(desk.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(broker.ready_count("orders"), 0);
    assert_eq!(broker.ready_count("audit"), 3);

    // Each event reaches the broker before the ack of the order that caused it.
    let ops = broker.ops();
    let mut events = 0;
    for op in &ops {
        match op {
            BrokerOp::Publish { exchange, .. } if exchange == "WarrenTopic" => events += 1,
            BrokerOp::Ack { .. } => assert!(events > 0),
            _ => {}
        }
    }
    let acked = broker.acked();
    let mut sorted = acked.clone();
    sorted.sort_unstable();
    assert_eq!(acked, sorted);

    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn failing_handler_is_retried_then_dead_lettered() -> anyhow::Result<()> {
    let mut config = test_config();
    config.errors.max_retries = 2;
    let (broker, setup) = setup_with(config);
    let picky = Picky {
        reject: vec![7],
        ..Picky::default()
    };
    setup.add_handler::<OrderPlaced, _>(picky.clone());
    setup
        .init(&ConsumeOptions::queue("audit").subscribe("OrderAccepted"))
        .await?;
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;

    send_orders(&setup, &[7, 8]).await?;

    assert!(wait_until(PATIENCE, || broker.ready_count("error") == 1).await);
    assert!(wait_until(PATIENCE, || broker.ready_count("audit") == 1).await);
    assert_eq!(picky.attempts.load(Ordering::SeqCst), 3);

    let dead = broker.ready("error");
    let properties = &dead[0].properties;
    assert_eq!(properties.header(header::ORIGIN_QUEUE), Some("orders"));
    assert_eq!(properties.counter(header::FAILURE_COUNT), 1);
    assert!(properties
        .header(header::ERROR_DESCRIPTION)
        .is_some_and(|reason| reason.contains("order 7 rejected")));
    assert_eq!(
        serde_json::from_slice::<OrderPlaced>(&dead[0].body)?.id,
        7
    );
    assert!(wait_until(PATIENCE, || broker.unacked_count() == 0).await);

    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn consumer_survives_failures_and_keeps_its_channel() -> anyhow::Result<()> {
    let mut config = test_config();
    config.errors.max_retries = 1;
    let (broker, setup) = setup_with(config);
    let picky = Picky {
        reject: vec![1],
        ..Picky::default()
    };
    setup.add_handler::<OrderPlaced, _>(picky.clone());
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    assert!(wait_until(PATIENCE, || setup.channel_count() == 1).await);
    let channel = setup.channels()[0].id;

    send_orders(&setup, &[1, 2]).await?;

    assert!(wait_until(PATIENCE, || picky.attempts.load(Ordering::SeqCst) == 2).await);
    assert!(wait_until(PATIENCE, || broker.acked().len() == 2).await);
    assert_eq!(broker.ready_count("error"), 1);
    assert_eq!(setup.channels()[0].id, channel);

    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn replies_reach_the_senders_queue() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    setup.add_handler::<OrderPlaced, _>(Replier);
    setup.init(&ConsumeOptions::queue("client")).await?;
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;

    let mut client = setup
        .create_bus(BusOptions {
            listener_queue: Some("client".to_string()),
            ..BusOptions::default()
        })
        .await?;
    client.send(&OrderPlaced { id: 4 }, Some("orders")).await?;
    let request = broker
        .published()
        .into_iter()
        .find_map(|op| match op {
            BrokerOp::Publish {
                exchange,
                properties,
                ..
            } if exchange == "WarrenDirect" => Some(properties),
            _ => None,
        })
        .expect("request published");

    assert!(wait_until(PATIENCE, || broker.ready_count("client") == 1).await);
    let reply = &broker.ready("client")[0];
    assert_eq!(reply.exchange, "");
    assert_eq!(reply.properties.message_type.as_deref(), Some("OrderAccepted"));
    assert_eq!(reply.properties.header(header::INTENT), Some("reply"));
    assert_eq!(reply.properties.reply_to.as_deref(), Some("orders"));
    assert_eq!(reply.properties.correlation_id, request.message_id);

    client.close().await?;
    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn deferred_message_is_handled_once_due() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    let desk = OrderDesk::default();
    setup.add_handler::<OrderPlaced, _>(desk.clone());
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;

    let mut bus = setup.create_bus(BusOptions::default()).await?;
    let sent = Instant::now();
    bus.defer(&OrderPlaced { id: 5 }, Duration::from_millis(150), Some("orders"))
        .await?;

    assert!(wait_until(PATIENCE, || desk.seen() == vec![5]).await);
    assert!(sent.elapsed() >= Duration::from_millis(150));

    let republished = broker
        .published()
        .into_iter()
        .filter(|op| matches!(op, BrokerOp::Publish { exchange, .. } if exchange.is_empty()))
        .count();
    assert!(republished >= 1);

    bus.close().await?;
    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn messages_without_interested_handlers_are_acked() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;

    send_orders(&setup, &[1]).await?;

    assert!(wait_until(PATIENCE, || broker.acked().len() == 1).await);
    assert_eq!(broker.ready_count("error"), 0);

    setup.stop_consumers().await;
    Ok(())
}
