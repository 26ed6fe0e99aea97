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
use warren::prelude::*;

use crate::setup::handlers::{OrderDesk, Replier};
use crate::setup::messages::OrderPlaced;
use crate::setup::*;

mod setup;

fn consumes(broker: &MemoryBroker) -> usize {
    broker
        .ops()
        .iter()
        .filter(|op| matches!(op, BrokerOp::Consume { .. }))
        .count()
}

#[tokio::test]
async fn start_async_declares_topology_and_consumes() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    let options = ConsumeOptions::queue("orders").subscribe("orders.#");
    let _workers = setup.start_async(2, &options).await?;

    assert!(wait_until(PATIENCE, || setup.channel_count() == 2).await);
    assert!(broker.has_exchange("WarrenDirect"));
    assert!(broker.has_exchange("WarrenTopic"));
    assert!(broker.has_queue("error"));
    assert_eq!(broker.bindings("WarrenDirect", "orders"), vec!["orders".to_string()]);
    assert_eq!(broker.bindings("WarrenTopic", "orders"), vec!["orders.#".to_string()]);
    assert_eq!(broker.consumer_count("orders"), 2);

    let channels = setup.channels();
    assert_ne!(channels[0].id, channels[1].id);
    assert!(channels
        .iter()
        .all(|channel| channel.state == ChannelState::Consuming));
    assert_eq!(setup.connections().len(), 2);

    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn configured_listener_queue_is_used_by_default() -> anyhow::Result<()> {
    let mut config = test_config();
    config.listener.queue = Some("billing".to_string());
    let (broker, setup) = setup_with(config);

    let _workers = setup.start_async(1, &ConsumeOptions::default()).await?;
    assert!(wait_until(PATIENCE, || broker.consumer_count("billing") == 1).await);

    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn consuming_without_a_queue_is_rejected() {
    let (_broker, setup) = setup_with(test_config());

    let result = setup.start_async(1, &ConsumeOptions::default()).await;
    assert!(matches!(result, Err(BusError::ListenerQueueNotSet)));

    let result = setup.start(&ConsumeOptions::queue("")).await;
    assert!(matches!(result, Err(BusError::ListenerQueueNotSet)));
}

#[tokio::test]
async fn unreachable_broker_fails_start_async() {
    let (broker, setup) = setup_with(test_config());
    broker.fail_next_connects(1);

    let result = setup.start_async(1, &ConsumeOptions::queue("orders")).await;
    assert!(matches!(result, Err(BusError::Connection(_))));
    assert_eq!(setup.channel_count(), 0);
}

#[tokio::test]
async fn transport_failure_reopens_channel_with_new_id() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    assert!(wait_until(PATIENCE, || setup.channel_count() == 1).await);
    let first = setup.channels()[0].id;

    broker.drop_connections();

    assert!(
        wait_until(PATIENCE, || setup
            .channels()
            .first()
            .is_some_and(|channel| channel.id != first))
        .await
    );
    assert_eq!(consumes(&broker), 2);
    assert_eq!(setup.channel_count(), 1);

    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn unforced_stop_reopens_channel() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    assert!(wait_until(PATIENCE, || setup.channel_count() == 1).await);
    let first = setup.channels()[0].id;

    assert_eq!(setup.stop(Some(first), false).await, 1);

    assert!(
        wait_until(PATIENCE, || setup
            .channels()
            .first()
            .is_some_and(|channel| channel.id != first))
        .await
    );
    assert_eq!(consumes(&broker), 2);

    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn forced_stop_keeps_channel_down() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    let mut workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    assert!(wait_until(PATIENCE, || setup.channel_count() == 1).await);
    let id = setup.channels()[0].id;

    assert_eq!(setup.stop(Some(id), true).await, 1);

    let outcome = within(PATIENCE, workers.remove(0)).await?;
    assert!(outcome.is_ok());
    assert_eq!(setup.channel_count(), 0);
    assert_eq!(broker.consumer_count("orders"), 0);
    assert_eq!(consumes(&broker), 1);
    assert_eq!(broker.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn stopping_unknown_channel_stops_nothing() -> anyhow::Result<()> {
    let (_broker, setup) = setup_with(test_config());
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    assert!(wait_until(PATIENCE, || setup.channel_count() == 1).await);
    let id = setup.channels()[0].id;

    setup.stop(Some(id), true).await;
    assert!(wait_until(PATIENCE, || setup.channel_count() == 0).await);
    assert_eq!(setup.stop(Some(id), true).await, 0);
    Ok(())
}

#[tokio::test]
async fn stop_consumers_waits_for_every_worker_and_allows_restart() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    let workers = setup.start_async(3, &ConsumeOptions::queue("orders")).await?;
    assert!(wait_until(PATIENCE, || setup.channel_count() == 3).await);

    within(PATIENCE, setup.stop_consumers()).await;

    assert_eq!(setup.channel_count(), 0);
    assert_eq!(broker.consumer_count("orders"), 0);
    for worker in workers {
        assert!(worker.is_finished());
        assert!(worker.await?.is_ok());
    }

    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    assert!(wait_until(PATIENCE, || setup.channel_count() == 1).await);
    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn foreground_start_returns_after_forced_stop() {
    let (_broker, setup) = setup_with(test_config());
    let options = ConsumeOptions::queue("orders");

    let consumer = setup.start(&options);
    let stopper = async {
        assert!(wait_until(PATIENCE, || setup.channel_count() == 1).await);
        setup.stop(None, true).await
    };
    let (outcome, stopped) = within(PATIENCE, async { tokio::join!(consumer, stopper) }).await;

    assert!(outcome.is_ok());
    assert_eq!(stopped, 1);
    assert_eq!(setup.channel_count(), 0);
}

#[tokio::test]
async fn supervisor_retries_until_broker_accepts() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    let _workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    // Takes effect before the worker's first attempt.
    broker.fail_next_connects(3);

    assert!(wait_until(PATIENCE, || setup.channel_count() == 1).await);
    // start_async, the worker's successful probe, and the consuming channel.
    assert_eq!(broker.connections_opened(), 3);

    setup.stop_consumers().await;
    Ok(())
}

#[tokio::test]
async fn bounded_retries_are_exhausted() -> anyhow::Result<()> {
    let mut config = test_config();
    config.retry.tries = 3;
    let (broker, setup) = setup_with(config);
    let mut workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    broker.fail_next_connects(10);

    let outcome = within(PATIENCE, workers.remove(0)).await?;
    assert!(matches!(
        outcome,
        Err(BusError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(setup.channel_count(), 0);
    Ok(())
}

#[tokio::test]
async fn dropping_the_setup_stops_consumers() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(test_config());
    let mut workers = setup.start_async(1, &ConsumeOptions::queue("orders")).await?;
    assert!(wait_until(PATIENCE, || broker.consumer_count("orders") == 1).await);

    drop(setup);

    let outcome = within(PATIENCE, workers.remove(0)).await?;
    assert!(outcome.is_ok());
    assert!(wait_until(PATIENCE, || broker.open_connections() == 0).await);
    Ok(())
}

#[tokio::test]
async fn handler_registration_is_counted() {
    let (_broker, setup) = setup_with(test_config());
    assert_eq!(setup.message_handler_count(), 0);
    assert_eq!(
        setup.add_handler::<OrderPlaced, _>(OrderDesk::default()),
        1
    );
    assert_eq!(
        setup.add_handler::<OrderPlaced, _>(Replier),
        2
    );
    assert_eq!(setup.message_handler_count(), 2);
    assert_eq!(
        setup.pipeline(),
        vec![
            "outer-guard",
            "deferred-check",
            "deserialize",
            "dispatch",
            "acknowledge-and-flush"
        ]
    );
}
