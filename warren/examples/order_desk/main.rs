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
//! Runs a small order desk against the in-process broker.
//!
//! Two consumers handle `OrderPlaced` commands, publish an `OrderAccepted`
//! event for each, and an audit queue subscribed to those events collects
//! them. Run with `RUST_LOG=warren=debug` to watch the pipeline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use warren::prelude::*;

#[bus_message]
struct OrderPlaced {
    id: u32,
    amount_cents: u64,
}

#[bus_message(name = "orders.accepted")]
struct OrderAccepted {
    id: u32,
}

#[derive(Clone, Default)]
struct OrderDesk {
    accepted: Arc<AtomicU32>,
}

#[async_trait]
impl Handles<OrderPlaced> for OrderDesk {
    async fn handle(&self, order: OrderPlaced, bus: &mut Bus) -> anyhow::Result<()> {
        if order.amount_cents == 0 {
            anyhow::bail!("order {} has no amount", order.id);
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        bus.publish(&OrderAccepted { id: order.id }, None).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .init();

    let broker = MemoryBroker::new();
    let mut config = BusConfig::default();
    config.consumer.prefetch_count = 4;
    config.errors.max_retries = 2;
    let setup = BusSetup::builder(Arc::new(broker.clone()))
        .with_config(config)
        .build();

    let desk = OrderDesk::default();
    setup.add_handler::<OrderPlaced, _>(desk.clone());
    setup
        .init(&ConsumeOptions::queue("audit").subscribe("orders.#"))
        .await?;
    let workers = setup
        .start_async(2, &ConsumeOptions::queue("orders"))
        .await?;

    let mut bus = setup.create_bus(BusOptions::default()).await?;
    bus.begin_transaction()?;
    for id in 1..=5 {
        let amount_cents = if id == 3 { 0 } else { u64::from(id) * 1_000 };
        bus.send(&OrderPlaced { id, amount_cents }, Some("orders")).await?;
    }
    bus.commit().await?;
    bus.close().await?;

    while broker.ready_count("audit") < 4 || broker.ready_count("error") < 1 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for channel in setup.channels() {
        println!("channel {} is {:?}", channel.id, channel.state);
    }
    println!(
        "accepted {} orders, {} events audited, {} dead-lettered",
        desk.accepted.load(Ordering::SeqCst),
        broker.ready_count("audit"),
        broker.ready_count("error"),
    );

    setup.stop_consumers().await;
    for worker in workers {
        worker.await??;
    }
    Ok(())
}
