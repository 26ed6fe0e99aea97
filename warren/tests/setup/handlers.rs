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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use warren::prelude::*;

use crate::setup::messages::{OrderAccepted, OrderPlaced};

/// Records every order it sees and announces it as accepted.
#[derive(Clone, Default)]
pub struct OrderDesk {
    pub seen: Arc<Mutex<Vec<u32>>>,
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
    pub work: Duration,
}

impl OrderDesk {
    pub fn slow(work: Duration) -> Self {
        Self {
            work,
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<u32> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Handles<OrderPlaced> for OrderDesk {
    async fn handle(&self, order: OrderPlaced, bus: &mut Bus) -> anyhow::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.seen.lock().push(order.id);
        bus.publish(&OrderAccepted { id: order.id }, None).await?;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Answers every order with an `OrderAccepted` reply.
#[derive(Clone, Default)]
pub struct Replier;

#[async_trait]
impl Handles<OrderPlaced> for Replier {
    async fn handle(&self, order: OrderPlaced, bus: &mut Bus) -> anyhow::Result<()> {
        bus.reply(&OrderAccepted { id: order.id }).await?;
        Ok(())
    }
}

/// Fails on the ids it is told to reject.
#[derive(Clone, Default)]
pub struct Picky {
    pub reject: Vec<u32>,
    pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Handles<OrderPlaced> for Picky {
    async fn handle(&self, order: OrderPlaced, bus: &mut Bus) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        bus.publish(&OrderAccepted { id: order.id }, None).await?;
        if self.reject.contains(&order.id) {
            anyhow::bail!("order {} rejected", order.id);
        }
        Ok(())
    }
}
