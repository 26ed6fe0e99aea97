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

//! The seam between the bus and the library that speaks the broker protocol.
//!
//! Warren never frames AMQP itself. An adapter for a concrete client library
//! implements these three traits; [`MemoryBroker`](crate::memory::MemoryBroker)
//! is the in-process implementation used for tests and local development.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::common::{ExchangeSettings, QueueSettings, Result};
use crate::message::{Delivery, OutgoingMessage};

/// Stream of deliveries produced by [`BrokerChannel::consume`].
///
/// `Some(Ok(_))` is a message, `Some(Err(_))` a transport failure, and `None`
/// means consuming was stopped.
pub type DeliveryStream = mpsc::UnboundedReceiver<Result<Delivery>>;

/// Factory for broker connections.
#[async_trait]
pub trait BrokerClient: Send + Sync + Debug + 'static {
    /// Opens a new connection.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync + Debug + 'static {
    /// Opens a new channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Lets the client process pending protocol frames, heartbeats included.
    async fn process_heartbeat_events(&self) -> Result<()>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Closes the connection and every channel on it.
    async fn close(&self) -> Result<()>;
}

/// One logical, independently sequenced conversation with the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync + Debug + 'static {
    /// Declares an exchange.
    async fn declare_exchange(&self, name: &str, settings: &ExchangeSettings) -> Result<()>;

    /// Declares a queue.
    async fn declare_queue(&self, name: &str, settings: &QueueSettings) -> Result<()>;

    /// Binds a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Sets the prefetch window. Zero disables either limit.
    async fn set_qos(&self, prefetch_size: u32, prefetch_count: u16) -> Result<()>;

    /// Switches the channel into publisher confirm mode.
    async fn confirm_select(&self) -> Result<()>;

    /// Starts consuming from a queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Stops every consumer on this channel; their streams end with `None`.
    async fn stop_consuming(&self) -> Result<()>;

    /// Publishes one message, waiting for the broker confirm when `confirm` is set.
    async fn publish(&self, message: &OutgoingMessage, confirm: bool) -> Result<()>;

    /// Publishes a batch of messages in order.
    ///
    /// Implementations backed by a transactional channel should make the batch
    /// atomic. The default publishes one message at a time.
    async fn publish_batch(&self, messages: &[OutgoingMessage], confirm: bool) -> Result<()> {
        for message in messages {
            self.publish(message, confirm).await?;
        }
        Ok(())
    }

    /// Acknowledges a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Negatively acknowledges a delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Returns the number of ready messages in a queue (passive declare).
    async fn inspect_queue(&self, queue: &str) -> Result<u32>;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Closes the channel. Unacknowledged deliveries are requeued by the broker.
    async fn close(&self) -> Result<()>;
}
