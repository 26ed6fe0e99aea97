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

use std::sync::Arc;

use static_assertions::assert_impl_all;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::common::{Bus, Endpoint};
use crate::consumer::ChannelId;
use crate::message::{Delivery, IncomingMessage};
use crate::traits::{BrokerChannel, BrokerConnection, ErrorHandler, MessageHandler, Serializer};

/// Snapshot of the registered handlers, in registration order.
pub type HandlerSet = Arc<[Arc<dyn MessageHandler>]>;

/// Mutable state of one delivery while it runs through the pipeline.
///
/// Created for every delivery and dropped once the pipeline has acknowledged,
/// rejected or abandoned it. Owned by exactly one consume loop.
pub struct MessageContext {
    channel_id: ChannelId,
    pub(crate) endpoint: Arc<Endpoint>,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
    pub(crate) handlers: HandlerSet,
    pub(crate) delivery: Arc<Delivery>,
    pub(crate) message: Option<IncomingMessage>,
    pub(crate) bus: Bus,
    span: Span,
    stop: CancellationToken,
}

impl MessageContext {
    pub(crate) fn new(
        channel_id: ChannelId,
        endpoint: Arc<Endpoint>,
        error_handler: Arc<dyn ErrorHandler>,
        handlers: HandlerSet,
        delivery: Delivery,
        stop: CancellationToken,
    ) -> Self {
        let span = tracing::info_span!(
            "message",
            channel = %channel_id,
            delivery_tag = delivery.delivery_tag,
            routing_key = %delivery.routing_key,
        );
        let delivery = Arc::new(delivery);
        let bus = Bus::for_delivery(Arc::clone(&endpoint), Arc::clone(&delivery));
        Self {
            channel_id,
            endpoint,
            error_handler,
            handlers,
            delivery,
            message: None,
            bus,
            span,
            stop,
        }
    }

    /// Id of the channel the delivery arrived on.
    #[must_use]
    pub const fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// The raw delivery.
    #[must_use]
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// The deserialized message, once the deserialize step has run.
    #[must_use]
    pub const fn message(&self) -> Option<&IncomingMessage> {
        self.message.as_ref()
    }

    /// Queue this consumer listens on.
    #[must_use]
    pub fn listener_queue(&self) -> Option<&str> {
        self.endpoint.listener_queue.as_deref()
    }

    /// Exchange commands are sent through.
    #[must_use]
    pub fn direct_exchange(&self) -> &str {
        &self.endpoint.direct_exchange
    }

    /// Exchange events are published through.
    #[must_use]
    pub fn topic_exchange(&self) -> &str {
        &self.endpoint.topic_exchange
    }

    /// Channel the delivery arrived on.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.endpoint.channel
    }

    /// Connection the channel belongs to.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.endpoint.connection
    }

    /// Serializer used for bodies.
    #[must_use]
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.endpoint.serializer
    }

    /// Handlers registered when the delivery arrived.
    #[must_use]
    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    /// The bus of this delivery.
    #[must_use]
    pub const fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Mutable access to the bus of this delivery.
    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    /// Span every log line of this delivery is recorded in.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// True once a forced stop was requested for the channel.
    #[must_use]
    pub fn is_force_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub(crate) fn confirm_delivery(&self) -> bool {
        self.endpoint.confirm_delivery
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("channel_id", &self.channel_id)
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("handlers", &self.handlers.len())
            .field("message", &self.message)
            .field("buffered", &self.bus.outgoing().len())
            .finish_non_exhaustive()
    }
}

assert_impl_all!(MessageContext: Send);
