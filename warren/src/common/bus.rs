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
use std::time::Duration;

use chrono::{DateTime, Utc};
use static_assertions::assert_impl_all;
use tokio::runtime::Handle;
use tracing::{debug, instrument, trace, warn};

use crate::common::{BusError, Result};
use crate::message::{
    header, Delivery, Headers, MessageIntent, MessageProperties, OutgoingBuffer, OutgoingMessage,
};
use crate::traits::{
    BrokerChannel, BrokerConnection, BusMessage, PropertyBuilder, PropertyRequest, Serializer,
};

/// The exchange that routes straight to the queue named by the routing key.
pub(crate) const DEFAULT_EXCHANGE: &str = "";

/// Transport and collaborators a [`Bus`] publishes through.
///
/// Shared read-only between the bus of every delivery on one channel.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) listener_queue: Option<String>,
    pub(crate) direct_exchange: String,
    pub(crate) topic_exchange: String,
    pub(crate) error_queue: String,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) property_builder: Arc<dyn PropertyBuilder>,
    pub(crate) confirm_delivery: bool,
}

/// Per-call options for [`Bus::send_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Extra application headers.
    pub headers: Headers,
    /// Queue replies should go to. Defaults to the bus's listener queue.
    pub reply_to: Option<String>,
    /// Do not handle the message before this much time has passed.
    pub delay: Option<Duration>,
}

#[derive(Debug)]
enum Mode {
    /// Bound to one delivery; everything is buffered until the pipeline flushes.
    Delivery,
    /// Created through `BusSetup::create_bus`; owns its transport.
    Standalone {
        in_transaction: bool,
        close_channel: bool,
        close_connection: bool,
        closed: bool,
    },
}

/// Handle used to send messages, either from a message handler or from a
/// pure publisher.
///
/// Inside the pipeline every operation only appends an [`OutgoingMessage`] to
/// the buffer of the message being processed. Nothing reaches the broker until
/// the acknowledge step publishes the whole buffer, and if processing fails
/// the buffer is discarded.
///
/// A standalone bus publishes immediately unless a transaction was opened with
/// [`Bus::begin_transaction`].
#[derive(Debug)]
pub struct Bus {
    endpoint: Arc<Endpoint>,
    incoming: Option<Arc<Delivery>>,
    outgoing: OutgoingBuffer,
    mode: Mode,
}

impl Bus {
    pub(crate) fn for_delivery(endpoint: Arc<Endpoint>, delivery: Arc<Delivery>) -> Self {
        Self {
            endpoint,
            incoming: Some(delivery),
            outgoing: OutgoingBuffer::default(),
            mode: Mode::Delivery,
        }
    }

    pub(crate) fn standalone(
        endpoint: Arc<Endpoint>,
        close_channel: bool,
        close_connection: bool,
    ) -> Self {
        Self {
            endpoint,
            incoming: None,
            outgoing: OutgoingBuffer::default(),
            mode: Mode::Standalone {
                in_transaction: false,
                close_channel,
                close_connection,
                closed: false,
            },
        }
    }

    /// Sends a command to `queue` through the direct exchange.
    ///
    /// Without a queue the message goes to the bus's own listener queue.
    pub async fn send<M: BusMessage>(&mut self, message: &M, queue: Option<&str>) -> Result<()> {
        self.send_with(message, queue, SendOptions::default()).await
    }

    /// Sends a command that must not be handled before `delay` has passed.
    pub async fn defer<M: BusMessage>(
        &mut self,
        message: &M,
        delay: Duration,
        queue: Option<&str>,
    ) -> Result<()> {
        let options = SendOptions {
            delay: Some(delay),
            ..SendOptions::default()
        };
        self.send_with(message, queue, options).await
    }

    /// Sends a command with explicit options.
    #[instrument(skip(self, message, options), fields(message_type = M::MESSAGE_TYPE))]
    pub async fn send_with<M: BusMessage>(
        &mut self,
        message: &M,
        queue: Option<&str>,
        options: SendOptions,
    ) -> Result<()> {
        let queue = match queue.or(self.endpoint.listener_queue.as_deref()) {
            Some(queue) if !queue.is_empty() => queue.to_string(),
            _ => {
                return Err(BusError::InvalidArgument(
                    "no destination queue and no listener queue to default to".to_string(),
                ))
            }
        };
        let deferred_until = match options.delay {
            Some(delay) => Some(deferred_time(delay)?),
            None => None,
        };
        let reply_to = options
            .reply_to
            .or_else(|| self.endpoint.listener_queue.clone());
        let exchange = self.endpoint.direct_exchange.clone();
        let record = self.encode(
            message,
            MessageIntent::Command,
            &exchange,
            &queue,
            reply_to.as_deref(),
            deferred_until,
            &options.headers,
        )?;
        self.enqueue(record).await
    }

    /// Publishes an event through the topic exchange.
    ///
    /// Without a topic the message type name is used as the routing key.
    #[instrument(skip(self, message), fields(message_type = M::MESSAGE_TYPE))]
    pub async fn publish<M: BusMessage>(&mut self, message: &M, topic: Option<&str>) -> Result<()> {
        let topic = topic.unwrap_or(M::MESSAGE_TYPE);
        if topic.is_empty() {
            return Err(BusError::InvalidArgument("topic must not be empty".to_string()));
        }
        let exchange = self.endpoint.topic_exchange.clone();
        let reply_to = self.endpoint.listener_queue.clone();
        let record = self.encode(
            message,
            MessageIntent::Event,
            &exchange,
            topic,
            reply_to.as_deref(),
            None,
            &Headers::new(),
        )?;
        self.enqueue(record).await
    }

    /// Replies to the sender of the message being processed.
    ///
    /// Fails outside of a delivery or when the incoming message has no
    /// `reply_to` queue.
    #[instrument(skip(self, message), fields(message_type = M::MESSAGE_TYPE))]
    pub async fn reply<M: BusMessage>(&mut self, message: &M) -> Result<()> {
        let reply_to = self
            .incoming
            .as_ref()
            .ok_or_else(|| BusError::InvalidArgument("reply requires an incoming message".to_string()))?
            .properties
            .reply_to
            .clone()
            .filter(|queue| !queue.is_empty())
            .ok_or_else(|| {
                BusError::InvalidArgument("incoming message has no reply_to queue".to_string())
            })?;
        let own_queue = self.endpoint.listener_queue.clone();
        let record = self.encode(
            message,
            MessageIntent::Reply,
            DEFAULT_EXCHANGE,
            &reply_to,
            own_queue.as_deref(),
            None,
            &Headers::new(),
        )?;
        self.enqueue(record).await
    }

    /// Forwards the raw incoming message to an error queue.
    ///
    /// The body and properties are kept; `reason` is attached as a header.
    /// Without a queue the configured error queue is used.
    #[instrument(skip(self))]
    pub async fn send_to_error(&mut self, reason: &str, error_queue: Option<&str>) -> Result<()> {
        let delivery = self.incoming.as_ref().ok_or_else(|| {
            BusError::InvalidArgument("send_to_error requires an incoming message".to_string())
        })?;
        let queue = error_queue.unwrap_or(&self.endpoint.error_queue).to_string();
        let origin = self.endpoint.listener_queue.as_deref();
        let record = error_copy(delivery, &queue, reason, origin);
        self.enqueue(record).await
    }

    /// Opens a transaction on a standalone bus. Messages are held until [`Bus::commit`].
    pub fn begin_transaction(&mut self) -> Result<()> {
        match &mut self.mode {
            Mode::Standalone { in_transaction, .. } if !*in_transaction => {
                *in_transaction = true;
                Ok(())
            }
            Mode::Standalone { .. } => Err(BusError::InvalidArgument(
                "a transaction is already open".to_string(),
            )),
            Mode::Delivery => Err(BusError::InvalidArgument(
                "a delivery bus is always transactional".to_string(),
            )),
        }
    }

    /// Publishes every held message as one batch and closes the transaction.
    #[instrument(skip(self), fields(buffered = self.outgoing.len()))]
    pub async fn commit(&mut self) -> Result<()> {
        match &mut self.mode {
            Mode::Standalone { in_transaction, .. } if *in_transaction => *in_transaction = false,
            _ => {
                return Err(BusError::InvalidArgument(
                    "no open transaction to commit".to_string(),
                ))
            }
        }
        let batch = self.outgoing.take();
        self.endpoint
            .channel
            .publish_batch(&batch, self.endpoint.confirm_delivery)
            .await?;
        debug!(published = batch.len(), "transaction committed");
        Ok(())
    }

    /// Drops every held message and closes the transaction.
    pub fn rollback(&mut self) -> Result<()> {
        match &mut self.mode {
            Mode::Standalone { in_transaction, .. } if *in_transaction => {
                *in_transaction = false;
                let dropped = self.outgoing.discard();
                debug!(dropped, "transaction rolled back");
                Ok(())
            }
            _ => Err(BusError::InvalidArgument(
                "no open transaction to roll back".to_string(),
            )),
        }
    }

    /// Releases the channel and connection of a standalone bus according to
    /// its close flags. Later calls do nothing.
    pub async fn close(&mut self) -> Result<()> {
        let Mode::Standalone {
            close_channel,
            close_connection,
            closed,
            ..
        } = &mut self.mode
        else {
            return Ok(());
        };
        if *closed {
            return Ok(());
        }
        *closed = true;
        let dropped = self.outgoing.discard();
        if dropped > 0 {
            warn!(dropped, "closing bus with an open transaction");
        }
        release(&self.endpoint, *close_channel, *close_connection).await
    }

    /// Properties of the message being processed.
    #[must_use]
    pub fn incoming(&self) -> Option<&MessageProperties> {
        self.incoming.as_ref().map(|delivery| &delivery.properties)
    }

    /// Messages buffered so far, in publish order.
    #[must_use]
    pub fn outgoing(&self) -> &[OutgoingMessage] {
        self.outgoing.as_slice()
    }

    /// Queue this bus listens on, if any.
    #[must_use]
    pub fn listener_queue(&self) -> Option<&str> {
        self.endpoint.listener_queue.as_deref()
    }

    /// The underlying broker channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.endpoint.channel
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<OutgoingMessage> {
        self.outgoing.take()
    }

    pub(crate) fn discard_outgoing(&mut self) -> usize {
        self.outgoing.discard()
    }

    #[allow(clippy::too_many_arguments)]
    fn encode<M: BusMessage>(
        &self,
        message: &M,
        intent: MessageIntent,
        exchange: &str,
        routing_key: &str,
        reply_to: Option<&str>,
        deferred_until: Option<DateTime<Utc>>,
        headers: &Headers,
    ) -> Result<OutgoingMessage> {
        let payload = serde_json::to_value(message)?;
        let body = self.endpoint.serializer.serialize(&payload)?;
        let request = PropertyRequest {
            message_type: M::MESSAGE_TYPE,
            intent,
            content_type: self.endpoint.serializer.content_type(),
            content_encoding: self.endpoint.serializer.content_encoding(),
            incoming: self.incoming(),
            reply_to,
            deferred_until,
            headers,
        };
        let properties = self.endpoint.property_builder.build(&request);
        Ok(OutgoingMessage::new(exchange, routing_key, properties, body))
    }

    async fn enqueue(&mut self, record: OutgoingMessage) -> Result<()> {
        match self.mode {
            Mode::Standalone {
                in_transaction: false,
                ..
            } => {
                trace!(exchange = record.exchange(), routing_key = record.routing_key(), "publishing");
                self.endpoint
                    .channel
                    .publish(&record, self.endpoint.confirm_delivery)
                    .await
            }
            _ => {
                trace!(exchange = record.exchange(), routing_key = record.routing_key(), "buffering");
                self.outgoing.push(record);
                Ok(())
            }
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        let Mode::Standalone {
            close_channel,
            close_connection,
            closed: false,
            ..
        } = self.mode
        else {
            return;
        };
        if !close_channel && !close_connection {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            let endpoint = Arc::clone(&self.endpoint);
            handle.spawn(async move {
                if let Err(e) = release(&endpoint, close_channel, close_connection).await {
                    warn!(error = %e, "failed to release bus transport on drop");
                }
            });
        } else {
            warn!("bus dropped outside a tokio runtime; transport left open");
        }
    }
}

async fn release(endpoint: &Endpoint, close_channel: bool, close_connection: bool) -> Result<()> {
    if close_channel && endpoint.channel.is_open() {
        endpoint.channel.close().await?;
    }
    if close_connection && endpoint.connection.is_open() {
        endpoint.connection.close().await?;
    }
    Ok(())
}

fn deferred_time(delay: Duration) -> Result<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay)
        .map_err(|e| BusError::InvalidArgument(format!("deferral delay out of range: {e}")))?;
    Ok(Utc::now() + delay)
}

/// Copy of a delivery addressed to `queue` through the default exchange,
/// carrying `reason` as its error description.
pub(crate) fn error_copy(
    delivery: &Delivery,
    queue: &str,
    reason: &str,
    origin_queue: Option<&str>,
) -> OutgoingMessage {
    let mut properties = delivery.properties.clone();
    properties
        .headers
        .insert(header::ERROR_DESCRIPTION.to_string(), reason.to_string());
    if let Some(origin) = origin_queue {
        properties
            .headers
            .insert(header::ORIGIN_QUEUE.to_string(), origin.to_string());
    }
    OutgoingMessage::new(DEFAULT_EXCHANGE, queue, properties, delivery.body.clone())
}

assert_impl_all!(Bus: Send, Sync);
