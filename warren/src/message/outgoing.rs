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

use static_assertions::assert_impl_all;

use crate::message::MessageProperties;

/// A fully encoded message waiting to be published.
///
/// Records are immutable once built; the bus only appends them to an
/// [`OutgoingBuffer`] and the acknowledge step publishes them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
}

impl OutgoingMessage {
    /// Creates a record. An empty exchange addresses the queue named by `routing_key` directly.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            properties,
            body,
        }
    }

    /// Target exchange.
    #[inline]
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing key.
    #[inline]
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Transport metadata.
    #[inline]
    #[must_use]
    pub const fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Encoded body.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Ordered buffer of outgoing messages owned by exactly one message's processing.
#[derive(Debug, Default)]
pub struct OutgoingBuffer {
    messages: Vec<OutgoingMessage>,
}

impl OutgoingBuffer {
    /// Appends a record.
    pub fn push(&mut self, message: OutgoingMessage) {
        self.messages.push(message);
    }

    /// Buffered records in insertion order.
    #[must_use]
    pub fn as_slice(&self) -> &[OutgoingMessage] {
        &self.messages
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Empties the buffer, returning the records.
    pub fn take(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.messages)
    }

    /// Drops every buffered record.
    pub fn discard(&mut self) -> usize {
        let dropped = self.messages.len();
        self.messages.clear();
        dropped
    }
}

assert_impl_all!(OutgoingMessage: Send, Sync);
