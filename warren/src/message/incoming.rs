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

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::common::{BusError, Result};
use crate::message::{Delivery, MessageProperties};
use crate::traits::BusMessage;

/// A delivery after deserialization, as seen by message handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    payload: Value,
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
}

impl IncomingMessage {
    /// Wraps a deserialized payload together with the delivery it came from.
    #[must_use]
    pub fn new(payload: Value, delivery: &Delivery) -> Self {
        Self {
            payload,
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            properties: delivery.properties.clone(),
        }
    }

    /// Wire type name from the message properties.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.properties.message_type.as_deref()
    }

    /// Returns true if the message carries `M`'s type name.
    #[must_use]
    pub fn is<M: BusMessage>(&self) -> bool {
        self.message_type() == Some(M::MESSAGE_TYPE)
    }

    /// Deserialized payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Converts the payload into a concrete type.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M> {
        M::deserialize(&self.payload).map_err(|e| BusError::Serialization(e.to_string()))
    }

    /// Exchange the message arrived through.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing key the message was published with.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Transport metadata.
    #[must_use]
    pub const fn properties(&self) -> &MessageProperties {
        &self.properties
    }
}
