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

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Application headers attached to a message.
pub type Headers = BTreeMap<String, String>;

/// Header names written and read by the bus itself.
pub mod header {
    /// RFC 3339 timestamp before which the message must not be handled.
    pub const DEFERRED_TIME: &str = "warren-deferred-time";
    /// How many times the message has been put back because it was deferred.
    pub const DEFERRED_COUNT: &str = "warren-deferred-count";
    /// Why the message was sent: `command`, `event` or `reply`.
    pub const INTENT: &str = "warren-intent";
    /// How many times processing of the message has failed.
    pub const FAILURE_COUNT: &str = "warren-failure-count";
    /// Description of the last processing failure.
    pub const ERROR_DESCRIPTION: &str = "warren-error-description";
    /// Queue the message was originally consumed from.
    pub const ORIGIN_QUEUE: &str = "warren-origin-queue";
}

/// Why an outgoing message was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageIntent {
    /// Point-to-point message addressed to one queue.
    Command,
    /// Broadcast to every subscriber of a topic.
    Event,
    /// Answer to an incoming message.
    Reply,
}

impl MessageIntent {
    /// Header representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Reply => "reply",
        }
    }
}

impl std::fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport metadata of a message (the AMQP "basic properties").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// MIME type of the body.
    pub content_type: Option<String>,
    /// Encoding of the body.
    pub content_encoding: Option<String>,
    /// Unique id of this message.
    pub message_id: Option<String>,
    /// Id shared by a request and its replies.
    pub correlation_id: Option<String>,
    /// Queue replies should be sent to.
    pub reply_to: Option<String>,
    /// Wire type name of the body.
    pub message_type: Option<String>,
    /// Creation time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Whether the broker should persist the message.
    pub persistent: bool,
    /// Application headers.
    pub headers: Headers,
}

impl MessageProperties {
    /// Reads a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Reads a numeric header, treating absent or malformed values as zero.
    #[must_use]
    pub fn counter(&self, name: &str) -> u32 {
        self.header(name)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Returns the deferred delivery time, if the message carries a valid one.
    #[must_use]
    pub fn deferred_until(&self) -> Option<DateTime<Utc>> {
        self.header(header::DEFERRED_TIME)
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|time| time.with_timezone(&Utc))
    }

    /// True while the deferred time, if any, still lies after `now`.
    #[must_use]
    pub fn is_not_yet_due(&self, now: DateTime<Utc>) -> bool {
        self.deferred_until().is_some_and(|until| until > now)
    }
}

/// A message handed to a consumer by the broker.
///
/// Carries the method metadata (tag, exchange, routing key, redelivery flag),
/// the header metadata ([`MessageProperties`]) and the raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel scoped delivery tag used for ack/nack.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// True when the broker has delivered this message before.
    pub redelivered: bool,
    /// Header metadata.
    pub properties: MessageProperties,
    /// Raw body.
    pub body: Vec<u8>,
}
