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

//! Error types shared by every part of the bus.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = BusError> = std::result::Result<T, E>;

/// Whether an error is worth another attempt.
///
/// The supervisor retries [`ErrorKind::Retryable`] failures according to its
/// [`RetryPolicy`](crate::prelude::RetryPolicy) and gives up immediately on
/// [`ErrorKind::Fatal`] ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient broker or transport condition.
    Retryable,
    /// Misconfiguration or a bug; retrying cannot help.
    Fatal,
}

/// Errors raised by the bus, its broker collaborators and the pipeline.
#[derive(Debug, Error)]
pub enum BusError {
    /// A connection to the broker could not be established.
    #[error("failed to connect to broker: {0}")]
    Connection(String),

    /// The broker connection is closed.
    #[error("broker connection is closed")]
    ConnectionClosed,

    /// The channel was closed, by the broker or by us.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Declaring an exchange, queue or binding failed.
    #[error("topology declaration failed: {0}")]
    Topology(String),

    /// Publishing a message failed.
    #[error("publish to exchange '{exchange}' with routing key '{routing_key}' failed: {reason}")]
    Publish {
        /// Target exchange.
        exchange: String,
        /// Routing key used.
        routing_key: String,
        /// Broker supplied reason.
        reason: String,
    },

    /// Acknowledging or rejecting a delivery failed.
    #[error("acknowledgement of delivery {delivery_tag} failed: {reason}")]
    Acknowledge {
        /// Delivery tag of the message.
        delivery_tag: u64,
        /// Broker supplied reason.
        reason: String,
    },

    /// Encoding or decoding a message body failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Consuming was requested without a listener queue.
    #[error("listening queue is not set, so the consumer cannot be started")]
    ListenerQueueNotSet,

    /// Invalid input to a bus operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A message handler returned an error.
    #[error("message handler '{handler}' failed: {source}")]
    Handler {
        /// Name of the failing handler.
        handler: String,
        /// The handler's error.
        #[source]
        source: anyhow::Error,
    },

    /// A message handler panicked.
    #[error("message handler '{handler}' panicked: {message}")]
    HandlerPanicked {
        /// Name of the failing handler.
        handler: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// The retry budget ran out.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error of the final attempt.
        last: Box<BusError>,
    },
}

impl BusError {
    /// Classifies the error for retry decisions.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_)
            | Self::ConnectionClosed
            | Self::ChannelClosed(_)
            | Self::Topology(_)
            | Self::Publish { .. }
            | Self::Acknowledge { .. }
            | Self::Handler { .. }
            | Self::HandlerPanicked { .. } => ErrorKind::Retryable,
            Self::Serialization(_)
            | Self::ListenerQueueNotSet
            | Self::InvalidArgument(_)
            | Self::Config(_)
            | Self::RetriesExhausted { .. } => ErrorKind::Fatal,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Retryable`.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
