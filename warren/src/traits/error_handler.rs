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

use std::fmt::Debug;

use crate::common::{BusError, ErrorKind};
use crate::message::{header, MessageContext};

/// What to do with a message whose processing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Acknowledge and drop it as a poison message.
    Ack,
    /// Negatively acknowledge it so the broker redelivers it unchanged.
    Requeue,
    /// Put a copy back on the listener queue with the failure count increased, then ack.
    Retry,
    /// Move it to `queue` with the error description attached, then ack.
    DeadLetter {
        /// Queue receiving the message.
        queue: String,
    },
}

impl std::fmt::Display for ErrorDisposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::Requeue => write!(f, "requeue"),
            Self::Retry => write!(f, "retry"),
            Self::DeadLetter { queue } => write!(f, "dead-letter to '{queue}'"),
        }
    }
}

/// Decides the fate of messages whose processing failed.
pub trait ErrorHandler: Send + Sync + Debug + 'static {
    /// Called once per failed pipeline run with the context and the error.
    fn handle(&self, context: &MessageContext, error: &BusError) -> ErrorDisposition;
}

/// Retries a message up to `max_retries` times, then dead-letters it.
///
/// Fatal errors, such as a body that cannot be decoded, are dead-lettered
/// right away.
#[derive(Debug, Clone)]
pub struct DefaultErrorHandler {
    max_retries: u32,
    error_queue: String,
}

impl DefaultErrorHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(max_retries: u32, error_queue: impl Into<String>) -> Self {
        Self {
            max_retries,
            error_queue: error_queue.into(),
        }
    }

    /// Queue receiving dead-lettered messages.
    #[must_use]
    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }
}

impl Default for DefaultErrorHandler {
    fn default() -> Self {
        Self::new(5, "error")
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn handle(&self, context: &MessageContext, error: &BusError) -> ErrorDisposition {
        let failures = context.delivery().properties.counter(header::FAILURE_COUNT) + 1;
        if error.kind() == ErrorKind::Fatal || failures >= self.max_retries {
            ErrorDisposition::DeadLetter {
                queue: self.error_queue.clone(),
            }
        } else {
            ErrorDisposition::Retry
        }
    }
}
