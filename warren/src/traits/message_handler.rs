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

use std::marker::PhantomData;

use async_trait::async_trait;

use crate::common::{topic_matches, Bus};
use crate::message::IncomingMessage;
use crate::traits::BusMessage;

/// Which incoming messages a handler wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Every message.
    Any,
    /// Messages whose `type` property equals this name.
    MessageType(String),
    /// Messages whose routing key matches this topic pattern.
    Topic(String),
    /// Messages published with exactly this routing key.
    RoutingKey(String),
}

impl Interest {
    /// Interest in one message type.
    #[must_use]
    pub fn message<M: BusMessage>() -> Self {
        Self::MessageType(M::MESSAGE_TYPE.to_string())
    }

    /// Evaluates the interest against a message.
    #[must_use]
    pub fn matches(&self, message: &IncomingMessage) -> bool {
        match self {
            Self::Any => true,
            Self::MessageType(name) => message.message_type() == Some(name.as_str()),
            Self::Topic(pattern) => topic_matches(pattern, message.routing_key()),
            Self::RoutingKey(key) => message.routing_key() == key,
        }
    }
}

/// A registered consumer of incoming messages.
///
/// The dispatch step calls [`MessageHandler::handle`] on every handler whose
/// [`MessageHandler::interested_in`] returns true, in registration order.
/// Anything sent through the [`Bus`] is buffered and only published once
/// every handler has succeeded.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Declared interest.
    fn interest(&self) -> Interest {
        Interest::Any
    }

    /// Whether this handler should see `message`.
    fn interested_in(&self, message: &IncomingMessage) -> bool {
        self.interest().matches(message)
    }

    /// Handles one message.
    async fn handle(&self, message: &IncomingMessage, bus: &mut Bus) -> anyhow::Result<()>;
}

/// Handles one concrete message type.
#[async_trait]
pub trait Handles<M: BusMessage>: Send + Sync + 'static {
    /// Handles a decoded message.
    async fn handle(&self, message: M, bus: &mut Bus) -> anyhow::Result<()>;
}

/// Adapts a [`Handles<M>`] into a [`MessageHandler`] interested in `M` only.
pub struct TypedHandler<M, H> {
    inner: H,
    name: String,
    _message: PhantomData<fn() -> M>,
}

impl<M, H> TypedHandler<M, H>
where
    M: BusMessage,
    H: Handles<M>,
{
    /// Wraps a typed handler.
    #[must_use]
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            name: format!("{}<{}>", std::any::type_name::<H>(), M::MESSAGE_TYPE),
            _message: PhantomData,
        }
    }
}

impl<M, H> std::fmt::Debug for TypedHandler<M, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<M, H> MessageHandler for TypedHandler<M, H>
where
    M: BusMessage,
    H: Handles<M>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn interest(&self) -> Interest {
        Interest::message::<M>()
    }

    async fn handle(&self, message: &IncomingMessage, bus: &mut Bus) -> anyhow::Result<()> {
        let decoded: M = message.decode()?;
        self.inner.handle(decoded, bus).await
    }
}
