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
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Warren
//!
//! A message-bus engine for AMQP-style brokers, built on Tokio. Warren keeps
//! long-lived consumer channels running, watches them for stalls, and runs
//! every delivery through a pipeline that only publishes the messages a
//! handler sent once the handler has succeeded.
//!
//! ## Key Concepts
//!
//! - **Setup (`BusSetup`)**: registers handlers, declares topology, starts
//!   supervised consumers and stops them again.
//! - **Bus (`Bus`)**: the handle a handler sends commands, events and replies
//!   through. Inside a handler nothing is transmitted until the delivery is
//!   acknowledged.
//! - **Pipeline (`Pipeline`)**: the chain every delivery runs through: error
//!   guard, deferral check, deserialization, dispatch, then flush and ack.
//! - **Consumers**: each channel is a `ChannelEntry` with a unique id, a
//!   consume loop that reopens the channel after transport failures, and a
//!   `HeartbeatWatchdog` that recycles stalled channels.
//! - **Broker traits**: `BrokerClient`, `BrokerConnection` and `BrokerChannel`
//!   abstract the client library. `memory::MemoryBroker` implements them
//!   in-process.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warren::prelude::*;
//!
//! #[bus_message]
//! struct OrderPlaced {
//!     id: u64,
//! }
//!
//! struct Billing;
//!
//! #[async_trait]
//! impl Handles<OrderPlaced> for Billing {
//!     async fn handle(&self, order: OrderPlaced, bus: &mut Bus) -> anyhow::Result<()> {
//!         bus.publish(&order, Some("billing.invoiced")).await?;
//!         Ok(())
//!     }
//! }
//!
//! let setup = BusSetup::builder(Arc::new(MemoryBroker::new())).build();
//! setup.add_handler::<OrderPlaced, _>(Billing);
//! let workers = setup.start_async(1, &ConsumeOptions::queue("billing")).await?;
//! ```

/// Setup, bus handle, configuration, topology and errors.
pub(crate) mod common;

/// Consumer startup, channel lifecycles and watchdogs.
pub(crate) mod consumer;

/// Message records flowing through the bus.
pub(crate) mod message;

/// The per-delivery processing chain.
pub(crate) mod pipeline;

/// Collaborator interfaces.
pub(crate) mod traits;

/// In-process broker for tests and local development.
pub mod memory;

/// A prelude module for conveniently importing the most commonly used items.
///
/// # Re-exports
///
/// ## Macros (from `warren-macro`)
/// *   [`warren_macro::bus_message`]: Attribute macro for defining bus messages.
///
/// ## External Crates
/// *   [`async_trait::async_trait`](https://docs.rs/async-trait/latest/async_trait/attr.async_trait.html): The macro for defining async functions in traits.
pub mod prelude {
    // Macros from warren-macro
    pub use warren_macro::*;

    // External crate re-exports
    pub use async_trait::async_trait;

    // Core types
    pub use crate::common::{
        declare_default_topology, topic_matches, Bus, BusConfig, BusError, BusOptions, BusSetup,
        BusSetupBuilder, ConnectionConfig, ConsumeOptions, ConsumerConfig, ErrorKind,
        ErrorsConfig, ExchangeKind, ExchangeSettings, ExchangesConfig, ListenerConfig,
        QueueSettings, Result, SendOptions, Topology,
    };
    pub use crate::consumer::{
        retry_call, ChannelEntry, ChannelId, ChannelInfo, ChannelRegistry, ChannelState,
        RetryPolicy, MAX_WATCHDOG_SLEEP,
    };
    pub use crate::memory::{BrokerOp, MemoryBroker, QueuedMessage};
    pub use crate::message::{
        header, Delivery, HandlerSet, Headers, IncomingMessage, MessageContext, MessageIntent,
        MessageProperties, OutgoingBuffer, OutgoingMessage,
    };
    pub use crate::pipeline::{
        AcknowledgeAndFlush, DeferredCheck, DeserializeBody, Dispatch, Next, OuterGuard,
        Pipeline, PipelineStep,
    };
    pub use crate::traits::{
        BrokerChannel, BrokerClient, BrokerConnection, BusMessage, DefaultErrorHandler,
        DefaultPropertyBuilder, DeliveryStream, ErrorDisposition, ErrorHandler, Handles,
        Interest, JsonSerializer, MessageHandler, PropertyBuilder, PropertyRequest, Serializer,
        TypedHandler,
    };
}
