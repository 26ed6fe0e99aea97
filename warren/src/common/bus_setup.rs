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

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace};

use crate::common::{
    Bus, BusConfig, BusError, BusInner, ExchangeSettings, QueueSettings, Result, Topology,
};
use crate::consumer::{ChannelId, ChannelInfo, ChannelLifecycle, ChannelRegistry, ConsumerSupervisor};
use crate::pipeline::Pipeline;
use crate::traits::{
    BrokerClient, BrokerConnection, BusMessage, DefaultErrorHandler, DefaultPropertyBuilder,
    ErrorHandler, Handles, JsonSerializer, MessageHandler, PropertyBuilder, Serializer,
    TypedHandler,
};

/// Per-call overrides of the configured listener queue, exchanges and subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Queue to consume from.
    pub listener_queue: Option<String>,
    /// Declare settings of the listener queue.
    pub listener_queue_settings: Option<QueueSettings>,
    /// Exchange events are published through.
    pub topic_exchange: Option<String>,
    /// Declare settings of the topic exchange.
    pub topic_exchange_settings: Option<ExchangeSettings>,
    /// Exchange commands are sent through.
    pub direct_exchange: Option<String>,
    /// Declare settings of the direct exchange.
    pub direct_exchange_settings: Option<ExchangeSettings>,
    /// Topics to bind the listener queue to.
    pub subscriptions: Option<Vec<String>>,
}

impl ConsumeOptions {
    /// Options consuming from `queue`.
    #[must_use]
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            listener_queue: Some(queue.into()),
            ..Self::default()
        }
    }

    /// Adds a topic subscription.
    #[must_use]
    pub fn subscribe(mut self, topic: impl Into<String>) -> Self {
        self.subscriptions
            .get_or_insert_with(Vec::new)
            .push(topic.into());
        self
    }

    fn resolve(&self, config: &BusConfig) -> Topology {
        Topology {
            listener_queue: self
                .listener_queue
                .clone()
                .or_else(|| config.listener.queue.clone())
                .filter(|queue| !queue.is_empty()),
            listener_queue_settings: self
                .listener_queue_settings
                .clone()
                .unwrap_or_else(|| config.listener.queue_settings.clone()),
            direct_exchange: self
                .direct_exchange
                .clone()
                .unwrap_or_else(|| config.exchanges.direct.clone()),
            direct_exchange_settings: self
                .direct_exchange_settings
                .clone()
                .unwrap_or_else(|| config.exchanges.direct_settings.clone()),
            topic_exchange: self
                .topic_exchange
                .clone()
                .unwrap_or_else(|| config.exchanges.topic.clone()),
            topic_exchange_settings: self
                .topic_exchange_settings
                .clone()
                .unwrap_or_else(|| config.exchanges.topic_settings.clone()),
            subscriptions: self
                .subscriptions
                .clone()
                .unwrap_or_else(|| config.listener.subscriptions.clone()),
            error_queue: Some(config.errors.error_queue.clone()),
        }
    }
}

/// Options of [`BusSetup::create_bus`].
#[derive(Debug, Clone, Default)]
pub struct BusOptions {
    /// Listener queue used as the default destination and `reply_to`.
    pub listener_queue: Option<String>,
    /// Exchange events are published through.
    pub topic_exchange: Option<String>,
    /// Exchange commands are sent through.
    pub direct_exchange: Option<String>,
    /// Existing connection to open the channel on. When set, the bus does not
    /// close the connection unless `close_connection_on_drop` says so.
    pub connection: Option<Arc<dyn BrokerConnection>>,
    /// Close the bus's channel on `close` or drop. Defaults to true.
    pub close_channel_on_drop: Option<bool>,
    /// Close the connection on `close` or drop. Defaults to true only when
    /// the bus opened the connection itself.
    pub close_connection_on_drop: Option<bool>,
}

/// Builds a [`BusSetup`].
#[derive(Debug)]
pub struct BusSetupBuilder {
    client: Arc<dyn BrokerClient>,
    config: BusConfig,
    serializer: Option<Arc<dyn Serializer>>,
    property_builder: Option<Arc<dyn PropertyBuilder>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    pipeline: Option<Pipeline>,
}

impl BusSetupBuilder {
    /// Starts a builder with default configuration.
    #[must_use]
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            config: BusConfig::default(),
            serializer: None,
            property_builder: None,
            error_handler: None,
            pipeline: None,
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the [`JsonSerializer`].
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Replaces the [`DefaultPropertyBuilder`].
    #[must_use]
    pub fn with_property_builder(mut self, property_builder: Arc<dyn PropertyBuilder>) -> Self {
        self.property_builder = Some(property_builder);
        self
    }

    /// Replaces the [`DefaultErrorHandler`] built from the `errors` section.
    #[must_use]
    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    /// Replaces the default five-step pipeline.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Finishes the setup. No connection is opened yet.
    #[must_use]
    pub fn build(self) -> BusSetup {
        let error_handler = self.error_handler.unwrap_or_else(|| {
            Arc::new(DefaultErrorHandler::new(
                self.config.errors.max_retries,
                self.config.errors.error_queue.clone(),
            ))
        });
        let inner = BusInner {
            client: self.client,
            serializer: self.serializer.unwrap_or_else(|| Arc::new(JsonSerializer)),
            property_builder: self
                .property_builder
                .unwrap_or_else(|| Arc::new(DefaultPropertyBuilder)),
            error_handler,
            pipeline: self.pipeline.unwrap_or_default(),
            handlers: RwLock::new(Arc::from(Vec::new())),
            registry: ChannelRegistry::default(),
            tracker: TaskTracker::new(),
            shutdown: Mutex::new(CancellationToken::new()),
            config: self.config,
        };
        BusSetup {
            inner: Arc::new(inner),
        }
    }
}

/// Entry point of the bus: registers handlers, starts and stops consumers,
/// and creates standalone publishing buses.
///
/// Dropping the setup stops every consumer when
/// `consumer.stop_consumers_on_drop` is set.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use warren::prelude::*;
///
/// let broker = MemoryBroker::new();
/// let setup = BusSetup::builder(Arc::new(broker)).build();
/// setup.add_message_handler(MyHandler);
/// let workers = setup.start_async(2, &ConsumeOptions::queue("billing")).await?;
/// // ...
/// setup.stop_consumers().await;
/// ```
#[derive(Debug)]
pub struct BusSetup {
    inner: Arc<BusInner>,
}

impl BusSetup {
    /// Starts a [`BusSetupBuilder`].
    #[must_use]
    pub fn builder(client: Arc<dyn BrokerClient>) -> BusSetupBuilder {
        BusSetupBuilder::new(client)
    }

    /// Read-only configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Connects once and declares the exchanges, the listener queue (if any)
    /// with its bindings, and the error queue.
    #[instrument(skip(self, options))]
    pub async fn init(&self, options: &ConsumeOptions) -> Result<()> {
        let topology = options.resolve(&self.inner.config);
        self.inner.assert_connection(&topology).await?;
        info!("bus topology declared");
        Ok(())
    }

    /// Consumes on the current task until the consumer is force stopped or
    /// [`BusSetup::stop_consumers`] is called.
    ///
    /// Setup failures are returned; transport failures reopen the channel.
    pub async fn start(&self, options: &ConsumeOptions) -> Result<()> {
        let (topology, queue) = self.consumer_topology(options)?;
        ChannelLifecycle::new(
            Arc::clone(&self.inner),
            topology,
            queue,
            self.inner.shutdown_token(),
        )
        .run()
        .await
    }

    /// Starts `consumers` supervised consumers in the background.
    ///
    /// The broker connection and topology are asserted once first, so
    /// configuration problems surface here. Awaiting a returned handle
    /// reports the final outcome of that worker.
    #[instrument(skip(self, options))]
    pub async fn start_async(
        &self,
        consumers: usize,
        options: &ConsumeOptions,
    ) -> Result<Vec<JoinHandle<Result<()>>>> {
        let (topology, queue) = self.consumer_topology(options)?;
        self.inner.assert_connection(&topology).await?;
        let supervisor = ConsumerSupervisor::new(
            Arc::clone(&self.inner),
            topology,
            queue,
            self.inner.shutdown_token(),
        );
        info!(consumers, "starting consumers");
        Ok(supervisor.spawn(consumers))
    }

    /// Stops one channel, or all of them when `channel_id` is `None`.
    ///
    /// A forced stop keeps the channel down; otherwise its lifecycle reopens
    /// it. Returns how many channels were asked to stop.
    pub async fn stop(&self, channel_id: Option<ChannelId>, force_close: bool) -> usize {
        self.inner.registry.stop(channel_id, force_close).await
    }

    /// Force stops every consumer and waits until all workers and watchdogs
    /// have finished. Consumers may be started again afterwards.
    #[instrument(skip(self))]
    pub async fn stop_consumers(&self) {
        let shutdown = self.inner.shutdown_token();
        shutdown.cancel();
        let stopped = self.inner.registry.stop(None, true).await;
        trace!(stopped, "waiting for consumers");

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
        *self.inner.shutdown.lock() = CancellationToken::new();
        info!(stopped, "all consumers stopped");
    }

    /// Creates a standalone bus for publishing outside of message handlers.
    ///
    /// The bus owns its channel, and its connection unless one was passed in.
    #[instrument(skip(self, options))]
    pub async fn create_bus(&self, options: BusOptions) -> Result<Bus> {
        let (connection, owned) = match options.connection {
            Some(connection) => (connection, false),
            None => (self.inner.client.connect().await?, true),
        };
        let close_channel = options.close_channel_on_drop.unwrap_or(true);
        let close_connection = options.close_connection_on_drop.unwrap_or(owned);
        let channel = connection.open_channel().await?;
        if self.inner.config.consumer.confirm_delivery {
            channel.confirm_select().await?;
        }

        let config = &self.inner.config;
        let listener_queue = options
            .listener_queue
            .or_else(|| config.listener.queue.clone());
        let direct = options
            .direct_exchange
            .unwrap_or_else(|| config.exchanges.direct.clone());
        let topic = options
            .topic_exchange
            .unwrap_or_else(|| config.exchanges.topic.clone());
        let endpoint = self
            .inner
            .endpoint(connection, channel, listener_queue, &direct, &topic);
        debug!(close_channel, close_connection, "standalone bus created");
        Ok(Bus::standalone(endpoint, close_channel, close_connection))
    }

    /// Registers a handler. Returns the number of registered handlers.
    pub fn add_message_handler(&self, handler: impl MessageHandler) -> usize {
        self.inner.add_handler(Arc::new(handler))
    }

    /// Registers a typed handler for message type `M`.
    pub fn add_handler<M, H>(&self, handler: H) -> usize
    where
        M: BusMessage,
        H: Handles<M>,
    {
        self.add_message_handler(TypedHandler::<M, H>::new(handler))
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn message_handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Snapshots of the open channels.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.inner.registry.snapshot()
    }

    /// Number of open channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Connections of the open channels.
    #[must_use]
    pub fn connections(&self) -> Vec<(ChannelId, Arc<dyn BrokerConnection>)> {
        self.inner
            .registry
            .entries()
            .into_iter()
            .map(|entry| (entry.id(), Arc::clone(entry.connection())))
            .collect()
    }

    /// Step names of the pipeline, in execution order.
    #[must_use]
    pub fn pipeline(&self) -> Vec<&'static str> {
        self.inner.pipeline.step_names()
    }

    fn consumer_topology(&self, options: &ConsumeOptions) -> Result<(Arc<Topology>, String)> {
        let topology = options.resolve(&self.inner.config);
        let queue = topology
            .listener_queue
            .clone()
            .ok_or(BusError::ListenerQueueNotSet)?;
        Ok((Arc::new(topology), queue))
    }
}

impl Drop for BusSetup {
    fn drop(&mut self) {
        if !self.inner.config.consumer.stop_consumers_on_drop {
            return;
        }
        self.inner.shutdown_token().cancel();
        for entry in self.inner.registry.entries() {
            entry.mark_force_closed();
        }
        self.inner.tracker.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_override_configuration() {
        let mut config = BusConfig::default();
        config.listener.queue = Some("configured".to_string());
        config.listener.subscriptions = vec!["a.b".to_string()];

        let topology = ConsumeOptions::queue("explicit")
            .subscribe("orders.#")
            .resolve(&config);
        assert_eq!(topology.listener_queue.as_deref(), Some("explicit"));
        assert_eq!(topology.subscriptions, vec!["orders.#".to_string()]);
        assert_eq!(topology.direct_exchange, "WarrenDirect");

        let topology = ConsumeOptions::default().resolve(&config);
        assert_eq!(topology.listener_queue.as_deref(), Some("configured"));
        assert_eq!(topology.subscriptions, vec!["a.b".to_string()]);
        assert_eq!(topology.error_queue.as_deref(), Some("error"));
    }

    #[test]
    fn empty_queue_names_count_as_unset() {
        let topology = ConsumeOptions::queue("").resolve(&BusConfig::default());
        assert_eq!(topology.listener_queue, None);
    }
}
