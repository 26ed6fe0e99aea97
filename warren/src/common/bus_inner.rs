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
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument};

use crate::common::{declare_default_topology, BusConfig, Endpoint, Result, Topology};
use crate::consumer::ChannelRegistry;
use crate::message::HandlerSet;
use crate::pipeline::Pipeline;
use crate::traits::{
    BrokerChannel, BrokerClient, BrokerConnection, ErrorHandler, MessageHandler, PropertyBuilder,
    Serializer,
};

/// State shared by a bus setup and every consumer it starts.
pub(crate) struct BusInner {
    /// Opens broker connections.
    pub(crate) client: Arc<dyn BrokerClient>,

    /// Read-only configuration.
    pub(crate) config: BusConfig,

    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) property_builder: Arc<dyn PropertyBuilder>,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
    pub(crate) pipeline: Pipeline,

    /// Registered handlers. Replaced wholesale on registration so every
    /// delivery sees a stable snapshot.
    pub(crate) handlers: RwLock<HandlerSet>,

    /// Open channels by id.
    pub(crate) registry: ChannelRegistry,

    /// Consumer workers and watchdogs.
    pub(crate) tracker: TaskTracker,

    /// Cancelled by `stop_consumers`; replaced afterwards so consumers can be started again.
    pub(crate) shutdown: Mutex<CancellationToken>,
}

impl BusInner {
    pub(crate) fn handlers_snapshot(&self) -> HandlerSet {
        self.handlers.read().clone()
    }

    pub(crate) fn add_handler(&self, handler: Arc<dyn MessageHandler>) -> usize {
        let mut handlers = self.handlers.write();
        let mut updated: Vec<Arc<dyn MessageHandler>> = handlers.iter().cloned().collect();
        updated.push(handler);
        let count = updated.len();
        *handlers = updated.into();
        count
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().clone()
    }

    pub(crate) fn endpoint(
        &self,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
        listener_queue: Option<String>,
        direct_exchange: &str,
        topic_exchange: &str,
    ) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            connection,
            channel,
            listener_queue,
            direct_exchange: direct_exchange.to_string(),
            topic_exchange: topic_exchange.to_string(),
            error_queue: self.config.errors.error_queue.clone(),
            serializer: Arc::clone(&self.serializer),
            property_builder: Arc::clone(&self.property_builder),
            confirm_delivery: self.config.consumer.confirm_delivery,
        })
    }

    /// Connects, declares `topology` and disconnects again.
    #[instrument(skip(self, topology), fields(queue = ?topology.listener_queue))]
    pub(crate) async fn assert_connection(&self, topology: &Topology) -> Result<()> {
        let connection = self.client.connect().await?;
        let outcome = async {
            let channel = connection.open_channel().await?;
            let declared = declare_default_topology(channel.as_ref(), topology).await;
            if channel.is_open() {
                channel.close().await?;
            }
            declared
        }
        .await;
        if connection.is_open() {
            connection.close().await?;
        }
        debug!(ok = outcome.is_ok(), "connection asserted");
        outcome
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner")
            .field("client", &self.client)
            .field("pipeline", &self.pipeline)
            .field("handlers", &self.handlers.read().len())
            .field("channels", &self.registry.len())
            .finish_non_exhaustive()
    }
}
