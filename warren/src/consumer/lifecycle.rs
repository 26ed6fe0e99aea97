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

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::common::{declare_default_topology, BusInner, Result, Topology};
use crate::consumer::{ChannelEntry, ChannelState, HeartbeatWatchdog};
use crate::message::MessageContext;
use crate::traits::{BrokerChannel, BrokerConnection, DeliveryStream};

/// Why a consume loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumeExit {
    /// A forced stop was requested; the channel stays down.
    ForceClosed,
    /// The bus is shutting down.
    Shutdown,
    /// Transport failure or unforced stop; the channel is reopened.
    Interrupted,
}

/// Opens a channel, consumes from it, and reopens it until it is force stopped.
///
/// Each pass creates a fresh [`ChannelEntry`], so a reopened channel always
/// gets a new id. Errors while connecting or declaring are returned to the
/// caller; failures while consuming lead to a reopen.
#[derive(Debug, Clone)]
pub(crate) struct ChannelLifecycle {
    inner: Arc<BusInner>,
    topology: Arc<Topology>,
    queue: String,
    shutdown: CancellationToken,
}

impl ChannelLifecycle {
    pub(crate) fn new(
        inner: Arc<BusInner>,
        topology: Arc<Topology>,
        queue: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner,
            topology,
            queue,
            shutdown,
        }
    }

    /// Consumes until force stopped or shut down.
    #[instrument(skip(self), fields(queue = %self.queue))]
    pub(crate) async fn run(&self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            match self.run_once().await? {
                ConsumeExit::ForceClosed | ConsumeExit::Shutdown => return Ok(()),
                ConsumeExit::Interrupted => info!("consumer interrupted; reopening channel"),
            }
        }
    }

    /// One channel from open to close.
    pub(crate) async fn run_once(&self) -> Result<ConsumeExit> {
        let connection = self.inner.client.connect().await?;
        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly(None, &connection).await;
                return Err(e);
            }
        };

        let stream = match self.open(channel.as_ref()).await {
            Ok(stream) => stream,
            Err(e) => {
                close_quietly(Some(&channel), &connection).await;
                return Err(e);
            }
        };

        let entry = Arc::new(ChannelEntry::new(
            Arc::clone(&channel),
            Arc::clone(&connection),
        ));
        self.inner.registry.insert(Arc::clone(&entry));
        entry.set_state(ChannelState::Consuming);

        let watchdog_cancel = CancellationToken::new();
        let consumer = &self.inner.config.consumer;
        let watchdog = HeartbeatWatchdog::new(
            Arc::clone(&entry),
            self.queue.clone(),
            self.inner.config.connection.watchdog_interval(),
            consumer.dead_timeout(),
            watchdog_cancel.clone(),
        );
        self.inner.tracker.spawn(watchdog.run());
        info!(channel = %entry.id(), "consuming");

        let exit = self.consume(&entry, stream).await;

        entry.set_state(match exit {
            ConsumeExit::ForceClosed | ConsumeExit::Shutdown => ChannelState::Stopped,
            ConsumeExit::Interrupted if entry.state() == ChannelState::Crashed => ChannelState::Crashed,
            ConsumeExit::Interrupted => ChannelState::Idle,
        });
        self.inner.registry.remove(entry.id());
        watchdog_cancel.cancel();
        close_quietly(Some(&channel), &connection).await;
        debug!(channel = %entry.id(), ?exit, "channel closed");
        Ok(exit)
    }

    async fn open(&self, channel: &dyn BrokerChannel) -> Result<DeliveryStream> {
        let consumer = &self.inner.config.consumer;
        declare_default_topology(channel, &self.topology).await?;
        channel
            .set_qos(consumer.prefetch_size, consumer.prefetch_count)
            .await?;
        if consumer.confirm_delivery {
            channel.confirm_select().await?;
        }
        channel.consume(&self.queue).await
    }

    async fn consume(&self, entry: &Arc<ChannelEntry>, mut stream: DeliveryStream) -> ConsumeExit {
        let endpoint = self.inner.endpoint(
            Arc::clone(entry.connection()),
            Arc::clone(entry.channel()),
            Some(self.queue.clone()),
            &self.topology.direct_exchange,
            &self.topology.topic_exchange,
        );

        loop {
            let item = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return ConsumeExit::Shutdown,
                () = entry.closing().cancelled() => {
                    return if entry.is_force_closed() {
                        ConsumeExit::ForceClosed
                    } else {
                        ConsumeExit::Interrupted
                    };
                }
                item = stream.recv() => item,
            };

            match item {
                Some(Ok(delivery)) => {
                    entry.touch();
                    let mut context = MessageContext::new(
                        entry.id(),
                        Arc::clone(&endpoint),
                        Arc::clone(&self.inner.error_handler),
                        self.inner.handlers_snapshot(),
                        delivery,
                        entry.forced().clone(),
                    );
                    if let Err(e) = self.inner.pipeline.run(&mut context).await {
                        error!(error = %e, "pipeline failed; message left unacknowledged");
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "consume failed");
                    entry.set_state(ChannelState::Crashed);
                    return ConsumeExit::Interrupted;
                }
                None if entry.is_force_closed() => return ConsumeExit::ForceClosed,
                None => return ConsumeExit::Interrupted,
            }
        }
    }
}

async fn close_quietly(channel: Option<&Arc<dyn BrokerChannel>>, connection: &Arc<dyn BrokerConnection>) {
    if let Some(channel) = channel {
        if channel.is_open() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "closing channel failed");
            }
        }
    }
    if connection.is_open() {
        if let Err(e) = connection.close().await {
            debug!(error = %e, "closing connection failed");
        }
    }
}
