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

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::traits::{BrokerChannel, BrokerConnection};

/// Unique id of one opened channel. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a channel is in its life.
///
/// `Idle -> Opening -> Consuming -> {Stopping, Crashed}`. A stopped channel is
/// `Stopped` when the stop was forced and is not restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Not opened yet.
    Idle,
    /// Declaring topology and registering the consumer.
    Opening,
    /// Receiving deliveries.
    Consuming,
    /// A stop was requested.
    Stopping,
    /// The transport failed under the consumer.
    Crashed,
    /// Force stopped; will not be restarted.
    Stopped,
}

/// Registry record of one open channel.
#[derive(Debug)]
pub struct ChannelEntry {
    id: ChannelId,
    channel: Arc<dyn BrokerChannel>,
    connection: Arc<dyn BrokerConnection>,
    last_message: Mutex<Instant>,
    state: Mutex<ChannelState>,
    force_close: AtomicBool,
    closing: CancellationToken,
    forced: CancellationToken,
}

impl ChannelEntry {
    pub(crate) fn new(
        channel: Arc<dyn BrokerChannel>,
        connection: Arc<dyn BrokerConnection>,
    ) -> Self {
        Self {
            id: ChannelId::new(),
            channel,
            connection,
            last_message: Mutex::new(Instant::now()),
            state: Mutex::new(ChannelState::Opening),
            force_close: AtomicBool::new(false),
            closing: CancellationToken::new(),
            forced: CancellationToken::new(),
        }
    }

    /// Id of the channel.
    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// The broker channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// The connection the channel lives on.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    /// Records that a delivery just arrived.
    pub(crate) fn touch(&self) {
        *self.last_message.lock() = Instant::now();
    }

    /// Time since the last delivery, or since the channel opened.
    #[must_use]
    pub fn since_last_message(&self) -> Duration {
        self.last_message.lock().elapsed()
    }

    /// True when the channel must not be restarted.
    #[must_use]
    pub fn is_force_closed(&self) -> bool {
        self.force_close.load(Ordering::SeqCst)
    }

    /// Cancelled by any stop request.
    pub(crate) fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Cancelled by forced stop requests only.
    pub(crate) fn forced(&self) -> &CancellationToken {
        &self.forced
    }

    /// Flags the channel as force closed and wakes its consume loop.
    pub(crate) fn mark_force_closed(&self) {
        self.force_close.store(true, Ordering::SeqCst);
        self.forced.cancel();
        self.set_state(ChannelState::Stopping);
        self.closing.cancel();
    }

    /// Asks the consumer on this channel to stop.
    ///
    /// A forced stop marks the entry so the lifecycle does not restart it. If
    /// the broker refuses to stop consuming the whole connection is closed.
    #[instrument(skip(self), fields(channel = %self.id))]
    pub(crate) async fn request_stop(&self, force_close: bool) {
        if force_close {
            self.mark_force_closed();
        } else {
            self.set_state(ChannelState::Stopping);
            self.closing.cancel();
        }

        if let Err(e) = self.channel.stop_consuming().await {
            warn!(error = %e, "could not stop consuming gracefully; closing connection");
            if let Err(e) = self.connection.close().await {
                warn!(error = %e, "closing connection failed");
            }
        }
    }
}

/// Snapshot of a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel id.
    pub id: ChannelId,
    /// State at snapshot time.
    pub state: ChannelState,
    /// Time since the last delivery.
    pub since_last_message: Duration,
}

/// Open channels by id, shared by every consumer of one bus setup.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    entries: Arc<DashMap<ChannelId, Arc<ChannelEntry>>>,
}

impl ChannelRegistry {
    pub(crate) fn insert(&self, entry: Arc<ChannelEntry>) {
        debug!(channel = %entry.id(), "channel registered");
        self.entries.insert(entry.id(), entry);
    }

    pub(crate) fn remove(&self, id: ChannelId) -> Option<Arc<ChannelEntry>> {
        let removed = self.entries.remove(&id).map(|(_, entry)| entry);
        if removed.is_some() {
            debug!(channel = %id, "channel unregistered");
        }
        removed
    }

    /// Looks up a channel.
    #[must_use]
    pub fn get(&self, id: ChannelId) -> Option<Arc<ChannelEntry>> {
        self.entries.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Every registered channel.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<ChannelEntry>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshots of every registered channel, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self
            .entries
            .iter()
            .map(|entry| ChannelInfo {
                id: entry.id(),
                state: entry.state(),
                since_last_message: entry.since_last_message(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no channel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stops one channel, or every channel when `id` is `None`.
    ///
    /// Returns the number of channels asked to stop.
    pub async fn stop(&self, id: Option<ChannelId>, force_close: bool) -> usize {
        let targets = match id {
            Some(id) => self.get(id).into_iter().collect(),
            None => self.entries(),
        };
        for entry in &targets {
            entry.request_stop(force_close).await;
        }
        targets.len()
    }
}
