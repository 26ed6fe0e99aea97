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
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::consumer::ChannelEntry;

/// Longest single sleep between watchdog passes.
pub const MAX_WATCHDOG_SLEEP: Duration = Duration::from_secs(10);

/// Watches one consuming channel for stalls and keeps its connection alive.
///
/// Every pass reads the depth of the listener queue and the time since the
/// last delivery. A channel that has pending messages but has not received any
/// for longer than the dead timeout is stopped without the force flag, so its
/// lifecycle reopens it. Otherwise, when the channel has been quiet for longer
/// than one interval, pending heartbeat events are processed.
///
/// The loop ends when the connection closes or the watchdog is cancelled.
#[derive(Debug)]
pub(crate) struct HeartbeatWatchdog {
    entry: Arc<ChannelEntry>,
    queue: String,
    interval: Duration,
    dead_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl HeartbeatWatchdog {
    /// Creates a watchdog for `entry` consuming from `queue`.
    #[must_use]
    pub(crate) fn new(
        entry: Arc<ChannelEntry>,
        queue: impl Into<String>,
        interval: Duration,
        dead_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            entry,
            queue: queue.into(),
            interval,
            dead_timeout,
            cancel,
        }
    }

    /// Runs until the connection closes, the channel is recycled, or `cancel` fires.
    #[instrument(skip(self), fields(channel = %self.entry.id(), queue = %self.queue))]
    pub(crate) async fn run(self) {
        let pause = self.interval.min(MAX_WATCHDOG_SLEEP);
        let mut next_heartbeat = Instant::now() + self.interval;
        debug!(interval = ?self.interval, dead_timeout = ?self.dead_timeout, "watchdog started");

        while self.entry.connection().is_open() && !self.cancel.is_cancelled() {
            let depth = match self.entry.channel().inspect_queue(&self.queue).await {
                Ok(depth) => depth,
                Err(e) => {
                    warn!(error = %e, "could not inspect queue");
                    0
                }
            };
            let elapsed = self.entry.since_last_message();
            trace!(depth, ?elapsed, "watchdog pass");

            if self.is_stalled(depth, elapsed) {
                warn!(
                    depth,
                    ?elapsed,
                    "no deliveries despite pending messages; recycling channel"
                );
                self.entry.request_stop(false).await;
                break;
            }

            if elapsed > self.interval && Instant::now() >= next_heartbeat {
                if let Err(e) = self.entry.connection().process_heartbeat_events().await {
                    warn!(error = %e, "processing heartbeat events failed");
                }
                next_heartbeat = Instant::now() + self.interval;
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = sleep(pause) => {}
            }
        }
        debug!("watchdog stopped");
    }

    fn is_stalled(&self, depth: u32, elapsed: Duration) -> bool {
        match self.dead_timeout {
            Some(timeout) => depth > 0 && elapsed > timeout,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::QueueSettings;
    use crate::memory::MemoryBroker;
    use crate::message::{MessageProperties, OutgoingMessage};
    use crate::traits::BrokerClient;

    async fn watched(broker: &MemoryBroker) -> Arc<ChannelEntry> {
        let connection = broker.connect().await.expect("connect");
        let channel = connection.open_channel().await.expect("channel");
        channel
            .declare_queue("orders", &QueueSettings::default())
            .await
            .expect("queue");
        Arc::new(ChannelEntry::new(channel, connection))
    }

    #[tokio::test(start_paused = true)]
    async fn stall_requests_unforced_stop() {
        let broker = MemoryBroker::new();
        let entry = watched(&broker).await;
        broker
            .inject(&OutgoingMessage::new(
                "",
                "orders",
                MessageProperties::default(),
                b"{}".to_vec(),
            ))
            .expect("inject");

        HeartbeatWatchdog::new(
            Arc::clone(&entry),
            "orders",
            Duration::from_secs(1),
            Some(Duration::from_secs(3)),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert!(entry.closing().is_cancelled());
        assert!(!entry.is_force_closed());
        assert!(entry.since_last_message() > Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn ends_when_connection_closes() {
        let broker = MemoryBroker::new();
        let entry = watched(&broker).await;
        let running = tokio::spawn(
            HeartbeatWatchdog::new(
                Arc::clone(&entry),
                "orders",
                Duration::from_secs(1),
                None,
                CancellationToken::new(),
            )
            .run(),
        );

        sleep(Duration::from_secs(5)).await;
        entry.connection().close().await.expect("close");
        tokio::time::timeout(Duration::from_secs(15), running)
            .await
            .expect("watchdog stopped")
            .expect("watchdog task");

        assert!(broker.heartbeats() >= 3);
        assert!(!entry.closing().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_loop() {
        let broker = MemoryBroker::new();
        let entry = watched(&broker).await;
        let cancel = CancellationToken::new();
        let running = tokio::spawn(
            HeartbeatWatchdog::new(entry, "orders", Duration::from_secs(60), None, cancel.clone())
                .run(),
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("watchdog stopped")
            .expect("watchdog task");
    }
}
