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

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::common::{BusError, BusInner, Result, Topology};
use crate::consumer::{retry_call, ChannelLifecycle};

/// Runs a number of independent consumers, each under the retry policy.
///
/// A worker first retries asserting that the broker is reachable and the
/// topology can be declared, then runs a [`ChannelLifecycle`]. When the
/// lifecycle fails, the worker spends one try and starts over. Workers share
/// nothing but the bus configuration and the handler registry.
#[derive(Debug, Clone)]
pub(crate) struct ConsumerSupervisor {
    inner: Arc<BusInner>,
    topology: Arc<Topology>,
    queue: String,
    shutdown: CancellationToken,
}

impl ConsumerSupervisor {
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

    /// Spawns `consumers` workers on the bus's task tracker.
    pub(crate) fn spawn(&self, consumers: usize) -> Vec<JoinHandle<Result<()>>> {
        (0..consumers)
            .map(|worker| {
                let supervisor = self.clone();
                self.inner
                    .tracker
                    .spawn(async move { supervisor.supervise(worker).await })
            })
            .collect()
    }

    #[instrument(skip(self), fields(queue = %self.queue))]
    async fn supervise(&self, worker: usize) -> Result<()> {
        let policy = &self.inner.config.retry;
        let mut tries = policy.tries;
        let mut last_error = None;

        while tries != 0 {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let reachable = retry_call(policy, &self.shutdown, || {
                self.inner.assert_connection(&self.topology)
            })
            .await;
            if let Err(e) = reachable {
                if self.shutdown.is_cancelled() {
                    return Ok(());
                }
                error!(error = %e, "broker is not reachable");
                return Err(e);
            }

            let lifecycle = ChannelLifecycle::new(
                Arc::clone(&self.inner),
                Arc::clone(&self.topology),
                self.queue.clone(),
                self.shutdown.clone(),
            );
            match lifecycle.run().await {
                Ok(()) => {
                    info!("consumer finished");
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    error!(error = %e, "consumer failed permanently");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, tries, "consumer failed");
                    last_error = Some(e);
                }
            }
            if tries > 0 {
                tries -= 1;
            }
        }

        match last_error {
            Some(last) => Err(BusError::RetriesExhausted {
                attempts: u32::try_from(policy.tries).unwrap_or(u32::MAX),
                last: Box::new(last),
            }),
            None => Ok(()),
        }
    }
}
