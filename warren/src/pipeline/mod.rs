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

//! The per-delivery processing chain.
//!
//! Every step receives the rest of the chain as a [`Next`] continuation and
//! decides whether to run it. The default chain is:
//!
//! 1. [`OuterGuard`]: absorbs every error and applies the error handler's disposition.
//! 2. [`DeferredCheck`]: puts messages that are not due yet back on the queue.
//! 3. [`DeserializeBody`]: decodes the body.
//! 4. [`Dispatch`]: runs every interested message handler.
//! 5. [`AcknowledgeAndFlush`]: publishes buffered messages, then acks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use crate::common::Result;
use crate::message::MessageContext;

pub use steps::*;

mod steps;

/// One stage of the processing chain.
#[async_trait]
pub trait PipelineStep: Send + Sync + 'static {
    /// Name reported by [`Pipeline::step_names`].
    fn name(&self) -> &'static str;

    /// Processes the context, calling `next.run(context)` to continue the chain.
    async fn execute(&self, context: &mut MessageContext, next: Next<'_>) -> Result<()>;
}

/// The remainder of a pipeline.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    steps: &'a [Arc<dyn PipelineStep>],
}

impl Next<'_> {
    /// Runs the remaining steps. An empty remainder succeeds.
    pub async fn run(self, context: &mut MessageContext) -> Result<()> {
        match self.steps.split_first() {
            Some((step, rest)) => step.execute(context, Next { steps: rest }).await,
            None => Ok(()),
        }
    }
}

/// An ordered, immutable chain of [`PipelineStep`]s shared by every consumer.
#[derive(Clone)]
pub struct Pipeline {
    steps: Arc<[Arc<dyn PipelineStep>]>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(OuterGuard),
            Arc::new(DeferredCheck),
            Arc::new(DeserializeBody),
            Arc::new(Dispatch),
            Arc::new(AcknowledgeAndFlush),
        ])
    }
}

impl Pipeline {
    /// Builds a pipeline from explicit steps.
    #[must_use]
    pub fn new(steps: Vec<Arc<dyn PipelineStep>>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    /// Step names in execution order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Runs the chain over one delivery inside the delivery's span.
    pub async fn run(&self, context: &mut MessageContext) -> Result<()> {
        let span = context.span().clone();
        Next {
            steps: &self.steps,
        }
        .run(context)
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}
