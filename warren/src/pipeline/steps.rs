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

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use crate::common::{error_copy, BusError, Result, DEFAULT_EXCHANGE};
use crate::message::{header, IncomingMessage, MessageContext, OutgoingMessage};
use crate::pipeline::{Next, PipelineStep};
use crate::traits::ErrorDisposition;

/// Runs the rest of the chain and turns any error into an error-handler disposition.
///
/// Never returns an error, so processing failures cannot end the consume loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct OuterGuard;

#[async_trait]
impl PipelineStep for OuterGuard {
    fn name(&self) -> &'static str {
        "outer-guard"
    }

    async fn execute(&self, context: &mut MessageContext, next: Next<'_>) -> Result<()> {
        let error = match next.run(context).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let dropped = context.bus.discard_outgoing();
        if context.is_force_stopped() {
            warn!(error = %error, dropped, "channel is stopping; leaving failed message for redelivery");
            return Ok(());
        }

        let disposition = context.error_handler.handle(context, &error);
        warn!(error = %error, %disposition, dropped, "message processing failed");
        if let Err(e) = apply_disposition(context, &disposition, &error).await {
            error!(error = %e, %disposition, "failed to apply error disposition");
        }
        Ok(())
    }
}

async fn apply_disposition(
    context: &MessageContext,
    disposition: &ErrorDisposition,
    cause: &BusError,
) -> Result<()> {
    let channel = context.channel();
    let delivery = context.delivery();
    let tag = delivery.delivery_tag;
    match disposition {
        ErrorDisposition::Ack => channel.ack(tag).await,
        ErrorDisposition::Requeue => channel.nack(tag, true).await,
        ErrorDisposition::Retry => {
            let Some(queue) = context.listener_queue() else {
                return channel.nack(tag, true).await;
            };
            let mut properties = delivery.properties.clone();
            let failures = properties.counter(header::FAILURE_COUNT) + 1;
            properties
                .headers
                .insert(header::FAILURE_COUNT.to_string(), failures.to_string());
            properties
                .headers
                .insert(header::ERROR_DESCRIPTION.to_string(), cause.to_string());
            let copy = OutgoingMessage::new(DEFAULT_EXCHANGE, queue, properties, delivery.body.clone());
            channel.publish(&copy, context.confirm_delivery()).await?;
            channel.ack(tag).await
        }
        ErrorDisposition::DeadLetter { queue } => {
            let copy = error_copy(delivery, queue, &cause.to_string(), context.listener_queue());
            channel.publish(&copy, context.confirm_delivery()).await?;
            channel.ack(tag).await
        }
    }
}

/// Puts messages whose deferred time lies in the future back on the listener
/// queue and acks the original. Such messages never reach [`Dispatch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferredCheck;

#[async_trait]
impl PipelineStep for DeferredCheck {
    fn name(&self) -> &'static str {
        "deferred-check"
    }

    async fn execute(&self, context: &mut MessageContext, next: Next<'_>) -> Result<()> {
        let delivery = context.delivery();
        if !delivery.properties.is_not_yet_due(Utc::now()) {
            return next.run(context).await;
        }
        if context.is_force_stopped() {
            warn!("channel is stopping; deferred message left for redelivery");
            return Ok(());
        }

        let queue = context
            .listener_queue()
            .unwrap_or(&delivery.routing_key)
            .to_string();
        let mut properties = delivery.properties.clone();
        let deferrals = properties.counter(header::DEFERRED_COUNT) + 1;
        properties
            .headers
            .insert(header::DEFERRED_COUNT.to_string(), deferrals.to_string());
        let copy = OutgoingMessage::new(DEFAULT_EXCHANGE, queue, properties, delivery.body.clone());

        debug!(
            until = ?delivery.properties.deferred_until(),
            deferrals,
            "message is deferred; putting it back"
        );
        let channel = Arc::clone(context.channel());
        channel.publish(&copy, context.confirm_delivery()).await?;
        channel.ack(delivery.delivery_tag).await
    }
}

/// Decodes the body with the configured serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeserializeBody;

#[async_trait]
impl PipelineStep for DeserializeBody {
    fn name(&self) -> &'static str {
        "deserialize"
    }

    async fn execute(&self, context: &mut MessageContext, next: Next<'_>) -> Result<()> {
        let delivery = context.delivery();
        let payload = context
            .serializer()
            .deserialize(&delivery.body, &delivery.properties)?;
        let message = IncomingMessage::new(payload, delivery);
        trace!(message_type = ?message.message_type(), "deserialized");
        context.message = Some(message);
        next.run(context).await
    }
}

/// Runs every interested handler in registration order, stopping at the first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatch;

#[async_trait]
impl PipelineStep for Dispatch {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn execute(&self, context: &mut MessageContext, next: Next<'_>) -> Result<()> {
        let handlers = Arc::clone(&context.handlers);
        let message = context.message.as_ref().ok_or_else(|| {
            BusError::Serialization("dispatch ran before the message was deserialized".to_string())
        })?;

        let mut handled = 0_usize;
        for handler in handlers.iter().filter(|h| h.interested_in(message)) {
            let name = handler.name().to_string();
            trace!(handler = %name, "dispatching");
            let outcome = AssertUnwindSafe(handler.handle(message, &mut context.bus))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => handled += 1,
                Ok(Err(source)) => return Err(BusError::Handler { handler: name, source }),
                Err(panic) => {
                    return Err(BusError::HandlerPanicked {
                        handler: name,
                        message: panic_message(panic.as_ref()),
                    })
                }
            }
        }

        if handled == 0 {
            debug!(message_type = ?message.message_type(), "no handler is interested in message");
        }
        next.run(context).await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Publishes the buffered messages in order, then acks the delivery.
///
/// A publish failure leaves the delivery unacknowledged. After a forced stop
/// of the channel nothing is published and nothing is acked.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgeAndFlush;

#[async_trait]
impl PipelineStep for AcknowledgeAndFlush {
    fn name(&self) -> &'static str {
        "acknowledge-and-flush"
    }

    async fn execute(&self, context: &mut MessageContext, next: Next<'_>) -> Result<()> {
        if context.is_force_stopped() {
            let dropped = context.bus.discard_outgoing();
            warn!(dropped, "channel is stopping; message left for redelivery");
            return Ok(());
        }

        let batch = context.bus.take_outgoing();
        let channel = Arc::clone(context.channel());
        if !batch.is_empty() {
            channel
                .publish_batch(&batch, context.confirm_delivery())
                .await?;
        }
        channel.ack(context.delivery().delivery_tag).await?;
        debug!(published = batch.len(), "message acknowledged");
        next.run(context).await
    }
}
