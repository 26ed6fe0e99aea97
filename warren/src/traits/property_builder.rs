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

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::message::{header, Headers, MessageIntent, MessageProperties};

/// Inputs for building the properties of one outgoing message.
#[derive(Debug, Clone)]
pub struct PropertyRequest<'a> {
    /// Wire type name of the payload.
    pub message_type: &'a str,
    /// Why the message is sent.
    pub intent: MessageIntent,
    /// MIME type chosen by the serializer.
    pub content_type: &'a str,
    /// Encoding chosen by the serializer.
    pub content_encoding: &'a str,
    /// Properties of the message being processed, when sending from a handler.
    pub incoming: Option<&'a MessageProperties>,
    /// Queue replies should go to.
    pub reply_to: Option<&'a str>,
    /// Earliest time the receiver may handle the message.
    pub deferred_until: Option<DateTime<Utc>>,
    /// Caller supplied headers.
    pub headers: &'a Headers,
}

/// Builds transport metadata for outgoing messages.
pub trait PropertyBuilder: Send + Sync + Debug + 'static {
    /// Produces the properties for one outgoing message.
    fn build(&self, request: &PropertyRequest<'_>) -> MessageProperties;
}

/// Fresh message id, inherited correlation id, persistent delivery.
///
/// Replies and messages sent while handling a delivery keep the incoming
/// correlation id so a conversation can be traced end to end.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPropertyBuilder;

impl PropertyBuilder for DefaultPropertyBuilder {
    fn build(&self, request: &PropertyRequest<'_>) -> MessageProperties {
        let message_id = Uuid::new_v4().to_string();
        let correlation_id = request
            .incoming
            .and_then(|incoming| incoming.correlation_id.clone())
            .unwrap_or_else(|| message_id.clone());

        let mut headers = request.headers.clone();
        headers.insert(header::INTENT.to_string(), request.intent.to_string());
        if let Some(until) = request.deferred_until {
            headers.insert(header::DEFERRED_TIME.to_string(), until.to_rfc3339());
        }

        MessageProperties {
            content_type: Some(request.content_type.to_string()),
            content_encoding: Some(request.content_encoding.to_string()),
            message_id: Some(message_id),
            correlation_id: Some(correlation_id),
            reply_to: request.reply_to.map(str::to_string),
            message_type: Some(request.message_type.to_string()),
            timestamp: Some(Utc::now()),
            persistent: true,
            headers,
        }
    }
}
