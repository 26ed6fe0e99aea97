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

//! Exchange, queue and binding declarations needed before consuming.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::common::Result;
use crate::traits::BrokerChannel;

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Exact routing key match.
    #[default]
    Direct,
    /// Pattern match on dot separated words.
    Topic,
    /// Every bound queue receives every message.
    Fanout,
    /// Routing on header values.
    Headers,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Topic => write!(f, "topic"),
            Self::Fanout => write!(f, "fanout"),
            Self::Headers => write!(f, "headers"),
        }
    }
}

/// Declare settings of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// Exchange type.
    pub kind: ExchangeKind,
    /// Survives broker restarts.
    pub durable: bool,
    /// Deleted when the last binding goes away.
    pub auto_delete: bool,
    /// Extra broker arguments.
    pub arguments: BTreeMap<String, String>,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self::direct()
    }
}

impl ExchangeSettings {
    /// Durable direct exchange.
    #[must_use]
    pub fn direct() -> Self {
        Self {
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
            arguments: BTreeMap::new(),
        }
    }

    /// Durable topic exchange.
    #[must_use]
    pub fn topic() -> Self {
        Self {
            kind: ExchangeKind::Topic,
            ..Self::direct()
        }
    }
}

/// Declare settings of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Survives broker restarts.
    pub durable: bool,
    /// Only usable by the declaring connection.
    pub exclusive: bool,
    /// Deleted when the last consumer goes away.
    pub auto_delete: bool,
    /// Extra broker arguments.
    pub arguments: BTreeMap<String, String>,
}

impl Default for QueueSettings {
    /// A durable queue mirrored across all nodes.
    fn default() -> Self {
        let mut arguments = BTreeMap::new();
        arguments.insert("ha-mode".to_string(), "all".to_string());
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments,
        }
    }
}

/// Everything [`declare_default_topology`] declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Queue the consumer listens on, if any.
    pub listener_queue: Option<String>,
    /// Listener queue settings.
    pub listener_queue_settings: QueueSettings,
    /// Exchange for commands.
    pub direct_exchange: String,
    /// Direct exchange settings.
    pub direct_exchange_settings: ExchangeSettings,
    /// Exchange for events.
    pub topic_exchange: String,
    /// Topic exchange settings.
    pub topic_exchange_settings: ExchangeSettings,
    /// Topics bound to the listener queue.
    pub subscriptions: Vec<String>,
    /// Queue receiving dead-lettered messages, if any.
    pub error_queue: Option<String>,
}

/// Declares both exchanges, the listener queue with its bindings, and the error queue.
///
/// The listener queue is bound to the direct exchange under its own name so
/// commands addressed to the queue reach it, and to the topic exchange once
/// per subscription.
#[instrument(skip(channel, topology), fields(queue = ?topology.listener_queue))]
pub async fn declare_default_topology(channel: &dyn BrokerChannel, topology: &Topology) -> Result<()> {
    channel
        .declare_exchange(&topology.direct_exchange, &topology.direct_exchange_settings)
        .await?;
    channel
        .declare_exchange(&topology.topic_exchange, &topology.topic_exchange_settings)
        .await?;

    if let Some(queue) = &topology.listener_queue {
        channel
            .declare_queue(queue, &topology.listener_queue_settings)
            .await?;
        channel
            .bind_queue(queue, &topology.direct_exchange, queue)
            .await?;
        for topic in &topology.subscriptions {
            debug!(queue = %queue, topic = %topic, "binding subscription");
            channel
                .bind_queue(queue, &topology.topic_exchange, topic)
                .await?;
        }
    }

    if let Some(error_queue) = &topology.error_queue {
        let settings = QueueSettings {
            arguments: BTreeMap::new(),
            ..QueueSettings::default()
        };
        channel.declare_queue(error_queue, &settings).await?;
    }
    Ok(())
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more words.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}
