/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     you may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{BusError, ExchangeSettings, QueueSettings, Result};
use crate::consumer::RetryPolicy;

/// Configuration for a Warren bus.
///
/// Loaded from TOML, every section optional:
///
/// ```toml
/// [connection]
/// heartbeat_secs = 60
///
/// [listener]
/// queue = "billing"
/// subscriptions = ["orders.*"]
///
/// [exchanges]
/// direct = "WarrenDirect"
/// topic = "WarrenTopic"
///
/// [retry]
/// tries = -1
/// delay_ms = 1000
///
/// [consumer]
/// prefetch_count = 10
/// connection_dead_timeout_secs = 10
///
/// [errors]
/// max_retries = 5
/// error_queue = "error"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker connection settings
    pub connection: ConnectionConfig,
    /// Default listener queue and subscriptions
    pub listener: ListenerConfig,
    /// Default exchanges
    pub exchanges: ExchangesConfig,
    /// Consumer startup retry policy
    pub retry: RetryPolicy,
    /// Channel and consume settings
    pub consumer: ConsumerConfig,
    /// Settings of the default error handler
    pub errors: ErrorsConfig,
}

/// Connection level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Negotiated heartbeat timeout in seconds; the watchdog runs four times per period.
    pub heartbeat_secs: u64,
}

/// Default listener queue and its topic subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Queue to consume from. `None` makes the bus a pure publisher.
    pub queue: Option<String>,
    /// Topics bound to the listener queue on the topic exchange.
    pub subscriptions: Vec<String>,
    /// Declare settings of the listener queue.
    pub queue_settings: QueueSettings,
}

/// Default exchange names and declare settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangesConfig {
    /// Exchange commands are sent through.
    pub direct: String,
    /// Exchange events are published through.
    pub topic: String,
    /// Declare settings of the direct exchange.
    pub direct_settings: ExchangeSettings,
    /// Declare settings of the topic exchange.
    pub topic_settings: ExchangeSettings,
}

/// Channel and consume settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Use publisher confirms on every channel.
    pub confirm_delivery: bool,
    /// Prefetch window size in bytes, 0 disables.
    pub prefetch_size: u32,
    /// Prefetch message count, 0 disables.
    pub prefetch_count: u16,
    /// Seconds without deliveries, while the queue has messages, before a channel is recycled. 0 disables.
    pub connection_dead_timeout_secs: u64,
    /// Stop every consumer when the owning `BusSetup` is dropped.
    pub stop_consumers_on_drop: bool,
}

/// Settings of the default error handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorsConfig {
    /// Failures tolerated before a message is dead-lettered.
    pub max_retries: u32,
    /// Queue receiving dead-lettered messages.
    pub error_queue: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { heartbeat_secs: 60 }
    }
}

impl Default for ExchangesConfig {
    fn default() -> Self {
        Self {
            direct: "WarrenDirect".to_string(),
            topic: "WarrenTopic".to_string(),
            direct_settings: ExchangeSettings::direct(),
            topic_settings: ExchangeSettings::topic(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            confirm_delivery: true,
            prefetch_size: 0,
            prefetch_count: 0,
            connection_dead_timeout_secs: 10,
            stop_consumers_on_drop: true,
        }
    }
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            error_queue: "error".to_string(),
        }
    }
}

impl ConsumerConfig {
    /// Dead timeout as a duration, `None` when disabled.
    #[must_use]
    pub const fn dead_timeout(&self) -> Option<Duration> {
        if self.connection_dead_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.connection_dead_timeout_secs))
        }
    }
}

impl ConnectionConfig {
    /// Watchdog period: a quarter of the heartbeat, rounded up, at least one second.
    #[must_use]
    pub const fn watchdog_interval(&self) -> Duration {
        let quarter = self.heartbeat_secs.div_ceil(4);
        Duration::from_secs(if quarter == 0 { 1 } else { quarter })
    }
}

impl BusConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| BusError::Config(e.to_string()))?;
        config.retry.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| BusError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Load configuration from XDG-compliant locations
    ///
    /// Looks for `$XDG_CONFIG_HOME/warren/config.toml` (falling back to
    /// `~/.config/warren/config.toml`). A missing file yields the defaults;
    /// an unreadable or malformed one is logged and also yields the defaults.
    pub fn load() -> Self {
        use tracing::{error, info};

        let xdg_dirs = match xdg::BaseDirectories::with_prefix("warren") {
            Ok(dirs) => dirs,
            Err(e) => {
                error!("Failed to initialize XDG directories: {}", e);
                return Self::default();
            }
        };

        match xdg_dirs.find_config_file("config.toml") {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                match Self::load_from(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        error!("Failed to load configuration file {}: {}", path.display(), e);
                        Self::default()
                    }
                }
            }
            None => {
                info!("No configuration file found, using defaults");
                Self::default()
            }
        }
    }
}
