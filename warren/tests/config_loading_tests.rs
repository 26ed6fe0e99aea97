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
use std::fs;

use tempfile::TempDir;
use warren::prelude::*;

use crate::setup::*;

mod setup;

const CUSTOM: &str = r#"
    [connection]
    heartbeat_secs = 20

    [listener]
    queue = "billing"
    subscriptions = ["orders.*", "invoices.#"]

    [exchanges]
    direct = "BillingDirect"

    [retry]
    tries = 3
    delay_ms = 250

    [consumer]
    prefetch_count = 8
    connection_dead_timeout_secs = 0

    [errors]
    max_retries = 2
    error_queue = "billing-errors"
"#;

#[test]
fn configuration_file_overrides_defaults() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("warren.toml");
    fs::write(&path, CUSTOM)?;

    let config = BusConfig::load_from(&path)?;

    assert_eq!(config.connection.heartbeat_secs, 20);
    assert_eq!(config.connection.watchdog_interval().as_secs(), 5);
    assert_eq!(config.listener.queue.as_deref(), Some("billing"));
    assert_eq!(config.listener.subscriptions.len(), 2);
    assert_eq!(config.exchanges.direct, "BillingDirect");
    assert_eq!(config.exchanges.topic, "WarrenTopic");
    assert_eq!(config.retry.tries, 3);
    assert_eq!(config.retry.delay_ms, 250);
    assert_eq!(config.retry.max_delay_ms, 10_000);
    assert_eq!(config.consumer.prefetch_count, 8);
    assert_eq!(config.consumer.dead_timeout(), None);
    assert_eq!(config.errors.error_queue, "billing-errors");

    temp_dir.close()?;
    Ok(())
}

#[test]
fn missing_file_is_a_config_error() {
    let result = BusConfig::load_from("/definitely/not/here/warren.toml");
    assert!(matches!(result, Err(BusError::Config(_))));
}

/// Everything touching `XDG_CONFIG_HOME` lives in one test so parallel tests
/// never observe each other's environment.
#[test]
fn xdg_lookup_finds_config_or_falls_back_to_defaults() -> anyhow::Result<()> {
    initialize_tracing();
    let temp_dir = TempDir::new()?;
    std::env::set_var("XDG_CONFIG_HOME", temp_dir.path());

    let config = BusConfig::load();
    assert_eq!(config.listener.queue, None);
    assert_eq!(config.errors.error_queue, "error");

    let config_dir = temp_dir.path().join("warren");
    fs::create_dir_all(&config_dir)?;
    fs::write(config_dir.join("config.toml"), CUSTOM)?;
    let config = BusConfig::load();
    assert_eq!(config.listener.queue.as_deref(), Some("billing"));

    fs::write(config_dir.join("config.toml"), "[consumer\nprefetch_count = ")?;
    let config = BusConfig::load();
    assert_eq!(config.consumer.prefetch_count, 0);

    temp_dir.close()?;
    Ok(())
}

#[tokio::test]
async fn setup_uses_configured_names() -> anyhow::Result<()> {
    let (broker, setup) = setup_with(BusConfig::from_toml_str(CUSTOM)?);

    setup.init(&ConsumeOptions::default()).await?;

    assert!(broker.has_exchange("BillingDirect"));
    assert!(broker.has_queue("billing"));
    assert!(broker.has_queue("billing-errors"));
    assert_eq!(
        broker.bindings("WarrenTopic", "billing"),
        vec!["orders.*".to_string(), "invoices.#".to_string()]
    );
    assert_eq!(setup.config().errors.max_retries, 2);
    Ok(())
}
