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
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use warren::prelude::*;

pub mod handlers;
pub mod messages;

static INIT: Once = Once::new();

/// How long tests wait for background consumers to reach a state.
pub const PATIENCE: Duration = Duration::from_secs(2);

/// Installs the global test subscriber once, writing to `logs/warren_tests.txt`.
pub fn initialize_tracing() {
    INIT.call_once(|| {
        std::fs::create_dir_all("logs").expect("could not create logs dir");

        let file_appender = RollingFileAppender::new(Rotation::NEVER, "logs", "warren_tests.txt");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Keep the writer alive until process exit
        Box::leak(Box::new(guard));

        let filter = EnvFilter::new("info")
            .add_directive("warren::consumer=trace".parse().unwrap())
            .add_directive("warren::pipeline=trace".parse().unwrap())
            .add_directive("warren::common::bus=debug".parse().unwrap())
            .add_directive("warren::memory=debug".parse().unwrap());

        let subscriber = FmtSubscriber::builder()
            .with_span_events(FmtSpan::NONE)
            .with_max_level(Level::TRACE)
            .compact()
            .with_line_number(true)
            .without_time()
            .with_target(true)
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

/// Configuration tuned for fast tests: short retry delays, no jitter.
pub fn test_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.retry = RetryPolicy {
        tries: -1,
        delay_ms: 5,
        max_delay_ms: 20,
        backoff: 1.0,
        jitter: 0.0,
    };
    config
}

/// A broker and a setup bound to it.
pub fn setup_with(config: BusConfig) -> (MemoryBroker, BusSetup) {
    initialize_tracing();
    let broker = MemoryBroker::new();
    let setup = BusSetup::builder(Arc::new(broker.clone()))
        .with_config(config)
        .build();
    (broker, setup)
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Awaits `future`, failing the test if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}
