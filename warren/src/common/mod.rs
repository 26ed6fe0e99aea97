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

//! Bus setup, the bus handle, configuration, topology and errors.

pub use bus::{Bus, SendOptions};
pub(crate) use bus::{error_copy, Endpoint, DEFAULT_EXCHANGE};
pub(crate) use bus_inner::BusInner;
pub use bus_setup::{BusOptions, BusSetup, BusSetupBuilder, ConsumeOptions};
pub use config::*;
pub use error::*;
pub use topology::*;

/// The handle handlers and publishers send messages through.
mod bus;
/// State shared between a bus setup and its consumers.
mod bus_inner;
/// The application entry point.
mod bus_setup;
/// Configuration loaded from XDG-compliant locations.
pub mod config;
/// Crate error type.
mod error;
/// Exchange, queue and binding declarations.
mod topology;
