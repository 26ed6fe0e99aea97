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

//! Consumer startup, channel lifecycles and their watchdogs.

pub use channel_entry::*;
pub(crate) use lifecycle::*;
pub use retry_policy::*;
pub(crate) use supervisor::*;
pub(crate) use watchdog::HeartbeatWatchdog;
pub use watchdog::MAX_WATCHDOG_SLEEP;

mod channel_entry;
mod lifecycle;
mod retry_policy;
mod supervisor;
mod watchdog;
