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

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A type that can travel over the bus.
///
/// Usually implemented through the `#[bus_message]` attribute macro. The
/// type name is written into the `type` property of every outgoing message
/// and is what typed handlers match on.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire type name.
    const MESSAGE_TYPE: &'static str;
}
