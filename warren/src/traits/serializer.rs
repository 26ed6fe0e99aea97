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

use serde_json::Value;

use crate::common::{BusError, Result};
use crate::message::MessageProperties;

/// Converts application payloads to message bodies and back.
pub trait Serializer: Send + Sync + Debug + 'static {
    /// MIME type written into outgoing properties.
    fn content_type(&self) -> &str;

    /// Encoding written into outgoing properties.
    fn content_encoding(&self) -> &str {
        "utf-8"
    }

    /// Encodes a payload.
    fn serialize(&self, payload: &Value) -> Result<Vec<u8>>;

    /// Decodes a body, consulting the delivery properties for its format.
    fn deserialize(&self, body: &[u8], properties: &MessageProperties) -> Result<Value>;
}

/// JSON bodies, `application/json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// MIME type handled by this serializer.
    pub const CONTENT_TYPE: &'static str = "application/json";
}

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn serialize(&self, payload: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn deserialize(&self, body: &[u8], properties: &MessageProperties) -> Result<Value> {
        if let Some(content_type) = properties.content_type.as_deref() {
            if content_type != Self::CONTENT_TYPE {
                return Err(BusError::Serialization(format!(
                    "unsupported content type '{content_type}'"
                )));
            }
        }
        if let Some(encoding) = properties.content_encoding.as_deref() {
            if !encoding.eq_ignore_ascii_case("utf-8") {
                return Err(BusError::Serialization(format!(
                    "unsupported content encoding '{encoding}'"
                )));
            }
        }
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_bodies_round_trip() {
        let serializer = JsonSerializer;
        let body = serializer.serialize(&json!({"id": 7})).expect("encode");
        let value = serializer
            .deserialize(&body, &MessageProperties::default())
            .expect("decode");
        assert_eq!(value, json!({"id": 7}));
    }

    #[test]
    fn foreign_content_types_are_rejected() {
        let properties = MessageProperties {
            content_type: Some("application/xml".to_string()),
            ..MessageProperties::default()
        };
        let result = JsonSerializer.deserialize(b"<a/>", &properties);
        assert!(matches!(result, Err(BusError::Serialization(_))));
    }
}
