use crate::event::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key that marks a serialized object as a JSON document rather
/// than an opaque binary payload. Storage transports use this to pick a
/// text column over a blob column.
pub const METADATA_KEY_CODABLE: &str = "codable";

/// How an attached object should be turned into bytes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationStrategy {
    #[default]
    Json,
    Binary,
}

/// The output of a formatter or object serialization: either text or raw
/// bytes, depending on the destination.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SerializableData {
    Text(String),
    Bytes(Vec<u8>),
}

impl SerializableData {
    /// The data as a string, if it is textual.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            SerializableData::Text(s) => Some(s),
            SerializableData::Bytes(_) => None,
        }
    }

    /// The data as bytes. Textual data is returned as its UTF-8 encoding.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SerializableData::Text(s) => s.as_bytes(),
            SerializableData::Bytes(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for SerializableData {
    fn from(s: String) -> Self {
        SerializableData::Text(s)
    }
}

impl From<Vec<u8>> for SerializableData {
    fn from(b: Vec<u8>) -> Self {
        SerializableData::Bytes(b)
    }
}

/// A payload that can be attached to an event and persisted by transports.
/// Implementations choose how to honor the requested strategy; returning
/// `None` means the object has no representation under that strategy and
/// transports store nothing for it.
pub trait SerializableObject: Send + Sync {
    /// Serializes the object under the given strategy.
    fn serialize(&self, strategy: SerializationStrategy) -> anyhow::Result<Option<Vec<u8>>>;

    /// Metadata describing the serialized form. The `"codable"` key set to
    /// `Value::Bool(true)` marks the payload as JSON text.
    fn serialize_metadata(&self) -> Option<BTreeMap<String, Value>> {
        None
    }
}

/// Blanket implementation: any serde-serializable value can be attached to
/// an event. JSON strategy produces a JSON document and marks it codable;
/// binary strategy produces the same bytes without the marker.
pub struct JsonObject<T: Serialize + Send + Sync>(pub T);

impl<T: Serialize + Send + Sync> SerializableObject for JsonObject<T> {
    fn serialize(&self, _strategy: SerializationStrategy) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(Some(serde_json::to_vec(&self.0)?))
    }

    fn serialize_metadata(&self) -> Option<BTreeMap<String, Value>> {
        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_KEY_CODABLE.to_owned(), Value::Bool(true));
        Some(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_exposes_both_views() {
        let data = SerializableData::Text("abc".to_owned());
        assert_eq!(data.as_string(), Some("abc"));
        assert_eq!(data.as_bytes(), b"abc");
    }

    #[test]
    fn bytes_have_no_string_view() {
        let data = SerializableData::Bytes(vec![0xff, 0x00]);
        assert_eq!(data.as_string(), None);
        assert_eq!(data.as_bytes(), &[0xff, 0x00]);
    }

    #[test]
    fn json_object_is_codable() {
        #[derive(Serialize)]
        struct Payload {
            count: u32,
        }

        let object = JsonObject(Payload { count: 3 });
        let bytes = object
            .serialize(SerializationStrategy::Json)
            .unwrap()
            .unwrap();
        assert_eq!(bytes, br#"{"count":3}"#);

        let metadata = object.serialize_metadata().unwrap();
        assert_eq!(
            metadata.get(METADATA_KEY_CODABLE),
            Some(&Value::Bool(true))
        );
    }
}
