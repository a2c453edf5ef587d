use crate::{
    level::Level,
    message::Message,
    scope::Scope,
    serialize::{SerializableObject, SerializationStrategy},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};
use uuid::Uuid;

/// A value in an event's `extra` payload or in serialized-object metadata.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Bool(bool),
    Int(i64),
    Bytes(Vec<u8>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// Derives a logger label from its subsystem and category. Whitespace is
/// stripped from both components and empty components are elided, so the
/// label never leaks whitespace.
pub(crate) fn derive_label(subsystem: &str, category: &str) -> String {
    let subsystem: String = subsystem.split_whitespace().collect();
    let category: String = category.split_whitespace().collect();
    match (subsystem.is_empty(), category.is_empty()) {
        (true, true) => String::new(),
        (false, true) => subsystem,
        (true, false) => category,
        (false, false) => format!("{}:{}", subsystem, category),
    }
}

/// A single log occurrence. Events are created at the submission site,
/// enriched by the channel and the transport manager, and immutable from
/// the moment a transport first observes them.
#[derive(Deserialize, Serialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    #[serde(default)]
    pub subsystem: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub label: String,
    pub message: Message,
    /// The attached payload. Never serialized itself; its realized bytes
    /// and metadata travel in the two fields below.
    #[serde(skip)]
    pub object: Option<Arc<dyn SerializableObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized_object_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized_object_metadata: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub is_serialized: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization_strategy: Option<SerializationStrategy>,
}

impl Event {
    /// A fresh event at the given severity. Identity fields are filled by
    /// the channel before fan-out.
    pub fn new(level: Level) -> Event {
        Event {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            subsystem: String::new(),
            category: String::new(),
            label: String::new(),
            message: Message::default(),
            object: None,
            serialized_object_data: None,
            serialized_object_metadata: None,
            is_serialized: false,
            extra: BTreeMap::new(),
            tags: BTreeMap::new(),
            fingerprint: None,
            scope: Scope::default(),
            serialization_strategy: None,
        }
    }

    pub fn with_message<M: Into<Message>>(level: Level, message: M) -> Event {
        let mut event = Event::new(level);
        event.message = message.into();
        event
    }

    /// Attaches a payload to be serialized by the manager before fan-out.
    pub fn set_object(&mut self, object: Arc<dyn SerializableObject>) {
        self.object = Some(object);
    }

    /// Scope tags merged with event tags; the event wins on key conflicts.
    pub fn all_tags(&self) -> BTreeMap<String, String> {
        let mut merged = self.scope.tags.clone();
        merged.extend(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Scope extra merged with event extra; the event wins on key conflicts.
    pub fn all_extra(&self) -> BTreeMap<String, Value> {
        let mut merged = self.scope.extra.clone();
        merged.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Realizes the attached object's bytes and metadata. The transition to
    /// the serialized state happens at most once; later calls are no-ops.
    /// Serialization failures leave the event in the serialized state with
    /// no data, so a failing object is not retried per transport.
    pub fn ensure_serialized(
        &mut self,
        default_strategy: SerializationStrategy,
    ) -> anyhow::Result<()> {
        if self.is_serialized {
            return Ok(());
        }
        let object = match &self.object {
            Some(object) => Arc::clone(object),
            None => return Ok(()),
        };
        self.is_serialized = true;
        let strategy = self.serialization_strategy.unwrap_or(default_strategy);
        self.serialized_object_metadata = object.serialize_metadata();
        self.serialized_object_data = object.serialize(strategy)?;
        Ok(())
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("level", &self.level)
            .field("label", &self.label)
            .field("message", &self.message.render())
            .field("has_object", &self.object.is_some())
            .field("is_serialized", &self.is_serialized)
            .field("tags", &self.tags)
            .field("extra", &self.extra)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{JsonObject, METADATA_KEY_CODABLE};

    #[test]
    fn label_elides_empty_components_and_whitespace() {
        assert_eq!(derive_label("com.example app", "net work"), "com.exampleapp:network");
        assert_eq!(derive_label("app", ""), "app");
        assert_eq!(derive_label("", "net"), "net");
        assert_eq!(derive_label("  ", "\t"), "");
    }

    #[test]
    fn tag_merge_prefers_event_values() {
        let mut event = Event::with_message(Level::Info, "m");
        event.scope.tags.insert("env".to_owned(), "scope".to_owned());
        event.scope.tags.insert("region".to_owned(), "eu".to_owned());
        event.tags.insert("env".to_owned(), "event".to_owned());

        let merged = event.all_tags();
        assert_eq!(merged.get("env").map(String::as_str), Some("event"));
        assert_eq!(merged.get("region").map(String::as_str), Some("eu"));
    }

    #[test]
    fn extra_merge_prefers_event_values() {
        let mut event = Event::with_message(Level::Info, "m");
        event.scope.extra.insert("attempt".to_owned(), Value::Int(1));
        event.extra.insert("attempt".to_owned(), Value::Int(2));

        assert_eq!(event.all_extra().get("attempt"), Some(&Value::Int(2)));
    }

    #[test]
    fn serialization_happens_at_most_once() {
        #[derive(Serialize)]
        struct Payload {
            n: u8,
        }

        let mut event = Event::with_message(Level::Info, "m");
        event.set_object(Arc::new(JsonObject(Payload { n: 1 })));

        event.ensure_serialized(SerializationStrategy::Json).unwrap();
        assert!(event.is_serialized);
        let first = event.serialized_object_data.clone();
        assert_eq!(first.as_deref(), Some(br#"{"n":1}"#.as_slice()));
        assert_eq!(
            event
                .serialized_object_metadata
                .as_ref()
                .unwrap()
                .get(METADATA_KEY_CODABLE),
            Some(&Value::Bool(true))
        );

        // A second call must not re-serialize.
        event.serialized_object_data = None;
        event.ensure_serialized(SerializationStrategy::Json).unwrap();
        assert_eq!(event.serialized_object_data, None);
    }

    #[test]
    fn json_round_trip_preserves_identity() {
        let mut event = Event::with_message(Level::Error, "disk failed");
        event.subsystem = "app".to_owned();
        event.category = "io".to_owned();
        event.label = derive_label(&event.subsystem, &event.category);
        event.tags.insert("disk".to_owned(), "sda".to_owned());
        event.extra.insert("errno".to_owned(), Value::Int(5));

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, event.id);
        assert_eq!(back.timestamp.timestamp_millis(), event.timestamp.timestamp_millis());
        assert_eq!(back.level, Level::Error);
        assert_eq!(back.message.render(), "disk failed");
        assert_eq!(back.tags, event.tags);
        assert_eq!(back.extra, event.extra);
    }
}
