use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error type for payload registration and envelope codec failures
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Tag '{0}' is already registered to a different payload type")]
    TagCollision(String),

    #[error("Payload type '{type_name}' is already registered under tag '{tag}'")]
    TypeAlreadyRegistered {
        type_name: &'static str,
        tag: String,
    },

    #[error("No payload type registered for tag '{0}'")]
    UnregisteredTag(String),

    #[error("Payload type '{0}' is not registered")]
    UnregisteredType(&'static str),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PayloadError>;

/// A decoded payload, type-erased until the per-type pipeline downcasts it.
pub type BoxPayload = Box<dyn Any + Send>;

type DecodeFn = Arc<dyn Fn(&str) -> Result<BoxPayload> + Send + Sync>;

/// Per-job policy options carried on the envelope.
///
/// Handler-level options supplied at registration override these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobPayloadOptions {
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
    pub initial_visibility_delay: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
    pub expire_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
    pub handler_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_handler_retries: Option<u32>,
}

/// Durations travel on the wire as integer milliseconds.
mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// The persisted wrapper around a serialized payload.
///
/// This is the queue message content: the payload travels as a JSON-encoded
/// string next to its type tag, creation time, retry count and policy
/// options. The consumer rewrites the envelope each time it increments
/// `retries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub tag_type: String,
    pub payload: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub payload_options: Option<JobPayloadOptions>,
}

impl Envelope {
    pub fn new(tag_type: String, payload: String, payload_options: Option<JobPayloadOptions>) -> Self {
        Self {
            tag_type,
            payload,
            created: Utc::now(),
            retries: 0,
            payload_options,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

struct TagEntry {
    type_id: TypeId,
    decode: DecodeFn,
}

#[derive(Default)]
struct Maps {
    by_tag: HashMap<String, TagEntry>,
    by_type: HashMap<TypeId, String>,
}

/// Bidirectional mapping between concrete payload types and their stable
/// string tags, plus the envelope payload codec.
///
/// Tags are explicit and mandatory at registration; registering a second
/// type under an existing tag is a configuration error. One registry is
/// shared by the producers and consumers of a queue.
pub struct PayloadRegistry {
    maps: Mutex<Maps>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Register `T` under `tag`. Idempotent for the same (tag, type) pair.
    pub fn register<T>(&self, tag: &str) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();

        let mut maps = self.maps.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = maps.by_tag.get(tag) {
            if existing.type_id != type_id {
                return Err(PayloadError::TagCollision(tag.to_string()));
            }
            return Ok(());
        }
        if let Some(existing_tag) = maps.by_type.get(&type_id) {
            return Err(PayloadError::TypeAlreadyRegistered {
                type_name,
                tag: existing_tag.clone(),
            });
        }

        let decode: DecodeFn = Arc::new(|raw: &str| {
            let payload: T = serde_json::from_str(raw)?;
            Ok(Box::new(payload) as BoxPayload)
        });

        maps.by_tag.insert(
            tag.to_string(),
            TagEntry { type_id, decode },
        );
        maps.by_type.insert(type_id, tag.to_string());

        debug!(tag = %tag, payload_type = %type_name, "Payload type registered");
        Ok(())
    }

    /// The tag `T` was registered under.
    pub fn tag_for<T: 'static>(&self) -> Result<String> {
        let maps = self.maps.lock().unwrap_or_else(|e| e.into_inner());
        maps.by_type
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| PayloadError::UnregisteredType(std::any::type_name::<T>()))
    }

    /// Serialize a payload into its `(tag, json)` envelope fields.
    pub fn serialize<T>(&self, payload: &T) -> Result<(String, String)>
    where
        T: Serialize + 'static,
    {
        let tag = self.tag_for::<T>()?;
        let body = serde_json::to_string(payload)?;
        Ok((tag, body))
    }

    /// Decode an envelope payload field back into its registered type.
    ///
    /// An unregistered tag is the poison-message signal.
    pub fn deserialize(&self, tag: &str, raw: &str) -> Result<BoxPayload> {
        let decode = {
            let maps = self.maps.lock().unwrap_or_else(|e| e.into_inner());
            maps.by_tag
                .get(tag)
                .map(|entry| Arc::clone(&entry.decode))
                .ok_or_else(|| PayloadError::UnregisteredTag(tag.to_string()))?
        };
        decode(raw)
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        x: i32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        y: String,
    }

    #[test]
    fn round_trips_registered_payloads() {
        let registry = PayloadRegistry::new();
        registry.register::<Ping>("ping").unwrap();

        let (tag, body) = registry.serialize(&Ping { x: 7 }).unwrap();
        assert_eq!(tag, "ping");

        let decoded = registry.deserialize(&tag, &body).unwrap();
        let ping = decoded.downcast::<Ping>().unwrap();
        assert_eq!(*ping, Ping { x: 7 });
    }

    #[test]
    fn tag_collision_is_rejected() {
        let registry = PayloadRegistry::new();
        registry.register::<Ping>("shared").unwrap();

        // Same pair again is fine.
        registry.register::<Ping>("shared").unwrap();

        assert!(matches!(
            registry.register::<Pong>("shared"),
            Err(PayloadError::TagCollision(_))
        ));
        assert!(matches!(
            registry.register::<Ping>("other"),
            Err(PayloadError::TypeAlreadyRegistered { .. })
        ));
    }

    #[test]
    fn unregistered_tag_is_poison() {
        let registry = PayloadRegistry::new();
        assert!(matches!(
            registry.deserialize("nope", "{}"),
            Err(PayloadError::UnregisteredTag(_))
        ));
        assert!(matches!(
            registry.serialize(&Ping { x: 1 }),
            Err(PayloadError::UnregisteredType(_))
        ));
    }

    #[test]
    fn envelope_wire_format_is_stable() {
        let options = JobPayloadOptions {
            handler_timeout: Some(Duration::from_millis(1500)),
            max_handler_retries: Some(3),
            ..Default::default()
        };
        let envelope = Envelope::new("ping".to_string(), "{\"x\":1}".to_string(), Some(options));

        let json: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["TagType"], "ping");
        assert_eq!(json["Payload"], "{\"x\":1}");
        assert_eq!(json["Retries"], 0);
        assert_eq!(json["PayloadOptions"]["HandlerTimeout"], 1500);
        assert_eq!(json["PayloadOptions"]["MaxHandlerRetries"], 3);
        assert!(json["Created"].is_string());

        let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.tag_type, envelope.tag_type);
        assert_eq!(parsed.payload_options, envelope.payload_options);
    }

    #[test]
    fn envelope_without_options_decodes_with_defaults() {
        let raw = r#"{"TagType":"t","Payload":"{}","Created":"2024-01-01T00:00:00Z"}"#;
        let envelope = Envelope::from_bytes(raw.as_bytes()).unwrap();
        assert_eq!(envelope.retries, 0);
        assert!(envelope.payload_options.is_none());
    }
}
