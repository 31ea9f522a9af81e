//! Frame envelope codec.
//!
//! The envelope is the only thing the publisher and consumer share. On the wire it is a UTF-8
//! JSON object:
//!
//! ```text
//! {
//!   "timestamp":  "2024-01-01T00:00:00Z",   // required, ISO-8601 with zone
//!   "stream_id":  "camera-stream-001",      // required, non-empty
//!   "location":   "bldg4-floor2",           // optional
//!   "image_data": "<base64 JPEG>"           // optional
//! }
//! ```
//!
//! `decode` either returns a fully validated envelope or an error. An envelope whose metadata
//! is valid but whose image payload is not comes back as [`EnvelopeError::ImagePayload`], which
//! still carries the metadata so a consumer can forward it on its own.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_STREAM_ID: &str = "stream_id";
pub const FIELD_LOCATION: &str = "location";
pub const FIELD_IMAGE_DATA: &str = "image_data";

/// Metadata that travels with every frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeMetadata {
    /// Capture time, ISO-8601 with an explicit zone. Kept verbatim.
    pub timestamp: String,
    pub stream_id: String,
    pub location: Option<String>,
}

impl std::fmt::Display for EnvelopeMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stream={} timestamp={} location={}",
            self.stream_id,
            self.timestamp,
            self.location.as_deref().unwrap_or("-")
        )
    }
}

/// One unit of transport: metadata plus optional JPEG bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameEnvelope {
    pub meta: EnvelopeMetadata,
    /// Compressed JPEG bytes. `None` means a metadata-only delivery.
    pub image_payload: Option<Vec<u8>>,
}

impl FrameEnvelope {
    pub fn new(
        timestamp: impl Into<String>,
        stream_id: impl Into<String>,
        location: Option<String>,
        image_payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            meta: EnvelopeMetadata {
                timestamp: timestamp.into(),
                stream_id: stream_id.into(),
                location,
            },
            image_payload,
        }
    }

    /// Envelope stamped with the current UTC time.
    pub fn now(
        stream_id: impl Into<String>,
        location: Option<String>,
        image_payload: Option<Vec<u8>>,
    ) -> Self {
        Self::new(utc_timestamp(Utc::now()), stream_id, location, image_payload)
    }

    pub fn has_image(&self) -> bool {
        self.image_payload.is_some()
    }
}

/// Formats a capture time the way the publisher stamps envelopes: microseconds, trailing `Z`.
pub fn utc_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid image payload ({meta}): {reason}")]
    ImagePayload {
        meta: EnvelopeMetadata,
        reason: String,
    },
}

/// Serializes an envelope to its wire form.
pub fn encode(envelope: &FrameEnvelope) -> Vec<u8> {
    let mut object = Map::new();
    object.insert(
        FIELD_TIMESTAMP.to_string(),
        Value::String(envelope.meta.timestamp.clone()),
    );
    object.insert(
        FIELD_STREAM_ID.to_string(),
        Value::String(envelope.meta.stream_id.clone()),
    );
    if let Some(location) = &envelope.meta.location {
        object.insert(FIELD_LOCATION.to_string(), Value::String(location.clone()));
    }
    if let Some(bytes) = &envelope.image_payload {
        object.insert(
            FIELD_IMAGE_DATA.to_string(),
            Value::String(STANDARD.encode(bytes)),
        );
    }
    Value::Object(object).to_string().into_bytes()
}

/// Wire shape. Every field is optional here so that absence is reported as
/// `MissingField` rather than a generic parse failure.
#[derive(Deserialize)]
struct WireEnvelope {
    timestamp: Option<String>,
    stream_id: Option<String>,
    location: Option<String>,
    image_data: Option<String>,
}

/// Parses and validates an envelope from its wire form.
pub fn decode(wire: &[u8]) -> Result<FrameEnvelope, EnvelopeError> {
    let text = std::str::from_utf8(wire)
        .map_err(|e| EnvelopeError::Malformed(format!("body is not UTF-8: {}", e)))?;
    let value: Value = serde_json::from_str(text)
        .map_err(|e| EnvelopeError::Malformed(format!("body is not JSON: {}", e)))?;
    if !value.is_object() {
        return Err(EnvelopeError::Malformed(
            "body is not a JSON object".to_string(),
        ));
    }
    let wire: WireEnvelope = serde_json::from_value(value)
        .map_err(|e| EnvelopeError::Malformed(format!("unexpected field type: {}", e)))?;

    let timestamp = wire
        .timestamp
        .ok_or(EnvelopeError::MissingField(FIELD_TIMESTAMP))?;
    let stream_id = wire
        .stream_id
        .ok_or(EnvelopeError::MissingField(FIELD_STREAM_ID))?;

    if stream_id.trim().is_empty() {
        return Err(EnvelopeError::Malformed(
            "stream_id must be non-empty".to_string(),
        ));
    }
    DateTime::parse_from_rfc3339(&timestamp).map_err(|e| {
        EnvelopeError::Malformed(format!("timestamp '{}' is not ISO-8601: {}", timestamp, e))
    })?;

    let meta = EnvelopeMetadata {
        timestamp,
        stream_id,
        location: wire.location,
    };

    let image_payload = match wire.image_data {
        None => None,
        Some(encoded) => {
            let bytes = match STANDARD.decode(encoded.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Err(EnvelopeError::ImagePayload {
                        meta,
                        reason: format!("invalid base64: {}", e),
                    })
                }
            };
            if bytes.is_empty() {
                return Err(EnvelopeError::ImagePayload {
                    meta,
                    reason: "image_data is empty".to_string(),
                });
            }
            Some(bytes)
        }
    };

    Ok(FrameEnvelope {
        meta,
        image_payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(image: Option<Vec<u8>>) -> FrameEnvelope {
        FrameEnvelope::new(
            "2024-01-01T00:00:00Z",
            "camera-stream-001",
            Some("bldg4-floor2".to_string()),
            image,
        )
    }

    #[test]
    fn round_trip_preserves_every_field() {
        for envelope in [
            sample(Some(vec![0xFF, 0xD8, 0x00, 0x10, 0xFF, 0xD9])),
            sample(None),
            FrameEnvelope::new("2024-06-30T23:59:59.123456+02:00", "cam-2", None, None),
            FrameEnvelope::now("cam-3", None, Some(vec![1])),
        ] {
            assert_eq!(decode(&encode(&envelope)).unwrap(), envelope);
        }
    }

    #[test]
    fn encode_writes_only_known_keys() {
        let wire = encode(&sample(Some(vec![1, 2, 3])));
        let value: Value = serde_json::from_slice(&wire).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["image_data", "location", "stream_id", "timestamp"]);
        assert_eq!(value["image_data"], "AQID");
    }

    #[test]
    fn absent_fields_are_omitted_on_the_wire() {
        let envelope = FrameEnvelope::new("2024-01-01T00:00:00Z", "cam", None, None);
        let value: Value = serde_json::from_slice(&encode(&envelope)).unwrap();
        assert!(value.get("image_data").is_none());
        assert!(value.get("location").is_none());
    }

    #[test]
    fn missing_image_is_not_an_error() {
        let wire = br#"{"timestamp":"2024-01-01T00:00:00Z","stream_id":"cam","image_data":null}"#;
        let envelope = decode(wire).unwrap();
        assert!(!envelope.has_image());
    }

    #[test]
    fn missing_required_fields() {
        assert_eq!(
            decode(br#"{"stream_id":"cam"}"#),
            Err(EnvelopeError::MissingField("timestamp"))
        );
        assert_eq!(
            decode(br#"{"timestamp":"2024-01-01T00:00:00Z"}"#),
            Err(EnvelopeError::MissingField("stream_id"))
        );
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        for wire in [
            &b"not json"[..],
            &b"[1,2,3]"[..],
            &b"\xff\xfe"[..],
            &br#"{"timestamp":5,"stream_id":"cam"}"#[..],
            &br#"{"timestamp":"2024-01-01T00:00:00Z","stream_id":""}"#[..],
            &br#"{"timestamp":"yesterday","stream_id":"cam"}"#[..],
        ] {
            assert!(
                matches!(decode(wire), Err(EnvelopeError::Malformed(_))),
                "{:?}",
                String::from_utf8_lossy(wire)
            );
        }
    }

    #[test]
    fn bad_base64_keeps_metadata() {
        let wire = br#"{"timestamp":"2024-01-01T00:00:00Z","stream_id":"cam","image_data":"%%%"}"#;
        match decode(wire) {
            Err(EnvelopeError::ImagePayload { meta, reason }) => {
                assert_eq!(meta.stream_id, "cam");
                assert!(reason.contains("base64"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_image_data_is_rejected() {
        let wire = br#"{"timestamp":"2024-01-01T00:00:00Z","stream_id":"cam","image_data":""}"#;
        assert!(matches!(
            decode(wire),
            Err(EnvelopeError::ImagePayload { .. })
        ));
    }

    #[test]
    fn publisher_timestamps_end_in_z() {
        let envelope = FrameEnvelope::now("cam", None, None);
        assert!(envelope.meta.timestamp.ends_with('Z'));
    }
}
