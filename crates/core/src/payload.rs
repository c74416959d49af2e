//! Payload classification at the queue boundary.
//!
//! Jobs carry opaque serialized payloads. Workers never poke at raw JSON:
//! every payload is decoded once into an [`IngestPayload`], and anything that
//! matches no known shape becomes [`IngestPayload::Unknown`] instead of
//! silently falling through to a default bucket.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::record::{AnalyticsEventRecord, RequestLogRecord};

/// Topic used by the request-logging middleware.
pub const REQUEST_LOG_TOPIC: &str = "log_stream";

/// Topic used by the analytics ingest endpoints.
pub const ANALYTICS_TOPIC: &str = "tracker_event";

/// Sink-side bucket a payload is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Request,
    Error,
    Analytics,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Request => "request",
            Bucket::Error => "error",
            Bucket::Analytics => "analytics",
        }
    }
}

impl core::fmt::Display for Bucket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded job payload.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestPayload {
    /// Successful request log.
    Request(RequestLogRecord),
    /// Failed request log (carries `error`).
    Error(RequestLogRecord),
    /// Analytics event (carries `event_id`).
    Analytics(AnalyticsEventRecord),
    /// Valid JSON that matches no known shape.
    Unknown { reason: String },
}

/// Payload decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),
    #[error("{bucket} payload failed to decode: {reason}")]
    Decode { bucket: Bucket, reason: String },
}

impl PayloadError {
    /// Bucket the payload was headed for, if its shape got that far.
    pub fn bucket(&self) -> Option<Bucket> {
        match self {
            PayloadError::Malformed(_) => None,
            PayloadError::Decode { bucket, .. } => Some(*bucket),
        }
    }
}

impl IngestPayload {
    /// Decode and classify a raw payload.
    ///
    /// A field is present when it is truthy (not null, empty, zero or false).
    /// Routing, in order:
    ///
    /// 1. `event_id` present → analytics
    /// 2. analytics topic without `event_id` → unknown
    /// 3. `error` present → error
    /// 4. `method` and `url` present → request
    /// 5. otherwise → unknown
    pub fn classify(topic: &str, raw: &str) -> Result<Self, PayloadError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| PayloadError::Malformed(e.to_string()))?;

        let Some(fields) = value.as_object() else {
            return Ok(Self::unknown("payload is not a JSON object"));
        };

        if present(fields, "event_id") {
            return decode(value, Bucket::Analytics).map(IngestPayload::Analytics);
        }
        if topic == ANALYTICS_TOPIC {
            return Ok(Self::unknown("analytics event without event_id"));
        }
        if present(fields, "error") {
            return decode(value, Bucket::Error).map(IngestPayload::Error);
        }
        if present(fields, "method") && present(fields, "url") {
            return decode(value, Bucket::Request).map(IngestPayload::Request);
        }

        Ok(Self::unknown("no known payload shape"))
    }

    pub fn bucket(&self) -> Option<Bucket> {
        match self {
            IngestPayload::Request(_) => Some(Bucket::Request),
            IngestPayload::Error(_) => Some(Bucket::Error),
            IngestPayload::Analytics(_) => Some(Bucket::Analytics),
            IngestPayload::Unknown { .. } => None,
        }
    }

    fn unknown(reason: &str) -> Self {
        Self::Unknown {
            reason: reason.to_string(),
        }
    }
}

/// Truthy field: `null`, `false`, `0` and `""` count as absent.
fn present(fields: &Map<String, Value>, key: &str) -> bool {
    match fields.get(key) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(_) => true,
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, bucket: Bucket) -> Result<T, PayloadError> {
    serde_json::from_value(value).map_err(|e| PayloadError::Decode {
        bucket,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn request_json(error: Option<&str>) -> String {
        json!({
            "method": "GET",
            "url": "/media?page=1",
            "body": "{}",
            "response": (if error.is_some() { Value::Null } else { json!("[]") }),
            "error": error,
            "status_code": (if error.is_some() { 500 } else { 200 }),
            "duration": 12,
            "timestamp": "2024-05-01T10:00:00Z",
            "query": "{\"page\":\"1\"}",
        })
        .to_string()
    }

    #[test]
    fn request_without_error_routes_to_request_bucket() {
        let payload = IngestPayload::classify(REQUEST_LOG_TOPIC, &request_json(None)).unwrap();
        assert_eq!(payload.bucket(), Some(Bucket::Request));
        let IngestPayload::Request(rec) = payload else {
            panic!("expected request");
        };
        assert_eq!(rec.status_code, 200);
        assert_eq!(rec.duration, 12);
    }

    #[test]
    fn error_field_routes_to_error_bucket() {
        let payload =
            IngestPayload::classify(REQUEST_LOG_TOPIC, &request_json(Some("boom"))).unwrap();
        assert_eq!(payload.bucket(), Some(Bucket::Error));
    }

    #[test]
    fn event_id_wins_over_error() {
        let raw = json!({"event_id": "e-1", "error": "ignored", "user_id": "u"}).to_string();
        let payload = IngestPayload::classify(REQUEST_LOG_TOPIC, &raw).unwrap();
        assert!(matches!(payload, IngestPayload::Analytics(ref e) if e.event_id == "e-1"));
    }

    #[test]
    fn unknown_shapes_are_explicit() {
        let raw = json!({"hello": "world"}).to_string();
        assert!(matches!(
            IngestPayload::classify(REQUEST_LOG_TOPIC, &raw).unwrap(),
            IngestPayload::Unknown { .. }
        ));
        assert!(matches!(
            IngestPayload::classify(REQUEST_LOG_TOPIC, "[1,2]").unwrap(),
            IngestPayload::Unknown { .. }
        ));

        let no_id = json!({"user_id": "u"}).to_string();
        assert!(matches!(
            IngestPayload::classify(ANALYTICS_TOPIC, &no_id).unwrap(),
            IngestPayload::Unknown { .. }
        ));
    }

    #[test]
    fn empty_markers_do_not_route() {
        let payload =
            IngestPayload::classify(REQUEST_LOG_TOPIC, &request_json(Some(""))).unwrap();
        assert_eq!(payload.bucket(), Some(Bucket::Request));

        let mut blank_id: Value = serde_json::from_str(&request_json(None)).unwrap();
        blank_id["event_id"] = json!("");
        let payload = IngestPayload::classify(REQUEST_LOG_TOPIC, &blank_id.to_string()).unwrap();
        assert_eq!(payload.bucket(), Some(Bucket::Request));

        let raw = json!({"event_id": "", "user_id": "u"}).to_string();
        assert!(matches!(
            IngestPayload::classify(ANALYTICS_TOPIC, &raw).unwrap(),
            IngestPayload::Unknown { .. }
        ));
    }

    #[test]
    fn decode_failures_keep_their_bucket() {
        let bad_time = json!({"event_id": "e-1", "event_time": "yesterday"}).to_string();
        let err = IngestPayload::classify(ANALYTICS_TOPIC, &bad_time).unwrap_err();
        assert_eq!(err.bucket(), Some(Bucket::Analytics));

        let err = IngestPayload::classify(REQUEST_LOG_TOPIC, "{not json").unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
        assert_eq!(err.bucket(), None);
    }

    proptest! {
        #[test]
        fn any_event_id_routes_to_analytics(id in "[a-zA-Z0-9-]{1,24}", error in proptest::option::of(".{0,16}")) {
            let raw = json!({"event_id": id, "error": error}).to_string();
            let payload = IngestPayload::classify(REQUEST_LOG_TOPIC, &raw).unwrap();
            prop_assert_eq!(payload.bucket(), Some(Bucket::Analytics));
        }
    }
}
