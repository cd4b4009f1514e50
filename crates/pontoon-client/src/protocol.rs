//! Wire contract with the relay endpoint.
//!
//! The relay speaks a fixed camelCase JSON dialect over a single POST
//! URL. Responses arrive either bare or wrapped in an `{ok, data}`
//! envelope; [`unwrap_envelope`] is the only place that distinction
//! exists.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RelayError, RelayResult};

/// Smallest poll interval the client will honor.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Largest poll interval the client will honor.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10_000);

/// One-off handshake body sent when a session key is adopted.
#[derive(Debug, Serialize)]
pub struct InitRequest {
    pub key: String,
    pub init: bool,
}

impl InitRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            init: true,
        }
    }
}

/// A caller-issued host call as it travels to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingCall {
    pub request_key: String,
    pub method: String,
    pub params: Value,
}

/// One batch round's upload: fresh calls, status queries for calls the
/// relay already accepted, and acknowledgements for delivered results.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub key: String,
    pub completed_keys: Vec<String>,
    pub status_request_keys: Vec<String>,
    pub calls: Vec<OutgoingCall>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    #[serde(default)]
    pub interval_ms: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    #[serde(default)]
    pub interval_ms: Option<Value>,
    #[serde(default)]
    pub results: Vec<CallResult>,
    #[serde(default)]
    pub created: Vec<CallCreated>,
    #[serde(default)]
    pub cleanup_count: Option<u64>,
}

/// Outcome record for a call the relay finished executing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    pub request_key: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallResult {
    /// Only `done` records carry a consumable outcome.
    pub fn is_done(&self) -> bool {
        self.status.as_deref() == Some("done")
    }
}

/// Admission record for a call submitted in the same round.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCreated {
    pub request_key: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl CallCreated {
    pub fn accepted(&self) -> bool {
        self.status.as_deref() == Some("pending")
    }
}

/// Strips the optional `{ok, data}` envelope from a relay response.
///
/// An object carrying a boolean `ok` is the wrapper: `ok: true` must
/// hold an object `data`, `ok: false` is the relay reporting a failure
/// of its own. Any other object is the data itself; everything else is
/// malformed.
pub fn unwrap_envelope(raw: Value) -> RelayResult<Map<String, Value>> {
    let Value::Object(mut object) = raw else {
        return Err(RelayError::Protocol("response is not a JSON object".into()));
    };
    match object.get("ok") {
        None => Ok(object),
        Some(Value::Bool(true)) => match object.remove("data") {
            Some(Value::Object(data)) => Ok(data),
            Some(_) => Err(RelayError::Protocol("envelope data is not a JSON object".into())),
            None => Err(RelayError::Protocol("envelope is missing data".into())),
        },
        Some(Value::Bool(false)) => {
            let detail = object
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("relay envelope flagged failure");
            Err(RelayError::Server(detail.to_string()))
        }
        Some(_) => Err(RelayError::Protocol("envelope ok flag is not a boolean".into())),
    }
}

pub fn decode_init(raw: Value) -> RelayResult<InitResponse> {
    let data = unwrap_envelope(raw)?;
    serde_json::from_value(Value::Object(data)).map_err(|err| RelayError::Protocol(err.to_string()))
}

pub fn decode_batch(raw: Value) -> RelayResult<BatchResponse> {
    let data = unwrap_envelope(raw)?;
    serde_json::from_value(Value::Object(data)).map_err(|err| RelayError::Protocol(err.to_string()))
}

/// Poll interval suggested by the relay, accepted only when numeric and
/// inside [`MIN_POLL_INTERVAL`, `MAX_POLL_INTERVAL`]. Anything else is
/// ignored and the previous interval stays in force.
pub fn parse_poll_interval(value: Option<&Value>) -> Option<Duration> {
    let millis = value?.as_f64()?;
    if !millis.is_finite() {
        return None;
    }
    if millis < MIN_POLL_INTERVAL.as_millis() as f64 || millis > MAX_POLL_INTERVAL.as_millis() as f64
    {
        return None;
    }
    Some(Duration::from_millis(millis as u64))
}

/// Result payloads are JSON-in-JSON when the host serialises them as
/// strings: a string holding valid JSON is parsed, anything else passes
/// through verbatim.
pub fn parse_result_value(value: Value) -> Value {
    match value {
        Value::String(text) => match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(text),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_object_passes_through() {
        let data = unwrap_envelope(json!({"intervalMs": 1000})).expect("bare object");
        assert_eq!(data.get("intervalMs"), Some(&json!(1000)));
    }

    #[test]
    fn wrapped_object_unwraps_data() {
        let data = unwrap_envelope(json!({"ok": true, "data": {"results": []}}))
            .expect("wrapped object");
        assert_eq!(data.get("results"), Some(&json!([])));
    }

    #[test]
    fn wrapper_without_object_data_is_malformed() {
        assert!(matches!(
            unwrap_envelope(json!({"ok": true})),
            Err(RelayError::Protocol(_))
        ));
        assert!(matches!(
            unwrap_envelope(json!({"ok": true, "data": 7})),
            Err(RelayError::Protocol(_))
        ));
    }

    #[test]
    fn failed_wrapper_reports_relay_text() {
        let err = unwrap_envelope(json!({"ok": false, "error": "session expired"}))
            .expect_err("failure envelope");
        assert!(matches!(err, RelayError::Server(_)));
        assert!(err.to_string().contains("session expired"));
    }

    #[test]
    fn non_objects_are_malformed() {
        assert!(unwrap_envelope(json!([1, 2, 3])).is_err());
        assert!(unwrap_envelope(json!("plain text")).is_err());
        assert!(unwrap_envelope(json!(null)).is_err());
    }

    #[test]
    fn batch_decode_defaults_missing_sections() {
        let batch = decode_batch(json!({"intervalMs": 2500})).expect("decode");
        assert!(batch.results.is_empty());
        assert!(batch.created.is_empty());
        assert_eq!(batch.cleanup_count, None);
        assert_eq!(
            parse_poll_interval(batch.interval_ms.as_ref()),
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn interval_outside_range_is_ignored() {
        assert_eq!(parse_poll_interval(Some(&json!(499))), None);
        assert_eq!(parse_poll_interval(Some(&json!(10_001))), None);
        assert_eq!(parse_poll_interval(Some(&json!(-3))), None);
        assert_eq!(parse_poll_interval(Some(&json!("soon"))), None);
        assert_eq!(parse_poll_interval(Some(&json!(true))), None);
        assert_eq!(parse_poll_interval(None), None);
    }

    #[test]
    fn interval_bounds_are_inclusive() {
        assert_eq!(
            parse_poll_interval(Some(&json!(500))),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            parse_poll_interval(Some(&json!(10_000))),
            Some(Duration::from_millis(10_000))
        );
    }

    #[test]
    fn string_results_parse_as_json() {
        assert_eq!(parse_result_value(json!("42")), json!(42));
        assert_eq!(parse_result_value(json!("{\"a\":1}")), json!({"a": 1}));
        assert_eq!(parse_result_value(json!("\"quoted\"")), json!("quoted"));
        assert_eq!(
            parse_result_value(json!("not json at all")),
            json!("not json at all")
        );
        assert_eq!(parse_result_value(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(parse_result_value(Value::Null), Value::Null);
    }

    #[test]
    fn created_status_gates_admission() {
        let batch = decode_batch(json!({
            "created": [
                {"requestKey": "a", "status": "pending"},
                {"requestKey": "b", "status": "denied"},
                {"requestKey": "c"}
            ]
        }))
        .expect("decode");
        let accepted: Vec<bool> = batch.created.iter().map(CallCreated::accepted).collect();
        assert_eq!(accepted, vec![true, false, false]);
    }

    #[test]
    fn only_done_results_are_consumable() {
        let batch = decode_batch(json!({
            "results": [
                {"requestKey": "a", "status": "done", "result": "1"},
                {"requestKey": "b", "status": "running"},
                {"requestKey": "c"}
            ]
        }))
        .expect("decode");
        let done: Vec<bool> = batch.results.iter().map(CallResult::is_done).collect();
        assert_eq!(done, vec![true, false, false]);
    }
}
