use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Get,
    Set,
}

/// Outbound request
///
/// `value` is carried only by sets; the constructors keep that invariant.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Request {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: RequestType,
    pub feature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Request {
    /// Create a get request
    pub fn get(id: u64, feature: impl Into<String>) -> Self {
        Self {
            id,
            kind: RequestType::Get,
            feature: feature.into(),
            value: None,
        }
    }

    /// Create a set request
    pub fn set(id: u64, feature: impl Into<String>, value: Value) -> Self {
        Self {
            id,
            kind: RequestType::Set,
            feature: feature.into(),
            value: Some(value),
        }
    }
}

/// Reply correlated to a request by `id`
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u64,
    /// Some firmware echoes the feature on results
    pub feature: Option<String>,
    pub value: Value,
}

/// Unsolicited state change
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub feature: String,
    pub value: Value,
}

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Result(Reply),
    Notification(Notification),
    /// Parsed as JSON but not a usable result or notification
    Malformed(String),
}

impl Inbound {
    /// Classify a parsed JSON object
    ///
    /// Anything carrying an `id` is a result; id-less frames must be
    /// `"type": "notify"` with a string `feature`. Both require `value`.
    pub fn classify(frame: Value) -> Self {
        let Value::Object(mut obj) = frame else {
            return Inbound::Malformed(format!("not an object: {}", frame));
        };

        if let Some(id) = obj.get("id") {
            let Some(id) = id.as_u64() else {
                return Inbound::Malformed(format!("non-integer id: {}", id));
            };
            let Some(value) = obj.remove("value") else {
                return Inbound::Malformed(format!("result {} without value", id));
            };
            let feature = obj
                .get("feature")
                .and_then(Value::as_str)
                .map(str::to_owned);
            return Inbound::Result(Reply { id, feature, value });
        }

        match obj.get("type").and_then(Value::as_str) {
            Some("notify") => {}
            Some(other) => return Inbound::Malformed(format!("unexpected id-less type {}", other)),
            None => return Inbound::Malformed("frame without id or type".to_string()),
        }

        let Some(feature) = obj.get("feature").and_then(Value::as_str).map(str::to_owned) else {
            return Inbound::Malformed("notification without feature".to_string());
        };
        let Some(value) = obj.remove("value") else {
            return Inbound::Malformed(format!("notification for {} without value", feature));
        };

        Inbound::Notification(Notification { feature, value })
    }
}
