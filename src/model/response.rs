use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Normalized response envelope. A 2xx carries `data`, a 4xx/5xx carries
/// `error`; immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self::with_status(200, data)
    }

    pub fn with_status(status: u16, data: Value) -> Self {
        Self {
            status,
            data: Some(data),
            error: None,
            headers: HashMap::new(),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            error: Some(message.into()),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Handlers normally return bare data, but a returned object carrying a
    /// numeric `status` field is treated as a pre-built envelope and passed
    /// through unchanged.
    pub fn from_envelope(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let status = object.get("status")?.as_u64()?;
        if !(100..=599).contains(&status) {
            return None;
        }
        Some(Self {
            status: status as u16,
            data: object.get("data").cloned(),
            error: object
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            headers: HashMap::new(),
        })
    }
}
