//! Wire messages carried in queue payloads
//!
//! Input entries carry `{"function", "uuid", "args"}`, output entries carry
//! `{"uuid", "result"}` or, when the worker rejected the request,
//! `{"uuid", "error"}`. Payloads are UTF-8 JSON.

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A function call written to the input queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub function: String,
    pub uuid: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

/// A worker's answer written to the output queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Request {
    pub fn new(function: impl Into<String>, uuid: impl Into<String>, args: Value) -> Self {
        Self {
            function: function.into(),
            uuid: uuid.into(),
            args,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::malformed(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let request: Request = serde_json::from_slice(payload)
            .map_err(|e| QueueError::malformed(format!("request: {e}")))?;
        if request.function.is_empty() {
            return Err(QueueError::malformed("request has an empty function"));
        }
        if request.uuid.is_empty() {
            return Err(QueueError::malformed("request has an empty uuid"));
        }
        Ok(request)
    }
}

impl Response {
    pub fn ok(uuid: impl Into<String>, result: Value) -> Self {
        Self {
            uuid: uuid.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(uuid: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::malformed(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| QueueError::malformed(format!("response: {e}")))
    }

    /// The result value, or the worker's error
    ///
    /// A response without `result` and without `error` stands for `null`.
    pub fn into_result(self, function: &str) -> Result<Value> {
        match self.error {
            Some(message) => Err(QueueError::WorkerFailed {
                function: function.to_string(),
                message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
