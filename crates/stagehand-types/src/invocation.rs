//! Invocation-level types: who is running, and how another function is asked
//! to run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::InvocationTypeError;

/// Ambient metadata about the current invocation, exposed to expressions as
/// `invocationMetadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMetadata {
    /// Name of the function currently executing. Recursive dependencies
    /// target this name.
    pub function_name: String,
    /// Unique identifier of this invocation.
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_version: Option<String>,
    /// Epoch milliseconds after which the host will stop the invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<i64>,
}

impl InvocationMetadata {
    pub fn new(function_name: impl Into<String>, invocation_id: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            invocation_id: invocation_id.into(),
            function_version: None,
            deadline_ms: None,
        }
    }
}

/// How a downstream function invocation should be performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvocationType {
    /// Fire-and-forget.
    #[default]
    Event,
    /// Synchronous, waits for the downstream result.
    RequestResponse,
}

impl fmt::Display for InvocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationType::Event => write!(f, "Event"),
            InvocationType::RequestResponse => write!(f, "RequestResponse"),
        }
    }
}

impl FromStr for InvocationType {
    type Err = InvocationTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Event" => Ok(InvocationType::Event),
            "RequestResponse" => Ok(InvocationType::RequestResponse),
            other => Err(InvocationTypeError(other.to_string())),
        }
    }
}

/// A request to invoke a function, in the shape the provider's invoke
/// capability expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationRequest {
    pub function_name: String,
    pub invocation_type: InvocationType,
    /// JSON-encoded payload.
    pub payload: String,
}

impl InvocationRequest {
    pub fn new(
        function_name: impl Into<String>,
        invocation_type: InvocationType,
        payload: &Value,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            invocation_type,
            payload: payload.to_string(),
        }
    }

    /// Decode the JSON payload.
    pub fn decoded_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// Render as a descriptor parameter record.
    pub fn into_params(self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("FunctionName".to_string(), Value::String(self.function_name));
        params.insert(
            "InvocationType".to_string(),
            Value::String(self.invocation_type.to_string()),
        );
        params.insert("Payload".to_string(), Value::String(self.payload));
        params
    }

    /// Read back a request from descriptor parameters.
    pub fn from_params(params: &Map<String, Value>) -> Option<Self> {
        serde_json::from_value(Value::Object(params.clone())).ok()
    }
}
