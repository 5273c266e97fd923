//! Built-in expression helpers.
//!
//! Every helper receives its parameters already resolved. Helpers that need to
//! evaluate a deferred expression (`transform`, `map`) take it as a literal
//! value and resolve it through the [`HelperCall`] handle.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value, json};
use sha2::Sha256;
use stagehand_types::error::ExpressionParseError;
use uuid::Uuid;

use crate::expression::{HelperCall, HelperRegistry, lookup_path};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signed message, in seconds.
pub const SIGNATURE_FRESHNESS_SECS: i64 = 300;

/// Default signature scheme version.
pub const DEFAULT_SIGNATURE_VERSION: &str = "v0";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a helper can report. The resolver logs them and yields `null`.
#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("missing parameter '{0}'")]
    MissingParam(String),

    #[error("invalid parameter '{param}': {reason}")]
    InvalidParam { param: String, reason: String },

    #[error("unknown helper: '{0}'")]
    UnknownHelper(String),

    #[error("invalid deferred expression: {0}")]
    Expression(#[from] ExpressionParseError),

    #[error("{0}")]
    Failed(String),
}

impl HelperError {
    fn invalid(param: &str, reason: impl Into<String>) -> Self {
        HelperError::InvalidParam {
            param: param.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter access
// ---------------------------------------------------------------------------

/// A required parameter. `null` counts as missing.
pub fn param<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a Value, HelperError> {
    match params.get(name) {
        Some(Value::Null) | None => Err(HelperError::MissingParam(name.to_string())),
        Some(v) => Ok(v),
    }
}

pub fn str_param<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a str, HelperError> {
    param(params, name)?
        .as_str()
        .ok_or_else(|| HelperError::invalid(name, "expected a string"))
}

fn opt_i64(params: &Map<String, Value>, name: &str) -> Result<Option<i64>, HelperError> {
    match params.get(name) {
        Some(Value::Null) | None => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HelperError::invalid(name, "expected an integer")),
    }
}

fn list_param<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a Vec<Value>, HelperError> {
    param(params, name)?
        .as_array()
        .ok_or_else(|| HelperError::invalid(name, "expected a list"))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

impl HelperRegistry {
    /// Registry containing every built-in helper.
    pub fn builtin() -> Self {
        HelperRegistry::new()
            .with("uuid", |_, _| Ok(Value::String(Uuid::new_v4().to_string())))
            .with("matches", matches)
            .with("env", env)
            .with("isEmptyList", |p, _| Ok(Value::Bool(!non_empty_list(p))))
            .with("isNonEmptyList", |p, _| Ok(Value::Bool(non_empty_list(p))))
            .with("slice", slice)
            .with("toJson", to_json)
            .with("fromJson", from_json)
            .with("qualifiedName", qualified_name)
            .with("template", template)
            .with("mapTemplate", map_template)
            .with("isInList", is_in_list)
            .with("msTimestamp", |_, _| Ok(json!(Utc::now().timestamp_millis())))
            .with("verifySignature", verify_signature)
            .with("transform", transform)
            .with("map", map)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn matches(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let a = params.get("a").unwrap_or(&Value::Null);
    let b = params.get("b").unwrap_or(&Value::Null);
    Ok(Value::Bool(a == b))
}

fn env(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let name = str_param(params, "name")?;
    Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
}

fn non_empty_list(params: &Map<String, Value>) -> bool {
    params
        .get("list")
        .and_then(Value::as_array)
        .is_some_and(|l| !l.is_empty())
}

fn slice(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let list = list_param(params, "list")?;
    let len = list.len() as i64;
    let clamp = |i: i64| -> usize {
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len) as usize
    };
    let start = clamp(opt_i64(params, "start")?.unwrap_or(0));
    let end = clamp(opt_i64(params, "end")?.unwrap_or(len));
    if start >= end {
        return Ok(Value::Array(Vec::new()));
    }
    Ok(Value::Array(list[start..end].to_vec()))
}

fn to_json(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let value = params.get("value").unwrap_or(&Value::Null);
    Ok(Value::String(value.to_string()))
}

fn from_json(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let raw = str_param(params, "string")?;
    serde_json::from_str(raw).map_err(|e| HelperError::invalid("string", e.to_string()))
}

fn qualified_name(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let prefix = str_param(params, "prefix")?;
    let name = str_param(params, "name")?;
    Ok(Value::String(stagehand_types::dependency::qualified_name(prefix, name)))
}

/// Substitute `${key}` placeholders. Keys may be dotted paths. Strings are
/// inserted raw, other values as JSON; unknown keys are left in place.
pub fn render_template(template: &str, bindings: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        match lookup_path(bindings, key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn template(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let template = str_param(params, "template")?;
    let bindings = params.get("params").cloned().unwrap_or_else(|| json!({}));
    Ok(Value::String(render_template(template, &bindings)))
}

fn item_bindings(item: &Value, index: usize) -> Map<String, Value> {
    let mut bindings = match item {
        Value::Object(obj) => obj.clone(),
        _ => Map::new(),
    };
    bindings.insert("item".to_string(), item.clone());
    bindings.insert("index".to_string(), json!(index));
    bindings
}

fn map_template(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let template = str_param(params, "template")?;
    let list = list_param(params, "list")?;
    Ok(Value::Array(
        list.iter()
            .enumerate()
            .map(|(i, item)| {
                Value::String(render_template(template, &Value::Object(item_bindings(item, i))))
            })
            .collect(),
    ))
}

fn is_in_list(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let list = list_param(params, "list")?;
    let item = params.get("item").unwrap_or(&Value::Null);
    Ok(Value::Bool(list.contains(item)))
}

// -- Signed messages --

/// Compute the `version=<hex>` signature for a message.
pub fn sign_message(
    secret: &[u8],
    version: &str,
    timestamp: i64,
    body: &str,
) -> Result<String, HelperError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| HelperError::invalid("secret", e.to_string()))?;
    mac.update(format!("{version}:{timestamp}:{body}").as_bytes());
    Ok(format!("{version}={}", hex_encode(&mac.finalize().into_bytes())))
}

/// Verify a `version=<hex>` HMAC-SHA256 signature over `version:timestamp:body`.
///
/// Messages whose timestamp is more than [`SIGNATURE_FRESHNESS_SECS`] away
/// from `now` are rejected regardless of the signature.
pub fn verify_message(
    secret: &[u8],
    version: &str,
    timestamp: i64,
    body: &str,
    signature: &str,
    now: i64,
) -> bool {
    if now.abs_diff(timestamp) > SIGNATURE_FRESHNESS_SECS.unsigned_abs() {
        return false;
    }
    let Some(hex_sig) = signature
        .strip_prefix(version)
        .and_then(|s| s.strip_prefix('='))
    else {
        return false;
    };
    let Some(expected) = hex_decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(format!("{version}:{timestamp}:{body}").as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn verify_signature(params: &Map<String, Value>, _: &HelperCall<'_>) -> Result<Value, HelperError> {
    let secret = str_param(params, "secret")?;
    let signature = str_param(params, "signature")?;
    let body = str_param(params, "body")?;
    let version = params
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_SIGNATURE_VERSION);
    let timestamp = match param(params, "timestamp")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| HelperError::invalid("timestamp", "expected epoch seconds"))?;

    Ok(Value::Bool(verify_message(
        secret.as_bytes(),
        version,
        timestamp,
        body,
        signature,
        Utc::now().timestamp(),
    )))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

// -- Generic transforms --

/// Apply either a named helper (`helper`) or a deferred expression
/// (`expression`) to one value.
fn apply_one(
    params: &Map<String, Value>,
    call: &HelperCall<'_>,
    bindings: Map<String, Value>,
) -> Result<Value, HelperError> {
    if let Some(name) = params.get("helper").and_then(Value::as_str) {
        return call.call(name, &bindings);
    }
    if let Some(expr) = params.get("expression") {
        return call.resolve_with(expr, bindings);
    }
    Err(HelperError::MissingParam("helper' or 'expression".to_string()))
}

fn transform(params: &Map<String, Value>, call: &HelperCall<'_>) -> Result<Value, HelperError> {
    let value = params.get("value").cloned().unwrap_or(Value::Null);
    let mut bindings = Map::new();
    bindings.insert("value".to_string(), value);
    apply_one(params, call, bindings)
}

fn map(params: &Map<String, Value>, call: &HelperCall<'_>) -> Result<Value, HelperError> {
    let list = list_param(params, "list")?;
    list.iter()
        .enumerate()
        .map(|(i, item)| {
            let mut bindings = Map::new();
            bindings.insert("value".to_string(), item.clone());
            bindings.insert("item".to_string(), item.clone());
            bindings.insert("index".to_string(), json!(i));
            apply_one(params, call, bindings)
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
