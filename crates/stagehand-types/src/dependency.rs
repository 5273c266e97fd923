//! Compiled dependency descriptors handed to a data access provider.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::expression::Expression;

/// Access schema name used for function invocation descriptors.
pub const INVOKE_SCHEMA: &str = "lambda.invoke";

/// Access schema name used for generic HTTP descriptors.
pub const GENERIC_API_SCHEMA: &str = "genericApi";

/// Identifies the provider capability that resolves a descriptor.
///
/// The engine never executes capabilities itself; it only names them. The
/// exception is `Passthrough`, whose result is the descriptor's own `value`
/// parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessSchema {
    /// A capability registered with the provider under this name.
    ByName(String),
    /// An opaque capability definition, interpreted by the provider.
    Literal(Value),
    /// Synthetic constant: resolves to `params.value`.
    Passthrough,
}

impl AccessSchema {
    /// Strings name a registered capability; anything else is opaque.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(name) => AccessSchema::ByName(name),
            other => AccessSchema::Literal(other),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, AccessSchema::Passthrough)
    }
}

/// A compiled unit of work: a capability plus its resolved parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyDescriptor {
    pub access_schema: AccessSchema,
    pub params: Map<String, Value>,
}

impl DependencyDescriptor {
    pub fn new(access_schema: AccessSchema, params: Map<String, Value>) -> Self {
        Self {
            access_schema,
            params,
        }
    }

    /// Descriptor resolving to a constant value.
    pub fn passthrough(value: Value) -> Self {
        let mut params = Map::new();
        params.insert("value".to_string(), value);
        Self::new(AccessSchema::Passthrough, params)
    }
}

/// One source feeding a [`SourceFormatter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInput {
    /// Qualified source name.
    pub name: String,
    /// Key the source is bound under; defaults to `name`.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Keep list results whole instead of taking their first element.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_array_like: bool,
}

/// Shapes the results of a parameter's sources before the provider uses them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFormatter {
    pub inputs: Vec<SourceInput>,
    pub expression: Expression,
}

impl SourceFormatter {
    /// The object the expression is resolved against: each input's result
    /// under its alias. Single results arrive as lists and are unwrapped
    /// unless the input is array-like.
    pub fn bindings(&self, results: &Map<String, Value>) -> Value {
        let mut bound = Map::new();
        for input in &self.inputs {
            let raw = results.get(&input.name).cloned().unwrap_or(Value::Null);
            let value = match raw {
                Value::Array(items) if !input.is_array_like => {
                    items.into_iter().next().unwrap_or(Value::Null)
                }
                other => other,
            };
            let key = input.alias.as_deref().unwrap_or(&input.name);
            bound.insert(key.to_string(), value);
        }
        Value::Object(bound)
    }
}

/// Qualify a builder-local name with its owning dependency name.
///
/// An empty local name means the builder emitted a single unnamed descriptor,
/// which takes the dependency name as-is.
pub fn qualified_name(dependency_name: &str, local_name: &str) -> String {
    if local_name.is_empty() {
        dependency_name.to_string()
    } else {
        format!("{dependency_name}_{local_name}")
    }
}
