//! Dependency builders: named functions that turn a resolved parameter
//! record into zero or more dependency descriptors.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use stagehand_types::dependency::{
    AccessSchema, DependencyDescriptor, GENERIC_API_SCHEMA, INVOKE_SCHEMA, SourceFormatter,
    SourceInput, qualified_name,
};
use stagehand_types::expression::Expression;
use stagehand_types::invocation::{InvocationRequest, InvocationType};

use crate::compiler::BuildScope;
use crate::depth::{DepthExceeded, DepthGuard};
use crate::expression::Resolver;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("unknown builder: '{0}'")]
    UnknownBuilder(String),

    #[error("invalid builder parameters: {0}")]
    InvalidParams(String),

    #[error("depth limit reached: {0}")]
    DepthExceeded(#[from] DepthExceeded),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub type BuilderFn =
    dyn Fn(&Map<String, Value>, &mut BuildScope<'_>) -> Result<(), BuildError> + Send + Sync;

/// Name-keyed builder table, resolved once per task.
#[derive(Clone, Default)]
pub struct BuilderRegistry {
    builders: HashMap<String, Arc<BuilderFn>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in builders.
    pub fn builtin() -> Self {
        Self::new()
            .with("invokeFunction", invoke_function)
            .with("recurse", recurse)
            .with("eventConfiguredInvocation", event_configured)
            .with("eventConfiguredDD", event_configured)
            .with("DD", dd)
            .with("exploranda", exploranda)
            .with("explorandaDeprecated", exploranda)
            .with("explorandaUpdated", exploranda_updated)
            .with("genericApi", generic_api)
            .with("storeItem", store_item)
            .with("reportFulfilled", report_fulfilled)
    }

    pub fn register<F>(&mut self, name: impl Into<String>, builder: F) -> &mut Self
    where
        F: Fn(&Map<String, Value>, &mut BuildScope<'_>) -> Result<(), BuildError>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(name.into(), Arc::new(builder));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, builder: F) -> Self
    where
        F: Fn(&Map<String, Value>, &mut BuildScope<'_>) -> Result<(), BuildError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, builder);
        self
    }

    /// Overlay `other`; its entries win.
    pub fn merged(mut self, other: BuilderRegistry) -> Self {
        self.builders.extend(other.builders);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<BuilderFn>> {
        self.builders.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for BuilderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderRegistry")
            .field("builders", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parameter access
// ---------------------------------------------------------------------------

fn required<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a Value, BuildError> {
    match params.get(name) {
        Some(Value::Null) | None => Err(BuildError::InvalidParams(format!(
            "missing required parameter '{name}'"
        ))),
        Some(v) => Ok(v),
    }
}

fn required_str<'a>(params: &'a Map<String, Value>, name: &str) -> Result<&'a str, BuildError> {
    required(params, name)?
        .as_str()
        .ok_or_else(|| BuildError::InvalidParams(format!("'{name}' must be a string")))
}

fn invocation_type(params: &Map<String, Value>) -> Result<InvocationType, BuildError> {
    match params.get("InvocationType") {
        None | Some(Value::Null) => Ok(InvocationType::default()),
        Some(Value::String(s)) => s
            .parse()
            .map_err(|e: stagehand_types::error::InvocationTypeError| {
                BuildError::InvalidParams(e.to_string())
            }),
        Some(other) => Err(BuildError::InvalidParams(format!(
            "InvocationType must be a string, got {other}"
        ))),
    }
}

fn object_or_empty(value: Option<&Value>, name: &str) -> Result<Map<String, Value>, BuildError> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(obj)) => Ok(obj.clone()),
        Some(_) => Err(BuildError::InvalidParams(format!("'{name}' must be an object"))),
    }
}

/// Emit an invocation descriptor under the dependency's own name. `depth`
/// comes from a prior [`DepthGuard::check`].
fn emit_invocation(
    scope: &mut BuildScope<'_>,
    guard: DepthGuard,
    depth: u64,
    function_name: &str,
    invocation_type: InvocationType,
    mut payload: Value,
) -> Result<(), BuildError> {
    guard.stamp(&mut payload, depth);
    let request = InvocationRequest::new(function_name, invocation_type, &payload);
    scope.add_dependency(
        "",
        DependencyDescriptor::new(
            AccessSchema::ByName(INVOKE_SCHEMA.to_string()),
            request.into_params(),
        ),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Invocation builders
// ---------------------------------------------------------------------------

fn invoke_function(params: &Map<String, Value>, scope: &mut BuildScope<'_>) -> Result<(), BuildError> {
    let function_name = required_str(params, "FunctionName")?;
    let payload = object_or_empty(params.get("Payload"), "Payload")?;
    let invocation_type = invocation_type(params)?;
    let guard = scope.guards().bounce;
    let depth = guard.check(scope.event())?;
    emit_invocation(
        scope,
        guard,
        depth,
        function_name,
        invocation_type,
        Value::Object(payload),
    )
}

fn recurse(params: &Map<String, Value>, scope: &mut BuildScope<'_>) -> Result<(), BuildError> {
    let metadata = scope.invocation_metadata().ok_or_else(|| {
        BuildError::InvalidParams("recursion needs invocationMetadata.functionName".to_string())
    })?;
    let mut payload = match scope.event() {
        Value::Object(obj) => obj.clone(),
        _ => Map::new(),
    };
    for (k, v) in params {
        if k != "InvocationType" {
            payload.insert(k.clone(), v.clone());
        }
    }
    let invocation_type = invocation_type(params)?;
    let guard = scope.guards().recursion;
    let depth = guard.check(scope.event())?;
    emit_invocation(
        scope,
        guard,
        depth,
        &metadata.function_name,
        invocation_type,
        Value::Object(payload),
    )
}

/// Expectation records for a downstream payload, keyed by name. Each
/// expected resource is also registered as a resource reference.
fn expectation_records(
    params: &Map<String, Value>,
    scope: &mut BuildScope<'_>,
) -> Result<Map<String, Value>, BuildError> {
    let expectations = object_or_empty(params.get("expectations"), "expectations")?;
    let expected_by = match scope.invocation_metadata() {
        Some(meta) => json!({
            "functionName": meta.function_name,
            "invocationId": meta.invocation_id,
        }),
        None => Value::Null,
    };
    let mut records = Map::new();
    for (name, resource) in expectations {
        scope.add_resource_reference(&name, resource.clone());
        records.insert(
            name,
            json!({ "expectedResource": resource, "expectedBy": expected_by.clone() }),
        );
    }
    Ok(records)
}

fn event_configured(params: &Map<String, Value>, scope: &mut BuildScope<'_>) -> Result<(), BuildError> {
    let function_name = required_str(params, "FunctionName")?;
    let event = match params.get("event") {
        None | Some(Value::Null) => scope.event().clone(),
        Some(v) => v.clone(),
    };
    let mut config = object_or_empty(params.get("config"), "config")?;
    let invocation_type = invocation_type(params)?;
    let guard = scope.guards().bounce;
    let depth = guard.check(scope.event())?;
    let expectations = expectation_records(params, scope)?;
    config.insert("expectations".to_string(), Value::Object(expectations));
    emit_invocation(
        scope,
        guard,
        depth,
        function_name,
        invocation_type,
        json!({ "event": event, "config": config }),
    )
}

fn dd(params: &Map<String, Value>, scope: &mut BuildScope<'_>) -> Result<(), BuildError> {
    let function_name = required_str(params, "FunctionName")?;
    let event = match params.get("event") {
        None | Some(Value::Null) => scope.event().clone(),
        Some(v) => v.clone(),
    };
    let invocation_type = invocation_type(params)?;
    let guard = scope.guards().bounce;
    let depth = guard.check(scope.event())?;
    let expectations = expectation_records(params, scope)?;
    emit_invocation(
        scope,
        guard,
        depth,
        function_name,
        invocation_type,
        json!({ "event": event, "expectations": expectations }),
    )
}

// ---------------------------------------------------------------------------
// Data access builders
// ---------------------------------------------------------------------------

fn exploranda(params: &Map<String, Value>, scope: &mut BuildScope<'_>) -> Result<(), BuildError> {
    let schema = AccessSchema::from_value(required(params, "accessSchema")?.clone());
    let forwarded = object_or_empty(params.get("params"), "params")?;
    scope.add_dependency("", DependencyDescriptor::new(schema, forwarded));
    Ok(())
}

/// One `source` entry: a qualified name plus its formatter binding options.
fn source_input(source: &Value) -> Result<SourceInput, BuildError> {
    match source {
        Value::String(s) => Ok(SourceInput {
            name: s.clone(),
            alias: None,
            is_array_like: false,
        }),
        Value::Object(obj) => {
            let step = obj
                .get("configStepName")
                .and_then(Value::as_str)
                .ok_or_else(|| BuildError::InvalidParams("source needs configStepName".to_string()))?;
            let name = match obj.get("dependencyName").and_then(Value::as_str) {
                Some(dep) => qualified_name(step, dep),
                None => step.to_string(),
            };
            Ok(SourceInput {
                name,
                alias: obj.get("as").and_then(Value::as_str).map(str::to_string),
                is_array_like: obj.get("isArrayLike").and_then(Value::as_bool).unwrap_or(false),
            })
        }
        other => Err(BuildError::InvalidParams(format!("unsupported source: {other}"))),
    }
}

/// A string formatter selects one bound key; anything else is an expression.
fn formatter_expression(formatter: &Value) -> Result<Expression, BuildError> {
    match formatter {
        Value::String(key) => Ok(Expression::reference(key.as_str())),
        other => Expression::from_value_at(other, "formatter")
            .map_err(|e| BuildError::InvalidParams(e.to_string())),
    }
}

fn normalize_param(value: &Value) -> Result<Value, BuildError> {
    let Some(obj) = value.as_object() else {
        return Ok(json!({ "value": value }));
    };
    let Some(source) = obj.get("source") else {
        return Ok(json!({ "value": value }));
    };
    let (inputs, normalized) = match source {
        Value::Array(items) => {
            let inputs = items.iter().map(source_input).collect::<Result<Vec<_>, _>>()?;
            let names = inputs.iter().map(|i| Value::String(i.name.clone())).collect();
            (inputs, Value::Array(names))
        }
        single => {
            let input = source_input(single)?;
            let name = Value::String(input.name.clone());
            (vec![input], name)
        }
    };
    let Some(formatter) = obj.get("formatter").filter(|f| !f.is_null()) else {
        return Ok(json!({ "source": normalized }));
    };
    let formatter = SourceFormatter {
        inputs,
        expression: formatter_expression(formatter)?,
    };
    let formatter =
        serde_json::to_value(&formatter).map_err(|e| BuildError::InvalidParams(e.to_string()))?;
    Ok(json!({ "source": normalized, "formatter": formatter }))
}

/// Apply a normalized parameter's source formatter to the results of its
/// sources, keyed by qualified name. `None` when the parameter has none.
pub fn format_source_param(
    resolver: &Resolver,
    param: &Value,
    results: &Map<String, Value>,
) -> Result<Option<Value>, BuildError> {
    let Some(raw) = param.get("formatter") else {
        return Ok(None);
    };
    let formatter: SourceFormatter = serde_json::from_value(raw.clone())
        .map_err(|e| BuildError::InvalidParams(format!("formatter: {e}")))?;
    Ok(Some(resolver.resolve(&formatter.expression, &formatter.bindings(results))))
}

fn exploranda_updated(params: &Map<String, Value>, scope: &mut BuildScope<'_>) -> Result<(), BuildError> {
    let schema = AccessSchema::from_value(required(params, "accessSchema")?.clone());
    let raw = object_or_empty(params.get("params"), "params")?;
    let normalized = raw
        .iter()
        .map(|(k, v)| normalize_param(v).map(|n| (k.clone(), n)))
        .collect::<Result<Map<String, Value>, _>>()?;
    scope.add_dependency("", DependencyDescriptor::new(schema, normalized));
    Ok(())
}

fn generic_api(params: &Map<String, Value>, scope: &mut BuildScope<'_>) -> Result<(), BuildError> {
    let urls = match (params.get("urls"), params.get("url")) {
        (Some(Value::Array(list)), _) => list.clone(),
        (Some(Value::String(u)), _) | (_, Some(Value::String(u))) => vec![Value::String(u.clone())],
        _ => {
            return Err(BuildError::InvalidParams(
                "genericApi needs 'url' or 'urls'".to_string(),
            ));
        }
    };
    let allow_404 = params.get("allow404").and_then(Value::as_bool).unwrap_or(false);

    let mut forwarded = Map::new();
    forwarded.insert("urls".to_string(), Value::Array(urls));
    forwarded.insert(
        "method".to_string(),
        params.get("method").cloned().unwrap_or_else(|| json!("GET")),
    );
    for key in ["headers", "body"] {
        if let Some(v) = params.get(key).filter(|v| !v.is_null()) {
            forwarded.insert(key.to_string(), v.clone());
        }
    }
    forwarded.insert("notFoundIsError".to_string(), Value::Bool(!allow_404));

    scope.add_dependency(
        "",
        DependencyDescriptor::new(AccessSchema::ByName(GENERIC_API_SCHEMA.to_string()), forwarded),
    );
    Ok(())
}

fn store_item(params: &Map<String, Value>, scope: &mut BuildScope<'_>) -> Result<(), BuildError> {
    let value = params.get("value").cloned().unwrap_or(Value::Null);
    scope.add_dependency("", DependencyDescriptor::passthrough(value));
    Ok(())
}

fn report_fulfilled(params: &Map<String, Value>, scope: &mut BuildScope<'_>) -> Result<(), BuildError> {
    match (params.get("resources"), params.get("resource")) {
        (Some(Value::Array(list)), _) => {
            for r in list {
                scope.add_fulfilled_resource(r.clone());
            }
        }
        (_, Some(r)) if !r.is_null() => scope.add_fulfilled_resource(r.clone()),
        _ => {
            return Err(BuildError::InvalidParams(
                "reportFulfilled needs 'resource' or 'resources'".to_string(),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompiledStage, Compiler};
    use crate::depth::DepthGuards;
    use crate::expression::{HelperRegistry, Resolver};
    use crate::log::TaskLog;
    use indexmap::IndexMap;
    use stagehand_types::task::{DependencySpec, Overrides};

    fn compile(context: Value, deps: Value) -> CompiledStage {
        compile_with(context, deps, DepthGuards::default())
    }

    fn compile_with(context: Value, deps: Value, guards: DepthGuards) -> CompiledStage {
        let resolver = Resolver::new(Arc::new(HelperRegistry::builtin()), TaskLog::detached(false));
        let compiler = Compiler::new(resolver, Arc::new(BuilderRegistry::builtin()), guards);
        let specs: IndexMap<String, DependencySpec> = serde_json::from_value(deps).unwrap();
        compiler.compile("test", &context, &specs)
    }

    fn request(stage: &CompiledStage, name: &str) -> InvocationRequest {
        let d = &stage.dependencies[name];
        assert_eq!(d.access_schema, AccessSchema::ByName(INVOKE_SCHEMA.to_string()));
        InvocationRequest::from_params(&d.params).unwrap()
    }

    fn ctx(event: Value) -> Value {
        json!({
            "event": event,
            "invocationMetadata": { "functionName": "self", "invocationId": "inv-1" }
        })
    }

    #[test]
    fn test_recurse_merges_params_over_event() {
        let out = compile(
            ctx(json!({ "a": 4 })),
            json!({ "again": { "action": "recurse", "params": { "b": 1 } } }),
        );
        let req = request(&out, "again");
        assert_eq!(req.function_name, "self");
        assert_eq!(req.invocation_type, InvocationType::Event);
        assert_eq!(
            req.decoded_payload().unwrap(),
            json!({ "a": 4, "b": 1, "recursionDepth": 2 })
        );
    }

    #[test]
    fn test_recurse_refused_at_ceiling() {
        let out = compile(
            ctx(json!({ "recursionDepth": 3 })),
            json!({ "again": { "action": "recurse" } }),
        );
        assert!(out.dependencies.is_empty());
    }

    #[test]
    fn test_recurse_respects_override() {
        let guards = DepthGuards::from_overrides(&Overrides {
            max_recursion_depth: Some(10),
            ..Overrides::default()
        });
        let out = compile_with(
            ctx(json!({ "recursionDepth": 3 })),
            json!({ "again": { "action": "recurse", "params": { "InvocationType": "RequestResponse" } } }),
            guards,
        );
        let req = request(&out, "again");
        assert_eq!(req.invocation_type, InvocationType::RequestResponse);
        let payload = req.decoded_payload().unwrap();
        assert_eq!(payload["recursionDepth"], json!(4));
        assert!(payload.get("InvocationType").is_none());
    }

    #[test]
    fn test_invoke_function_stamps_bounce_depth() {
        let out = compile(
            ctx(json!({ "bounceDepth": 2 })),
            json!({ "call": {
                "action": "invokeFunction",
                "params": { "FunctionName": "worker", "Payload": { "value": { "x": 1 } } }
            } }),
        );
        let req = request(&out, "call");
        assert_eq!(req.function_name, "worker");
        assert_eq!(req.decoded_payload().unwrap(), json!({ "x": 1, "bounceDepth": 3 }));
    }

    #[test]
    fn test_invoke_function_refused_at_bounce_ceiling() {
        let out = compile(
            ctx(json!({ "bounceDepth": 6 })),
            json!({ "call": { "action": "invokeFunction", "params": { "FunctionName": "worker" } } }),
        );
        assert!(out.dependencies.is_empty());
    }

    #[test]
    fn test_invoke_function_requires_name() {
        let out = compile(ctx(json!({})), json!({ "call": { "action": "invokeFunction" } }));
        assert!(out.dependencies.is_empty());
    }

    #[test]
    fn test_event_configured_invocation_payload() {
        let out = compile(
            ctx(json!({ "id": 9 })),
            json!({ "next": {
                "action": "eventConfiguredInvocation",
                "params": {
                    "FunctionName": "downstream",
                    "config": { "value": { "mode": "fast" } },
                    "expectations": { "value": { "out": { "bucket": "b", "key": "k" } } }
                }
            } }),
        );
        let payload = request(&out, "next").decoded_payload().unwrap();
        assert_eq!(payload["event"], json!({ "id": 9 }));
        assert_eq!(payload["config"]["mode"], json!("fast"));
        assert_eq!(
            payload["config"]["expectations"]["out"],
            json!({
                "expectedResource": { "bucket": "b", "key": "k" },
                "expectedBy": { "functionName": "self", "invocationId": "inv-1" }
            })
        );
        assert_eq!(payload["bounceDepth"], json!(2));
        assert_eq!(out.resource_references["next_out"], json!({ "bucket": "b", "key": "k" }));
    }

    #[test]
    fn test_dd_payload() {
        let out = compile(
            ctx(json!({ "id": 9 })),
            json!({ "next": {
                "action": "DD",
                "params": {
                    "FunctionName": "downstream",
                    "event": { "value": { "other": true } },
                    "expectations": { "value": { "out": "r" } }
                }
            } }),
        );
        let payload = request(&out, "next").decoded_payload().unwrap();
        assert_eq!(payload["event"], json!({ "other": true }));
        assert_eq!(payload["expectations"]["out"]["expectedResource"], json!("r"));
        assert!(payload.get("config").is_none());
    }

    #[test]
    fn test_refused_invocation_registers_no_references() {
        for action in ["eventConfiguredInvocation", "DD"] {
            let out = compile(
                ctx(json!({ "bounceDepth": 6 })),
                json!({ "next": {
                    "action": action,
                    "params": {
                        "FunctionName": "downstream",
                        "expectations": { "value": { "out": "r" } }
                    }
                } }),
            );
            assert!(out.dependencies.is_empty(), "{action}");
            assert!(out.resource_references.is_empty(), "{action}");
        }
    }

    #[test]
    fn test_bad_invocation_type_registers_no_references() {
        let out = compile(
            ctx(json!({})),
            json!({ "next": {
                "action": "DD",
                "params": {
                    "FunctionName": "downstream",
                    "InvocationType": "Sometimes",
                    "expectations": { "value": { "out": "r" } }
                }
            } }),
        );
        assert!(out.dependencies.is_empty());
        assert!(out.resource_references.is_empty());
    }

    #[test]
    fn test_exploranda_forwards_schema_and_params() {
        let out = compile(
            json!({ "event": { "bucket": "media" } }),
            json!({ "list": {
                "action": "exploranda",
                "params": {
                    "accessSchema": { "value": "s3.listObjects" },
                    "params": { "all": { "Bucket": { "ref": "event.bucket" } } }
                }
            } }),
        );
        let d = &out.dependencies["list"];
        assert_eq!(d.access_schema, AccessSchema::ByName("s3.listObjects".to_string()));
        assert_eq!(d.params["Bucket"], json!("media"));
    }

    #[test]
    fn test_exploranda_literal_schema() {
        let out = compile(
            json!({}),
            json!({ "custom": {
                "action": "explorandaDeprecated",
                "params": { "accessSchema": { "value": { "dataSource": "X" } } }
            } }),
        );
        assert_eq!(
            out.dependencies["custom"].access_schema,
            AccessSchema::Literal(json!({ "dataSource": "X" }))
        );
    }

    #[test]
    fn test_exploranda_updated_normalizes_params() {
        let out = compile(
            json!({}),
            json!({ "q": {
                "action": "explorandaUpdated",
                "params": {
                    "accessSchema": { "value": "s3.getObject" },
                    "params": { "value": {
                        "Bucket": "b",
                        "Key": { "source": { "configStepName": "gather", "dependencyName": "keys" } },
                        "Many": { "source": ["x", { "configStepName": "solo" }] }
                    } }
                }
            } }),
        );
        let params = &out.dependencies["q"].params;
        assert_eq!(params["Bucket"], json!({ "value": "b" }));
        assert_eq!(params["Key"], json!({ "source": "gather_keys" }));
        assert_eq!(params["Many"], json!({ "source": ["x", "solo"] }));
    }

    fn normalized(param: Value) -> Value {
        let out = compile(
            json!({}),
            json!({ "q": {
                "action": "explorandaUpdated",
                "params": {
                    "accessSchema": { "value": "s3.getObject" },
                    "params": { "value": { "p": param } }
                }
            } }),
        );
        out.dependencies["q"].params["p"].clone()
    }

    fn apply_formatter(param: &Value, results: Value) -> Value {
        let resolver = Resolver::new(Arc::new(HelperRegistry::builtin()), TaskLog::detached(false));
        let results = results.as_object().cloned().unwrap();
        format_source_param(&resolver, param, &results).unwrap().unwrap()
    }

    #[test]
    fn test_exploranda_updated_string_formatter() {
        let p = normalized(json!({ "source": { "configStepName": "dep4" }, "formatter": "dep4" }));
        assert_eq!(p["source"], json!("dep4"));
        assert_eq!(apply_formatter(&p, json!({ "dep4": ["dep4"] })), json!("dep4"));
    }

    #[test]
    fn test_exploranda_updated_expression_formatter() {
        let p = normalized(json!({
            "source": { "configStepName": "dep4" },
            "formatter": { "all": { "got": { "ref": "dep4" } } }
        }));
        assert_eq!(apply_formatter(&p, json!({ "dep4": ["f00"] })), json!({ "got": "f00" }));
    }

    #[test]
    fn test_exploranda_updated_formatter_alias() {
        let p = normalized(json!({
            "source": { "configStepName": "dep4", "as": "foo" },
            "formatter": { "ref": "foo" }
        }));
        assert_eq!(p["source"], json!("dep4"));
        assert_eq!(apply_formatter(&p, json!({ "dep4": ["f00"] })), json!("f00"));
    }

    #[test]
    fn test_exploranda_updated_formatter_array_like() {
        let p = normalized(json!({
            "source": { "configStepName": "dep4", "isArrayLike": true },
            "formatter": { "ref": "dep4" }
        }));
        assert_eq!(apply_formatter(&p, json!({ "dep4": ["f00"] })), json!(["f00"]));
    }

    #[test]
    fn test_source_without_formatter_has_none() {
        let p = normalized(json!({ "source": "dep0" }));
        assert_eq!(p, json!({ "source": "dep0" }));
        let resolver = Resolver::new(Arc::new(HelperRegistry::builtin()), TaskLog::detached(false));
        assert!(format_source_param(&resolver, &p, &Map::new()).unwrap().is_none());
    }

    #[test]
    fn test_generic_api_descriptor() {
        let out = compile(
            json!({}),
            json!({ "site": {
                "action": "genericApi",
                "params": { "url": "https://example.com/a", "allow404": true }
            } }),
        );
        let d = &out.dependencies["site"];
        assert_eq!(d.access_schema, AccessSchema::ByName(GENERIC_API_SCHEMA.to_string()));
        assert_eq!(d.params["urls"], json!(["https://example.com/a"]));
        assert_eq!(d.params["method"], json!("GET"));
        assert_eq!(d.params["notFoundIsError"], json!(false));
    }

    #[test]
    fn test_store_item_is_passthrough() {
        let out = compile(
            json!({ "event": { "n": 3 } }),
            json!({ "keep": { "action": "storeItem", "params": { "value": { "ref": "event.n" } } } }),
        );
        let d = &out.dependencies["keep"];
        assert!(d.access_schema.is_passthrough());
        assert_eq!(d.params["value"], json!(3));
    }

    #[test]
    fn test_report_fulfilled() {
        let out = compile(
            json!({}),
            json!({
                "one": { "action": "reportFulfilled", "params": { "resource": { "value": { "k": 1 } } } },
                "many": { "action": "reportFulfilled", "params": { "resources": { "value": [1, 2] } } }
            }),
        );
        assert!(out.dependencies.is_empty());
        assert_eq!(out.fulfilled_resources.len(), 3);
        assert!(out.fulfilled_resources.contains(&json!({ "k": 1 })));
        assert!(out.fulfilled_resources.contains(&json!(2)));
    }

    #[test]
    fn test_registry_override_and_names() {
        let custom = BuilderRegistry::new().with("storeItem", |_, _| Ok(()));
        let merged = BuilderRegistry::builtin().merged(custom);
        assert!(merged.contains("recurse"));
        assert!(merged.names().contains(&"genericApi"));
        assert!(!merged.contains("missing"));
    }
}
