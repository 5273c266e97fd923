//! Expression resolution: the value resolver, parameter-set resolver, and
//! condition evaluator.
//!
//! Resolution never fails. Anomalies (unknown helpers, helper failures,
//! missing required values) are logged at error level through the task log
//! and resolve to `null`, so a single bad expression degrades a run instead
//! of aborting it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use stagehand_types::expression::{Expression, ExpressionMap};

use crate::helpers::HelperError;
use crate::log::TaskLog;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Recoverable anomalies raised during resolution.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("unknown helper: '{0}'")]
    UnknownHelper(String),

    #[error("helper '{name}' failed: {source}")]
    HelperFailed {
        name: String,
        #[source]
        source: HelperError,
    },

    #[error("required value '{0}' resolved to nothing")]
    MissingValue(String),
}

// ---------------------------------------------------------------------------
// Value utilities
// ---------------------------------------------------------------------------

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Dotted-path lookup. Numeric segments index into arrays.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(obj) => obj.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Helper registry
// ---------------------------------------------------------------------------

/// Signature of a helper: resolved parameters plus a handle for further
/// resolution against the calling context.
pub type HelperFn =
    dyn Fn(&Map<String, Value>, &HelperCall<'_>) -> Result<Value, HelperError> + Send + Sync;

/// Name-keyed helper table. Built once per task, then shared read-only.
#[derive(Clone, Default)]
pub struct HelperRegistry {
    helpers: HashMap<String, Arc<HelperFn>>,
}

impl HelperRegistry {
    /// An empty registry, for caller-supplied helpers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a helper, replacing any existing one with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, helper: F) -> &mut Self
    where
        F: Fn(&Map<String, Value>, &HelperCall<'_>) -> Result<Value, HelperError>
            + Send
            + Sync
            + 'static,
    {
        self.helpers.insert(name.into(), Arc::new(helper));
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, helper: F) -> Self
    where
        F: Fn(&Map<String, Value>, &HelperCall<'_>) -> Result<Value, HelperError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, helper);
        self
    }

    /// Overlay `other` on top of this registry. Entries in `other` win.
    pub fn merged(mut self, other: HelperRegistry) -> Self {
        self.helpers.extend(other.helpers);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<HelperFn>> {
        self.helpers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.helpers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperRegistry")
            .field("helpers", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Evaluates expressions against a JSON context.
///
/// Holds no mutable state: resolving the same expression against the same
/// context twice yields the same value, unless a helper is itself
/// non-deterministic (`uuid`, `msTimestamp`).
#[derive(Debug, Clone)]
pub struct Resolver {
    helpers: Arc<HelperRegistry>,
    log: TaskLog,
}

impl Resolver {
    pub fn new(helpers: Arc<HelperRegistry>, log: TaskLog) -> Self {
        Self { helpers, log }
    }

    pub fn log(&self) -> &TaskLog {
        &self.log
    }

    pub fn helpers(&self) -> &HelperRegistry {
        &self.helpers
    }

    /// Resolve one expression. Absent references resolve to `null`.
    pub fn resolve(&self, expr: &Expression, context: &Value) -> Value {
        match expr {
            Expression::Literal(v) => v.clone(),
            Expression::Ref(path) => lookup_path(context, path).cloned().unwrap_or(Value::Null),
            Expression::Every(map) => Value::Bool(
                map.values()
                    .all(|e| is_truthy(&self.resolve(e, context))),
            ),
            Expression::Some(map) => Value::Bool(
                map.values()
                    .any(|e| is_truthy(&self.resolve(e, context))),
            ),
            Expression::Not(inner) => Value::Bool(!is_truthy(&self.resolve(inner, context))),
            Expression::Or(list) => list
                .iter()
                .map(|e| self.resolve(e, context))
                .find(|v| !v.is_null())
                .unwrap_or(Value::Null),
            Expression::All(map) => Value::Object(self.resolve_all(map, context)),
            Expression::Helper { name, params } => {
                match self.call_helper(name, params, context) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!(parent: self.log.span(), helper = name.as_str(), error = %e, "expression resolution failed");
                        Value::Null
                    }
                }
            }
        }
    }

    /// Resolve every entry of a parameter set into a flat record.
    pub fn resolve_all(&self, map: &ExpressionMap, context: &Value) -> Map<String, Value> {
        map.iter()
            .map(|(name, expr)| {
                let value = self.resolve(expr, context);
                if self.log.verbose() {
                    tracing::trace!(
                        parent: self.log.span(),
                        name = name.as_str(),
                        expression = %expr.to_value(),
                        value = %value,
                        "resolved parameter"
                    );
                }
                (name.clone(), value)
            })
            .collect()
    }

    /// Like [`resolve_all`](Self::resolve_all), logging one error per key that
    /// resolved to nothing. The partial record is still returned.
    pub fn resolve_all_required(
        &self,
        map: &ExpressionMap,
        context: &Value,
    ) -> Map<String, Value> {
        let resolved = self.resolve_all(map, context);
        for (name, value) in &resolved {
            if value.is_null() {
                self.report_missing(name, &map[name]);
            }
        }
        resolved
    }

    /// Condition gate. An absent condition always passes.
    pub fn test(&self, name: &str, condition: Option<&Expression>, context: &Value) -> bool {
        let Some(condition) = condition else {
            return true;
        };
        let passed = is_truthy(&self.resolve(condition, context));
        if self.log.verbose() {
            tracing::debug!(parent: self.log.span(), gate = name, passed, "condition evaluated");
        }
        passed
    }

    fn call_helper(
        &self,
        name: &str,
        params: &ExpressionMap,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        let helper = self
            .helpers
            .get(name)
            .ok_or_else(|| ExpressionError::UnknownHelper(name.to_string()))?;
        let resolved = self.resolve_all(params, context);
        let call = HelperCall {
            resolver: self,
            context,
        };
        helper(&resolved, &call).map_err(|source| ExpressionError::HelperFailed {
            name: name.to_string(),
            source,
        })
    }

    fn report_missing(&self, name: &str, expr: &Expression) {
        let err = ExpressionError::MissingValue(name.to_string());
        tracing::error!(
            parent: self.log.span(),
            expression = %expr.to_value(),
            error = %err,
            "required value missing"
        );
    }
}

// ---------------------------------------------------------------------------
// HelperCall
// ---------------------------------------------------------------------------

/// Handle given to helpers for recursive resolution against the calling
/// context.
pub struct HelperCall<'a> {
    resolver: &'a Resolver,
    context: &'a Value,
}

impl<'a> HelperCall<'a> {
    pub fn context(&self) -> &Value {
        self.context
    }

    pub fn resolve(&self, expr: &Expression) -> Value {
        self.resolver.resolve(expr, self.context)
    }

    /// Parse `raw` as an expression and resolve it.
    pub fn resolve_value(&self, raw: &Value) -> Result<Value, HelperError> {
        let expr = Expression::from_value(raw).map_err(HelperError::from)?;
        Ok(self.resolve(&expr))
    }

    /// Parse `raw` as an expression and resolve it against the calling
    /// context extended with `bindings`.
    pub fn resolve_with(
        &self,
        raw: &Value,
        bindings: Map<String, Value>,
    ) -> Result<Value, HelperError> {
        let expr = Expression::from_value(raw).map_err(HelperError::from)?;
        let mut scoped = match self.context {
            Value::Object(obj) => obj.clone(),
            _ => Map::new(),
        };
        scoped.extend(bindings);
        Ok(self.resolver.resolve(&expr, &Value::Object(scoped)))
    }

    /// Invoke another registered helper with already-resolved parameters.
    pub fn call(&self, name: &str, params: &Map<String, Value>) -> Result<Value, HelperError> {
        let helper = self
            .resolver
            .helpers
            .get(name)
            .ok_or_else(|| HelperError::UnknownHelper(name.to_string()))?;
        helper(params, self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
