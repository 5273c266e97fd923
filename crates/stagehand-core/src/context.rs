//! Task execution context.
//!
//! `TaskContext` is the JSON object expressions resolve against. It holds the
//! inbound event, invocation metadata, the task configuration, every finished
//! stage's output keyed by stage name, and the running stage's variables
//! under `stage`. Stage outputs are stored whole, so a later stage can always
//! reach `<stage>.results.<key>`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use stagehand_types::invocation::InvocationMetadata;

const STAGE_KEY: &str = "stage";

/// What a finished stage contributes to the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutput {
    pub vars: Map<String, Value>,
    pub resource_references: Map<String, Value>,
    pub metrics: Map<String, Value>,
    pub results: Value,
}

impl StageOutput {
    fn into_value(self) -> Value {
        json!({
            "vars": self.vars,
            "resourceReferences": self.resource_references,
            "metrics": self.metrics,
            "results": self.results,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TaskContext {
    root: Value,
}

impl TaskContext {
    pub fn new(event: Value, metadata: &InvocationMetadata, config: Value) -> Self {
        let root = json!({
            "event": event,
            "invocationMetadata": metadata,
            "config": config,
        });
        Self { root }
    }

    /// The context as an expression root.
    pub fn value(&self) -> &Value {
        &self.root
    }

    pub fn event(&self) -> &Value {
        self.root.get("event").unwrap_or(&Value::Null)
    }

    fn insert(&mut self, key: &str, value: Value) {
        if let Value::Object(obj) = &mut self.root {
            obj.insert(key.to_string(), value);
        }
    }

    /// Expose the running stage's variables as `stage`.
    pub fn set_stage_vars(&mut self, vars: Map<String, Value>) {
        self.insert(STAGE_KEY, Value::Object(vars));
    }

    pub fn clear_stage_vars(&mut self) {
        if let Value::Object(obj) = &mut self.root {
            obj.remove(STAGE_KEY);
        }
    }

    /// Store a finished stage's output under its name.
    pub fn set_stage_output(&mut self, stage: &str, output: StageOutput) {
        self.insert(stage, output.into_value());
    }

    pub fn stage_output(&self, stage: &str) -> Option<&Value> {
        self.root.get(stage)
    }
}
