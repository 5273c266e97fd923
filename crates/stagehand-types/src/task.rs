//! Task configuration: the user-authored description of stages, their
//! dependencies, expectations, and the cleanup transform.
//!
//! ```yaml
//! condition:
//!   helper: matches
//!   params: { a: { ref: event.kind }, b: { value: upload } }
//! overrides:
//!   MAX_RECURSION_DEPTH: 5
//! stages:
//!   gather:
//!     index: 0
//!     transformers:
//!       bucket: { ref: event.bucket }
//!     dependencies:
//!       listing:
//!         action: exploranda
//!         params:
//!           accessSchema: { value: s3.listObjects }
//!           params: { all: { Bucket: { ref: stage.bucket } } }
//! cleanup:
//!   transformers:
//!     keys: { ref: gather.results.listing }
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::expression::{Expression, ExpressionMap};

/// Default ceiling for self-recursion depth.
pub const DEFAULT_MAX_RECURSION_DEPTH: u64 = 3;

/// Default ceiling for cross-function bounce depth.
pub const DEFAULT_MAX_BOUNCE: u64 = 7;

/// Stage names reserved for context keys.
pub const RESERVED_STAGE_NAMES: [&str; 4] = ["event", "invocationMetadata", "config", "stage"];

/// Top-level task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Whole-task gate. Absent means unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expression>,
    #[serde(default)]
    pub overrides: Overrides,
    /// Resources this task must report as fulfilled before it succeeds.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub expectations: IndexMap<String, ExpectationSpec>,
    #[serde(default = "default_true")]
    pub error_on_unfulfilled_expectation: bool,
    #[serde(default)]
    pub cleanup: CleanupSpec,
    #[serde(default)]
    pub stages: IndexMap<String, StageSpec>,
    /// Legacy three-phase shape; see [`TaskConfig::normalize_legacy_phases`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<StageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<StageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outro: Option<StageSpec>,
}

fn default_true() -> bool {
    true
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            condition: None,
            overrides: Overrides::default(),
            expectations: IndexMap::new(),
            error_on_unfulfilled_expectation: true,
            cleanup: CleanupSpec::default(),
            stages: IndexMap::new(),
            intro: None,
            main: None,
            outro: None,
        }
    }
}

impl TaskConfig {
    /// Fold the legacy `intro`/`main`/`outro` phases into `stages`.
    ///
    /// Only applies when `stages` is empty. Present phases become stages in
    /// intro, main, outro order, each indexed by its position. Returns true
    /// if anything was moved.
    pub fn normalize_legacy_phases(&mut self) -> bool {
        if !self.stages.is_empty() {
            return false;
        }
        let phases = [
            ("intro", self.intro.take()),
            ("main", self.main.take()),
            ("outro", self.outro.take()),
        ];
        let mut moved = false;
        for (name, phase) in phases {
            if let Some(mut stage) = phase {
                stage.index.get_or_insert(self.stages.len() as u32);
                self.stages.insert(name.to_string(), stage);
                moved = true;
            }
        }
        moved
    }

    /// Whether any legacy phase is still present.
    pub fn has_legacy_phases(&self) -> bool {
        self.intro.is_some() || self.main.is_some() || self.outro.is_some()
    }
}

/// Tunable limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(
        rename = "MAX_RECURSION_DEPTH",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_recursion_depth: Option<u64>,
    #[serde(rename = "MAX_BOUNCE", default, skip_serializing_if = "Option::is_none")]
    pub max_bounce: Option<u64>,
    /// Other overrides, available to expressions via `config.overrides`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Overrides {
    pub fn recursion_ceiling(&self) -> u64 {
        self.max_recursion_depth.unwrap_or(DEFAULT_MAX_RECURSION_DEPTH)
    }

    pub fn bounce_ceiling(&self) -> u64 {
        self.max_bounce.unwrap_or(DEFAULT_MAX_BOUNCE)
    }
}

/// A resource some invocation is obliged to report as fulfilled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectationSpec {
    pub expected_resource: Value,
    /// Identity of the invocation that registered the expectation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_by: Option<Value>,
}

/// Final transform producing the task's return value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupSpec {
    #[serde(default)]
    pub transformers: ExpressionMap,
}

/// One named stage of the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpec {
    /// Explicit ordering key. Stages without one keep declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expression>,
    /// Stage variables, exposed as `stage.<name>` while the stage runs.
    #[serde(default)]
    pub transformers: ExpressionMap,
    #[serde(default)]
    pub dependencies: IndexMap<String, DependencySpec>,
    /// Applied to the stage's whole results record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatter: Option<Expression>,
}

/// A declared dependency inside a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    /// Name of the registered builder.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expression>,
    /// Compile and log the descriptors, but never execute them.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub params: ExpressionMap,
    /// Condenses this dependency's results into one value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatter: Option<Expression>,
}

impl DependencySpec {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            condition: None,
            dry_run: false,
            params: ExpressionMap::new(),
            formatter: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, expr: Expression) -> Self {
        self.params.insert(name.into(), expr);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config: TaskConfig = serde_json::from_value(json!({})).unwrap();
        assert!(config.condition.is_none());
        assert!(config.error_on_unfulfilled_expectation);
        assert_eq!(config.overrides.recursion_ceiling(), 3);
        assert_eq!(config.overrides.bounce_ceiling(), 7);
        assert!(config.stages.is_empty());
    }

    #[test]
    fn test_overrides_parse() {
        let config: TaskConfig = serde_json::from_value(json!({
            "overrides": { "MAX_RECURSION_DEPTH": 5, "MAX_BOUNCE": 2, "REGION": "us-east-1" }
        }))
        .unwrap();
        assert_eq!(config.overrides.recursion_ceiling(), 5);
        assert_eq!(config.overrides.bounce_ceiling(), 2);
        assert_eq!(config.overrides.extra["REGION"], json!("us-east-1"));
    }

    #[test]
    fn test_stage_order_is_preserved() {
        let config: TaskConfig = serde_json::from_value(json!({
            "stages": { "zeta": {}, "alpha": {}, "mid": {} }
        }))
        .unwrap();
        let names: Vec<&str> = config.stages.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_dependency_spec_parse() {
        let spec: DependencySpec = serde_json::from_value(json!({
            "action": "recurse",
            "dryRun": true,
            "params": { "b": { "value": 1 } }
        }))
        .unwrap();
        assert_eq!(spec.action, "recurse");
        assert!(spec.dry_run);
        assert_eq!(spec.params["b"], Expression::Literal(json!(1)));
    }

    #[test]
    fn test_bad_expression_fails_config_parse() {
        let result: Result<TaskConfig, _> = serde_json::from_value(json!({
            "condition": { "ref": "a", "value": true }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_legacy_phases_normalize() {
        let mut config: TaskConfig = serde_json::from_value(json!({
            "intro": { "transformers": { "a": { "value": 1 } } },
            "outro": {}
        }))
        .unwrap();
        assert!(config.has_legacy_phases());
        assert!(config.normalize_legacy_phases());
        assert!(!config.has_legacy_phases());
        assert_eq!(config.stages["intro"].index, Some(0));
        assert_eq!(config.stages["outro"].index, Some(1));
        assert!(!config.stages.contains_key("main"));
    }

    #[test]
    fn test_yaml_config_parse() {
        let yaml = r#"
expectations:
  fulfilled:
    expectedResource: { bucket: foo, key: bar }
errorOnUnfulfilledExpectation: false
stages:
  one:
    dependencies:
      item:
        action: storeItem
        params:
          value: { value: 3 }
"#;
        let config: TaskConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(!config.error_on_unfulfilled_expectation);
        assert_eq!(
            config.expectations["fulfilled"].expected_resource,
            json!({ "bucket": "foo", "key": "bar" })
        );
        assert_eq!(config.stages["one"].dependencies["item"].action, "storeItem");
    }
}
