//! Task configuration loading, validation, and linting.
//!
//! Configurations are YAML or JSON documents deserialized into
//! [`TaskConfig`]. Parsing validates structure and folds the legacy
//! `intro`/`main`/`outro` shape into ordered stages, so a returned config is
//! ready to run.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use stagehand_types::expression::{Expression, ExpressionMap};
use stagehand_types::task::{RESERVED_STAGE_NAMES, TaskConfig};

use crate::builders::BuilderRegistry;
use crate::expression::HelperRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// YAML/JSON parse failure, including malformed expressions.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported config format: '{0}' (expected .yaml, .yml, or .json)")]
    UnsupportedFormat(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse, validate, and normalize a YAML task configuration.
pub fn parse_task_yaml(yaml: &str) -> Result<TaskConfig, ConfigError> {
    let config: TaskConfig =
        serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    prepare(config)
}

/// Parse, validate, and normalize a JSON task configuration.
pub fn parse_task_json(json: &str) -> Result<TaskConfig, ConfigError> {
    let config: TaskConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
    prepare(config)
}

fn prepare(mut config: TaskConfig) -> Result<TaskConfig, ConfigError> {
    validate_task_config(&config)?;
    config.normalize_legacy_phases();
    Ok(config)
}

/// Load a task configuration, choosing the format by file extension.
pub fn load_task_file(path: &Path) -> Result<TaskConfig, ConfigError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let content = std::fs::read_to_string(path)?;
    match extension.as_str() {
        "yaml" | "yml" => parse_task_yaml(&content),
        "json" => parse_task_json(&content),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_name(kind: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Validation(format!("{kind} name must not be empty")));
    }
    if name.contains('.') {
        return Err(ConfigError::Validation(format!(
            "{kind} name '{name}' must not contain '.'"
        )));
    }
    Ok(())
}

/// Validate structural constraints on a `TaskConfig`.
///
/// Checks:
/// - Stage names are non-empty, dot-free, and not reserved context keys
/// - Dependency names are non-empty and dot-free; actions are non-empty
/// - Legacy phases are not mixed with `stages`
/// - Depth ceilings are > 0 if set
pub fn validate_task_config(config: &TaskConfig) -> Result<(), ConfigError> {
    if config.has_legacy_phases() && !config.stages.is_empty() {
        return Err(ConfigError::Validation(
            "intro/main/outro cannot be combined with stages".to_string(),
        ));
    }

    let legacy = [
        ("intro", config.intro.as_ref()),
        ("main", config.main.as_ref()),
        ("outro", config.outro.as_ref()),
    ];
    let stages = config
        .stages
        .iter()
        .map(|(name, stage)| (name.as_str(), stage))
        .chain(legacy.into_iter().filter_map(|(n, s)| s.map(|s| (n, s))));

    for (name, stage) in stages {
        check_name("stage", name)?;
        if RESERVED_STAGE_NAMES.contains(&name) {
            return Err(ConfigError::Validation(format!(
                "stage name '{name}' is reserved"
            )));
        }
        for (dep_name, dep) in &stage.dependencies {
            check_name("dependency", dep_name)?;
            if dep.action.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "dependency '{name}.{dep_name}' has an empty action"
                )));
            }
        }
    }

    if config.overrides.max_recursion_depth == Some(0) {
        return Err(ConfigError::Validation(
            "MAX_RECURSION_DEPTH must be > 0".to_string(),
        ));
    }
    if config.overrides.max_bounce == Some(0) {
        return Err(ConfigError::Validation("MAX_BOUNCE must be > 0".to_string()));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Linting
// ---------------------------------------------------------------------------

/// A non-fatal problem found by [`lint_task_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintWarning {
    /// Dotted location in the config, e.g. `stages.gather.dependencies.list`.
    pub location: String,
    pub message: String,
}

impl fmt::Display for LintWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

struct Linter<'a> {
    helpers: &'a HelperRegistry,
    builders: &'a BuilderRegistry,
    warnings: Vec<LintWarning>,
}

impl Linter<'_> {
    fn expression(&mut self, location: &str, expr: &Expression) {
        let mut reported = HashSet::new();
        for name in expr.helper_names() {
            if !self.helpers.contains(name) && reported.insert(name) {
                self.warnings.push(LintWarning {
                    location: location.to_string(),
                    message: format!("unknown helper '{name}'"),
                });
            }
        }
    }

    fn map(&mut self, location: &str, map: &ExpressionMap) {
        for (key, expr) in map {
            self.expression(&format!("{location}.{key}"), expr);
        }
    }
}

/// Report references to helpers and builders not present in the registries.
/// These resolve to nothing at run time rather than failing.
pub fn lint_task_config(
    config: &TaskConfig,
    helpers: &HelperRegistry,
    builders: &BuilderRegistry,
) -> Vec<LintWarning> {
    let mut linter = Linter {
        helpers,
        builders,
        warnings: Vec::new(),
    };

    if let Some(cond) = &config.condition {
        linter.expression("condition", cond);
    }
    for (stage_name, stage) in &config.stages {
        let base = format!("stages.{stage_name}");
        if let Some(cond) = &stage.condition {
            linter.expression(&format!("{base}.condition"), cond);
        }
        linter.map(&format!("{base}.transformers"), &stage.transformers);
        if let Some(formatter) = &stage.formatter {
            linter.expression(&format!("{base}.formatter"), formatter);
        }
        for (dep_name, dep) in &stage.dependencies {
            let dep_base = format!("{base}.dependencies.{dep_name}");
            if !linter.builders.contains(&dep.action) {
                linter.warnings.push(LintWarning {
                    location: dep_base.clone(),
                    message: format!("unknown builder '{}'", dep.action),
                });
            }
            if let Some(cond) = &dep.condition {
                linter.expression(&format!("{dep_base}.condition"), cond);
            }
            linter.map(&format!("{dep_base}.params"), &dep.params);
            if let Some(formatter) = &dep.formatter {
                linter.expression(&format!("{dep_base}.formatter"), formatter);
            }
        }
    }
    linter.map("cleanup.transformers", &config.cleanup.transformers);

    linter.warnings
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
