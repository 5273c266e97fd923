//! Stage pipeline executor.
//!
//! A `Task` runs a validated configuration for one invocation. Stages run
//! strictly in sequence: no stage begins before the previous stage's provider
//! call resolves.
//!
//! # Execution flow
//!
//! 1. Evaluate the task condition. If false, check expectations and return
//!    a skipped outcome.
//! 2. For each stage in order: evaluate its condition, resolve transformers
//!    into `stage`, compile dependencies, record fulfilled resources, resolve
//!    passthroughs locally, send the rest to the provider, format results,
//!    and store `{vars, resourceReferences, metrics, results}` under the
//!    stage name.
//! 3. Yield once, then resolve the cleanup transformers into the result.
//! 4. Check expectations.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stagehand_types::invocation::InvocationMetadata;
use stagehand_types::task::{StageSpec, TaskConfig};

use crate::builders::BuilderRegistry;
use crate::compiler::{Compiler, DependencyGraph};
use crate::config::{ConfigError, validate_task_config};
use crate::context::{StageOutput, TaskContext};
use crate::depth::DepthGuards;
use crate::expectation::ExpectationTracker;
use crate::expression::{HelperRegistry, Resolver};
use crate::log::TaskLog;
use crate::provider::{DataAccessProvider, ProviderError, RecordCollector};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal task failures. Everything else is logged and degrades the run.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("provider failed in stage '{stage}': {source}")]
    Provider {
        stage: String,
        #[source]
        source: ProviderError,
    },

    #[error("unfulfilled expectations: {}", .names.join(", "))]
    UnfulfilledExpectations { names: Vec<String> },
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    /// The task condition was false; no stage ran.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    NotStarted,
    Skipped,
    Running(usize),
    Cleanup,
    Done,
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPhase::NotStarted => write!(f, "not_started"),
            TaskPhase::Skipped => write!(f, "skipped"),
            TaskPhase::Running(i) => write!(f, "running({i})"),
            TaskPhase::Cleanup => write!(f, "cleanup"),
            TaskPhase::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub status: TaskStatus,
    /// Stages whose condition passed, in execution order.
    pub stages_executed: Vec<String>,
    /// The cleanup result.
    pub result: Value,
    /// Provider metrics keyed by stage name.
    pub metrics: Map<String, Value>,
    /// Expectations left outstanding when not configured to fail on them.
    pub unfulfilled: Vec<String>,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Caller-supplied extensions, merged over the built-ins once at
/// construction.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub helpers: HelperRegistry,
    pub builders: BuilderRegistry,
    pub collectors: Vec<Arc<dyn RecordCollector>>,
    /// Verbose trace/debug emission. `None` reads `STAGEHAND_DEBUG` per run.
    pub verbose: Option<bool>,
}

impl fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("helpers", &self.helpers)
            .field("builders", &self.builders)
            .field("collectors", &self.collectors.len())
            .field("verbose", &self.verbose)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stage ordering
// ---------------------------------------------------------------------------

/// Stage names in execution order: a stable sort on the declared `index`,
/// where a stage without one sorts at its declaration position.
pub fn stage_order(stages: &IndexMap<String, StageSpec>) -> Vec<String> {
    let mut keyed: Vec<(u64, &String)> = stages
        .iter()
        .enumerate()
        .map(|(position, (name, stage))| {
            let key = stage.index.map(u64::from).unwrap_or(position as u64);
            (key, name)
        })
        .collect();
    keyed.sort_by_key(|(key, _)| *key);
    keyed.into_iter().map(|(_, name)| name.clone()).collect()
}

/// A stage whose declared `index` differs from its declaration position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMismatch {
    pub stage: String,
    pub index: u32,
    pub position: usize,
}

pub fn index_mismatches(stages: &IndexMap<String, StageSpec>) -> Vec<IndexMismatch> {
    stages
        .iter()
        .enumerate()
        .filter_map(|(position, (name, stage))| match stage.index {
            Some(index) if index as usize != position => Some(IndexMismatch {
                stage: name.clone(),
                index,
                position,
            }),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub struct Task {
    config: TaskConfig,
    config_value: Value,
    order: Vec<String>,
    mismatches: Vec<IndexMismatch>,
    helpers: Arc<HelperRegistry>,
    builders: Arc<BuilderRegistry>,
    collectors: Vec<Arc<dyn RecordCollector>>,
    guards: DepthGuards,
    verbose: Option<bool>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("order", &self.order)
            .field("guards", &self.guards)
            .finish_non_exhaustive()
    }
}

/// Per-run state threaded through the stages.
struct Run<'a> {
    log: TaskLog,
    resolver: Resolver,
    compiler: Compiler,
    context: TaskContext,
    tracker: ExpectationTracker,
    phase: TaskPhase,
    metrics: Map<String, Value>,
    collectors: &'a [Arc<dyn RecordCollector>],
}

impl Run<'_> {
    fn transition(&mut self, next: TaskPhase) {
        tracing::debug!(
            parent: self.log.span(),
            from = %self.phase,
            to = %next,
            "task phase transition"
        );
        self.phase = next;
    }
}

impl Task {
    /// Validate `config` and prepare it for repeated runs.
    pub fn new(mut config: TaskConfig, options: TaskOptions) -> Result<Self, ConfigError> {
        validate_task_config(&config)?;
        config.normalize_legacy_phases();

        let config_value =
            serde_json::to_value(&config).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let order = stage_order(&config.stages);
        let mismatches = index_mismatches(&config.stages);
        let guards = DepthGuards::from_overrides(&config.overrides);

        Ok(Self {
            helpers: Arc::new(HelperRegistry::builtin().merged(options.helpers)),
            builders: Arc::new(BuilderRegistry::builtin().merged(options.builders)),
            collectors: options.collectors,
            verbose: options.verbose,
            config,
            config_value,
            order,
            mismatches,
            guards,
        })
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Stage names in the order they run.
    pub fn stage_order(&self) -> &[String] {
        &self.order
    }

    pub fn index_mismatches(&self) -> &[IndexMismatch] {
        &self.mismatches
    }

    pub fn helpers(&self) -> &HelperRegistry {
        &self.helpers
    }

    pub fn builders(&self) -> &BuilderRegistry {
        &self.builders
    }

    pub fn resolver(&self, log: TaskLog) -> Resolver {
        Resolver::new(self.helpers.clone(), log)
    }

    /// A compiler bound to the given log, for standalone compilation.
    pub fn compiler(&self, log: TaskLog) -> Compiler {
        Compiler::new(self.resolver(log), self.builders.clone(), self.guards)
    }

    /// A fresh context for one invocation.
    pub fn context(&self, event: Value, metadata: &InvocationMetadata) -> TaskContext {
        TaskContext::new(event, metadata, self.config_value.clone())
    }

    /// Run the task once. Returns exactly once, with the outcome or the
    /// fatal error.
    pub async fn run<P: DataAccessProvider>(
        &self,
        event: Value,
        metadata: InvocationMetadata,
        provider: &P,
    ) -> Result<TaskOutcome, TaskError> {
        let verbose = self.verbose.unwrap_or_else(TaskLog::verbose_from_env);
        let log = TaskLog::new(&metadata, verbose);
        let mut run = Run {
            resolver: self.resolver(log.clone()),
            compiler: self.compiler(log.clone()),
            context: self.context(event, &metadata),
            tracker: ExpectationTracker::from_config(&self.config),
            phase: TaskPhase::NotStarted,
            metrics: Map::new(),
            collectors: &self.collectors,
            log,
        };

        for mismatch in &self.mismatches {
            tracing::warn!(
                parent: run.log.span(),
                stage = mismatch.stage.as_str(),
                index = mismatch.index,
                position = mismatch.position,
                "stage index differs from declaration position"
            );
        }

        if !run
            .resolver
            .test("task", self.config.condition.as_ref(), run.context.value())
        {
            run.transition(TaskPhase::Skipped);
            tracing::info!(parent: run.log.span(), "task condition not met, skipping");
            run.tracker
                .check_complete(self.config.error_on_unfulfilled_expectation, &run.log)?;
            return Ok(TaskOutcome {
                status: TaskStatus::Skipped,
                stages_executed: Vec::new(),
                result: Value::Object(Map::new()),
                metrics: Map::new(),
                unfulfilled: run.tracker.unfulfilled(),
            });
        }

        let mut executed = Vec::new();
        for (i, name) in self.order.iter().enumerate() {
            run.transition(TaskPhase::Running(i));
            let Some(stage) = self.config.stages.get(name) else {
                continue;
            };
            if self.run_stage(&mut run, name, stage, provider).await? {
                executed.push(name.clone());
            }
        }

        tokio::task::yield_now().await;
        run.transition(TaskPhase::Cleanup);
        // Absent cleanup keys are logged.
        let result = Value::Object(
            run.resolver
                .resolve_all_required(&self.config.cleanup.transformers, run.context.value()),
        );

        run.tracker
            .check_complete(self.config.error_on_unfulfilled_expectation, &run.log)?;
        run.transition(TaskPhase::Done);
        tracing::info!(
            parent: run.log.span(),
            stages = executed.len(),
            "task completed"
        );

        Ok(TaskOutcome {
            status: TaskStatus::Completed,
            stages_executed: executed,
            result,
            metrics: run.metrics,
            unfulfilled: run.tracker.unfulfilled(),
        })
    }

    /// Returns whether the stage ran.
    async fn run_stage<P: DataAccessProvider>(
        &self,
        run: &mut Run<'_>,
        name: &str,
        stage: &StageSpec,
        provider: &P,
    ) -> Result<bool, TaskError> {
        if !run
            .resolver
            .test(name, stage.condition.as_ref(), run.context.value())
        {
            tracing::debug!(parent: run.log.span(), stage = name, "stage condition not met, skipping");
            return Ok(false);
        }

        let vars = run
            .resolver
            .resolve_all(&stage.transformers, run.context.value());
        run.context.set_stage_vars(vars.clone());

        let compiled = run
            .compiler
            .compile(name, run.context.value(), &stage.dependencies);

        let newly = run.tracker.mark_fulfilled(&compiled.fulfilled_resources);
        if !newly.is_empty() {
            tracing::info!(parent: run.log.span(), stage = name, fulfilled = ?newly, "expectations fulfilled");
        }

        let mut results = Map::new();
        let mut remote = DependencyGraph::new();
        for (key, descriptor) in &compiled.dependencies {
            if descriptor.access_schema.is_passthrough() {
                let value = descriptor.params.get("value").cloned().unwrap_or(Value::Null);
                results.insert(key.clone(), value);
            } else {
                remote.insert(key.clone(), descriptor.clone());
            }
        }

        let mut stage_metrics = Map::new();
        if !remote.is_empty() {
            let response = provider
                .resolve(name, &remote)
                .await
                .map_err(|source| TaskError::Provider {
                    stage: name.to_string(),
                    source,
                })?;
            results.extend(response.results);
            stage_metrics = response.metrics;
        }

        for collector in run.collectors {
            collector.collect(name, &compiled.dependencies, &results);
        }

        for formatter in &compiled.formatters {
            formatter.apply(&run.resolver, &mut results);
        }
        let results = match &stage.formatter {
            Some(formatter) => run.resolver.resolve(formatter, &Value::Object(results)),
            None => Value::Object(results),
        };

        run.context.clear_stage_vars();
        run.metrics
            .insert(name.to_string(), Value::Object(stage_metrics.clone()));
        run.context.set_stage_output(
            name,
            StageOutput {
                vars,
                resource_references: compiled.resource_references,
                metrics: stage_metrics,
                results,
            },
        );

        tracing::debug!(
            parent: run.log.span(),
            stage = name,
            requested = remote.len(),
            "stage completed"
        );
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
