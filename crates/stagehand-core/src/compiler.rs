//! Dependency graph compiler.
//!
//! For each dependency declared in a stage, the compiler gates it on its
//! condition, resolves its parameters, and hands them to the named builder.
//! Builders emit descriptors, resource references, and fulfilled-resource
//! markers through a [`BuildScope`], which qualifies every emitted name with
//! the owning dependency name so the stage graph stays collision-free.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use stagehand_types::dependency::{DependencyDescriptor, qualified_name};
use stagehand_types::expression::{Expression, ExpressionMap};
use stagehand_types::invocation::InvocationMetadata;
use stagehand_types::task::DependencySpec;

use crate::builders::{BuildError, BuilderRegistry};
use crate::depth::DepthGuards;
use crate::expression::Resolver;
use crate::log::TaskLog;

/// Qualified name -> descriptor, in deterministic order.
pub type DependencyGraph = BTreeMap<String, DependencyDescriptor>;

// ---------------------------------------------------------------------------
// CompiledStage
// ---------------------------------------------------------------------------

/// Everything compiled out of one stage's dependency declarations.
#[derive(Debug, Clone, Default)]
pub struct CompiledStage {
    /// Descriptors to execute.
    pub dependencies: DependencyGraph,
    /// Descriptors compiled from `dryRun` dependencies. Never executed.
    pub dry_run: DependencyGraph,
    pub resource_references: Map<String, Value>,
    pub fulfilled_resources: Vec<Value>,
    pub formatters: Vec<GroupFormatter>,
}

/// Condenses the results of one dependency group into a single value.
#[derive(Debug, Clone)]
pub struct GroupFormatter {
    /// Dependency name; the formatted value is stored under it.
    pub name: String,
    /// Qualified result keys this dependency produced.
    pub keys: Vec<String>,
    pub expression: Expression,
}

impl GroupFormatter {
    /// Replace this group's raw results with the formatted value.
    ///
    /// The formatter expression is resolved against an object holding only
    /// the group's results, keyed by qualified name.
    pub fn apply(&self, resolver: &Resolver, results: &mut Map<String, Value>) {
        let subset: Map<String, Value> = self
            .keys
            .iter()
            .filter_map(|k| results.remove(k).map(|v| (k.clone(), v)))
            .collect();
        let formatted = resolver.resolve(&self.expression, &Value::Object(subset));
        results.insert(self.name.clone(), formatted);
    }
}

// ---------------------------------------------------------------------------
// BuildScope
// ---------------------------------------------------------------------------

/// The callbacks and read-only context a builder works with.
pub struct BuildScope<'a> {
    dependency_name: &'a str,
    dry_run: bool,
    resolver: &'a Resolver,
    context: &'a Value,
    guards: &'a DepthGuards,
    compiled: &'a mut CompiledStage,
    emitted: Vec<String>,
}

impl<'a> BuildScope<'a> {
    pub fn dependency_name(&self) -> &str {
        self.dependency_name
    }

    /// Register a descriptor under `<dependency>_<local>` (or `<dependency>`
    /// when `local` is empty). Dry-run descriptors are logged and set aside.
    pub fn add_dependency(&mut self, local_name: &str, descriptor: DependencyDescriptor) {
        let name = qualified_name(self.dependency_name, local_name);
        if self.compiled.dependencies.contains_key(&name)
            || self.compiled.dry_run.contains_key(&name)
        {
            tracing::error!(
                parent: self.log().span(),
                dependency = self.dependency_name,
                qualified = name.as_str(),
                "duplicate qualified dependency name, keeping the first"
            );
            return;
        }
        if self.dry_run {
            let rendered = serde_json::to_value(&descriptor).unwrap_or(Value::Null);
            tracing::info!(
                parent: self.log().span(),
                qualified = name.as_str(),
                descriptor = %rendered,
                "dry run: dependency compiled but not executed"
            );
            self.compiled.dry_run.insert(name, descriptor);
        } else {
            self.compiled.dependencies.insert(name.clone(), descriptor);
            self.emitted.push(name);
        }
    }

    pub fn add_resource_reference(&mut self, local_name: &str, reference: Value) {
        let name = qualified_name(self.dependency_name, local_name);
        self.compiled.resource_references.insert(name, reference);
    }

    pub fn add_fulfilled_resource(&mut self, resource: Value) {
        self.compiled.fulfilled_resources.push(resource);
    }

    pub fn resolve(&self, expr: &Expression) -> Value {
        self.resolver.resolve(expr, self.context)
    }

    pub fn resolve_all(&self, map: &ExpressionMap) -> Map<String, Value> {
        self.resolver.resolve_all(map, self.context)
    }

    /// Parse `raw` as an expression and resolve it in the stage context.
    pub fn resolve_value(&self, raw: &Value) -> Result<Value, BuildError> {
        let expr = Expression::from_value(raw)
            .map_err(|e| BuildError::InvalidParams(e.to_string()))?;
        Ok(self.resolve(&expr))
    }

    pub fn context(&self) -> &Value {
        self.context
    }

    /// The inbound event, or `null` if the context has none.
    pub fn event(&self) -> &Value {
        self.context.get("event").unwrap_or(&Value::Null)
    }

    pub fn invocation_metadata(&self) -> Option<InvocationMetadata> {
        self.context
            .get("invocationMetadata")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn guards(&self) -> &DepthGuards {
        self.guards
    }

    pub fn log(&self) -> &TaskLog {
        self.resolver.log()
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Compiler {
    resolver: Resolver,
    builders: Arc<BuilderRegistry>,
    guards: DepthGuards,
}

impl Compiler {
    pub fn new(resolver: Resolver, builders: Arc<BuilderRegistry>, guards: DepthGuards) -> Self {
        Self {
            resolver,
            builders,
            guards,
        }
    }

    /// Compile a stage's dependency declarations against `context`.
    ///
    /// Never fails: unknown builders and builder errors are logged and the
    /// offending dependency contributes whatever it emitted before failing.
    pub fn compile(
        &self,
        stage: &str,
        context: &Value,
        specs: &IndexMap<String, DependencySpec>,
    ) -> CompiledStage {
        let mut compiled = CompiledStage::default();
        let log = self.resolver.log();

        for (name, spec) in specs {
            if !self.resolver.test(name, spec.condition.as_ref(), context) {
                if log.verbose() {
                    tracing::debug!(parent: log.span(), stage, dependency = name.as_str(), "dependency condition not met");
                }
                continue;
            }

            let params = self.resolver.resolve_all(&spec.params, context);

            let Some(builder) = self.builders.get(&spec.action) else {
                let err = BuildError::UnknownBuilder(spec.action.clone());
                tracing::error!(parent: log.span(), stage, dependency = name.as_str(), error = %err, "dependency skipped");
                continue;
            };

            let mut scope = BuildScope {
                dependency_name: name,
                dry_run: spec.dry_run,
                resolver: &self.resolver,
                context,
                guards: &self.guards,
                compiled: &mut compiled,
                emitted: Vec::new(),
            };

            if let Err(err) = builder(&params, &mut scope) {
                match &err {
                    BuildError::DepthExceeded(exceeded) => tracing::error!(
                        parent: log.span(),
                        stage,
                        dependency = name.as_str(),
                        field = exceeded.field,
                        attempted = exceeded.attempted,
                        ceiling = exceeded.ceiling,
                        "depth limit reached, dependency not emitted"
                    ),
                    other => tracing::error!(
                        parent: log.span(),
                        stage,
                        dependency = name.as_str(),
                        action = spec.action.as_str(),
                        error = %other,
                        "dependency builder failed"
                    ),
                }
            }

            let emitted = std::mem::take(&mut scope.emitted);
            if let Some(formatter) = &spec.formatter {
                compiled.formatters.push(GroupFormatter {
                    name: name.clone(),
                    keys: emitted,
                    expression: formatter.clone(),
                });
            }
        }

        if log.verbose() {
            tracing::debug!(
                parent: log.span(),
                stage,
                dependencies = compiled.dependencies.len(),
                dry_run = compiled.dry_run.len(),
                fulfilled = compiled.fulfilled_resources.len(),
                "stage compiled"
            );
        }
        compiled
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
