//! Per-invocation logging handle.
//!
//! A `TaskLog` is created once per task invocation and passed explicitly to
//! the resolver, compiler, and builders. It carries the invocation span (so
//! every event is attributed to the invocation that emitted it) and the
//! verbosity switch that gates trace/debug diagnostics.

use stagehand_types::invocation::InvocationMetadata;
use tracing::Span;

/// Environment variable enabling verbose trace/debug emission.
pub const DEBUG_ENV_VAR: &str = "STAGEHAND_DEBUG";

#[derive(Debug, Clone)]
pub struct TaskLog {
    span: Span,
    verbose: bool,
}

impl TaskLog {
    /// Create a log handle for one invocation.
    pub fn new(metadata: &InvocationMetadata, verbose: bool) -> Self {
        let span = tracing::info_span!(
            "task",
            function = metadata.function_name.as_str(),
            invocation_id = metadata.invocation_id.as_str(),
        );
        Self { span, verbose }
    }

    /// A handle not attached to any invocation. Used by standalone resolution
    /// (linting, tests).
    pub fn detached(verbose: bool) -> Self {
        Self {
            span: Span::none(),
            verbose,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Whether trace/debug diagnostics should be emitted.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Read the verbosity switch from `STAGEHAND_DEBUG`.
    pub fn verbose_from_env() -> bool {
        std::env::var(DEBUG_ENV_VAR)
            .map(|v| is_truthy_flag(&v))
            .unwrap_or(false)
    }
}

fn is_truthy_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
