//! Task subcommands: validate, compile, run, builtins.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::{Value, json};

use stagehand_core::builders::BuilderRegistry;
use stagehand_core::compiler::CompiledStage;
use stagehand_core::config::{ConfigError, lint_task_config, load_task_file};
use stagehand_core::executor::{Task, TaskOptions, TaskStatus};
use stagehand_core::expression::HelperRegistry;
use stagehand_core::log::TaskLog;
use stagehand_core::provider::EchoProvider;
use stagehand_types::dependency::AccessSchema;
use stagehand_types::invocation::InvocationMetadata;
use stagehand_types::task::TaskConfig;

use super::InvocationArgs;

/// Longest parameter rendering shown in a table cell.
const PARAMS_PREVIEW_CHARS: usize = 80;

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

fn load(file: &Path) -> Result<TaskConfig> {
    tracing::debug!(file = %file.display(), "loading task file");
    load_task_file(file).map_err(|e| match e {
        ConfigError::Parse(msg) => anyhow::anyhow!("Failed to parse task file: {msg}"),
        ConfigError::Validation(msg) => anyhow::anyhow!("Task validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load task file '{}': {other}", file.display()),
    })
}

fn read_event(args: &InvocationArgs) -> Result<Value> {
    if let Some(raw) = &args.event {
        return serde_json::from_str(raw).with_context(|| "Invalid JSON event");
    }
    if let Some(path) = &args.event_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file '{}'", path.display()))?;
        return serde_json::from_str(&content).with_context(|| "Invalid JSON in event file");
    }
    Ok(json!({}))
}

fn metadata(args: &InvocationArgs) -> InvocationMetadata {
    let invocation_id = args
        .invocation_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
    InvocationMetadata::new(args.function_name.clone(), invocation_id)
}

fn schema_label(schema: &AccessSchema) -> String {
    match schema {
        AccessSchema::ByName(name) => name.clone(),
        AccessSchema::Literal(value) => format!("literal {value}"),
        AccessSchema::Passthrough => "passthrough".to_string(),
    }
}

fn preview(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() > PARAMS_PREVIEW_CHARS {
        let cut: String = rendered.chars().take(PARAMS_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        rendered
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let config = load(file)?;
    let warnings = lint_task_config(
        &config,
        &HelperRegistry::builtin(),
        &BuilderRegistry::builtin(),
    );

    if json {
        let out = json!({
            "file": file.display().to_string(),
            "valid": true,
            "stages": config.stages.keys().collect::<Vec<_>>(),
            "warnings": warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' is valid ({} stages)",
        style("*").green().bold(),
        style(file.display()).cyan(),
        config.stages.len()
    );
    if warnings.is_empty() {
        println!("  No warnings.");
    } else {
        println!();
        for warning in &warnings {
            println!("  {} {}", style("!").yellow().bold(), warning);
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Compile
// ---------------------------------------------------------------------------

pub fn handle_compile(
    file: &Path,
    only_stage: Option<&str>,
    invocation: &InvocationArgs,
    verbose: Option<bool>,
    json: bool,
) -> Result<()> {
    let config = load(file)?;
    let task = Task::new(
        config,
        TaskOptions {
            verbose,
            ..TaskOptions::default()
        },
    )?;

    if let Some(name) = only_stage {
        if !task.config().stages.contains_key(name) {
            anyhow::bail!("Stage '{name}' not found");
        }
    }

    let metadata = metadata(invocation);
    let log = TaskLog::new(&metadata, verbose.unwrap_or_else(TaskLog::verbose_from_env));
    let resolver = task.resolver(log.clone());
    let compiler = task.compiler(log);
    let mut context = task.context(read_event(invocation)?, &metadata);

    let mut compiled: Vec<(String, CompiledStage)> = Vec::new();
    for name in task.stage_order() {
        if only_stage.is_some_and(|s| s != name) {
            continue;
        }
        let Some(stage) = task.config().stages.get(name) else {
            continue;
        };
        let vars = resolver.resolve_all(&stage.transformers, context.value());
        context.set_stage_vars(vars);
        compiled.push((
            name.clone(),
            compiler.compile(name, context.value(), &stage.dependencies),
        ));
        context.clear_stage_vars();
    }

    if json {
        let stages: serde_json::Map<String, Value> = compiled
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    json!({
                        "dependencies": c.dependencies,
                        "dryRun": c.dry_run,
                        "resourceReferences": c.resource_references,
                        "fulfilledResources": c.fulfilled_resources,
                    }),
                )
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&Value::Object(stages))?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Dependency"),
            Cell::new("Schema"),
            Cell::new("Params"),
        ]);

    let mut rows = 0;
    for (stage, c) in &compiled {
        for (name, descriptor) in &c.dependencies {
            table.add_row(vec![
                Cell::new(stage),
                Cell::new(name),
                Cell::new(schema_label(&descriptor.access_schema)),
                Cell::new(preview(&Value::Object(descriptor.params.clone()))),
            ]);
            rows += 1;
        }
        for (name, descriptor) in &c.dry_run {
            table.add_row(vec![
                Cell::new(stage),
                Cell::new(format!("{name} (dry run)")).fg(Color::DarkGrey),
                Cell::new(schema_label(&descriptor.access_schema)).fg(Color::DarkGrey),
                Cell::new(preview(&Value::Object(descriptor.params.clone()))).fg(Color::DarkGrey),
            ]);
            rows += 1;
        }
    }

    println!();
    if rows == 0 {
        println!("  No dependencies compiled.");
    } else {
        println!("{table}");
    }
    println!(
        "  {}",
        style("Later stages compile without earlier results; references to them resolve to null.")
            .dim()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    file: &Path,
    invocation: &InvocationArgs,
    verbose: Option<bool>,
    json: bool,
) -> Result<()> {
    let config = load(file)?;
    let task = Task::new(
        config,
        TaskOptions {
            verbose,
            ..TaskOptions::default()
        },
    )?;

    let metadata = metadata(invocation);
    tracing::info!(
        file = %file.display(),
        function_name = %metadata.function_name,
        invocation_id = %metadata.invocation_id,
        "running task"
    );
    let outcome = task
        .run(read_event(invocation)?, metadata, &EchoProvider)
        .await
        .with_context(|| format!("Task '{}' failed", file.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!();
    match outcome.status {
        TaskStatus::Completed => println!(
            "  {} Completed {} stage(s): {}",
            style("*").green().bold(),
            outcome.stages_executed.len(),
            outcome.stages_executed.join(", ")
        ),
        TaskStatus::Skipped => println!(
            "  {} Skipped: task condition not met",
            style("-").yellow().bold()
        ),
    }
    if !outcome.unfulfilled.is_empty() {
        println!(
            "  {} Unfulfilled expectations: {}",
            style("!").yellow().bold(),
            outcome.unfulfilled.join(", ")
        );
    }
    println!();
    println!("  Result:");
    for line in serde_json::to_string_pretty(&outcome.result)?.lines() {
        println!("    {line}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

pub fn handle_builtins(json: bool) -> Result<()> {
    let helpers = HelperRegistry::builtin();
    let builders = BuilderRegistry::builtin();

    if json {
        let out = json!({ "helpers": helpers.names(), "builders": builders.names() });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {}", style("Helpers").bold());
    for name in helpers.names() {
        println!("    {name}");
    }
    println!();
    println!("  {}", style("Builders").bold());
    for name in builders.names() {
        println!("    {name}");
    }
    println!();
    Ok(())
}
