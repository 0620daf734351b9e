//! # Step Executor
//!
//! The single dispatch site for a fully rendered step: engine blocks
//! (`markdown`, `artifact`, `transform`, `cx-action`, `ui-component`, `sql`)
//! first, then `run` actions via the closed action sum type. Connection and
//! strategy resolution happens here, once per step.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::connections::{Connection, SecretMap};
use crate::context::RunContext;
use crate::document::model::{FileToWrite, RunAction, Step};
use crate::errors::{EngineError, Result};
use crate::strategies::{ConnectorStrategy, PythonScriptRequest};

type Resolved = (Connection, SecretMap, Arc<dyn ConnectorStrategy>);

/// Executes one validated, rendered step and returns its raw result.
pub async fn execute_step(ctx: &RunContext, step: &Step) -> Result<Value> {
    if step.is_markdown() {
        debug!(step_id = %step.id, "executor.skipping_markdown_block");
        return Ok(Value::Null);
    }

    let resolved: Option<Resolved> = match &step.connection_source {
        Some(source) => {
            let (connection, secrets) = ctx.services.resolver.resolve(source).await?;
            let strategy = ctx.services.strategies.for_connection(&connection)?;
            Some((connection, secrets, strategy))
        }
        None => None,
    };

    if let Some(run) = &step.run {
        return dispatch_run(ctx, step, run, resolved).await;
    }
    if let Some(engine) = step.engine.clone() {
        return dispatch_engine(ctx, step, &engine, resolved).await;
    }

    Err(EngineError::Validation(format!(
        "step '{}' is invalid: it must have either an 'engine' or a 'run' block",
        step.id
    )))
}

async fn dispatch_run(
    ctx: &RunContext,
    step: &Step,
    action: &RunAction,
    resolved: Option<Resolved>,
) -> Result<Value> {
    debug!(step_id = %step.id, action = action.kind(), "executor.run_action");

    match action {
        RunAction::PythonScript {
            script_path,
            script_content,
            args,
            input_data,
            connection_source,
        } => {
            let python = ctx.services.strategies.get("python-sandboxed")?;
            let request = PythonScriptRequest {
                script_path: script_path.as_deref(),
                script_content: script_content.as_deref(),
                args,
                input_data: input_data.as_ref(),
                connection_source: connection_source.as_deref(),
            };
            python
                .run_python_script(resolved.as_ref().map(|(c, _, _)| c), request, ctx)
                .await
        }

        RunAction::RunFlow { flow_name, inputs } => run_sub_flow(ctx, flow_name, inputs).await,

        RunAction::WriteFiles { files } => {
            let fs = ctx.services.strategies.get("fs-declarative")?;
            fs.write_files(files, ctx).await
        }

        RunAction::AggregateContent { paths, output_path } => {
            let fs = ctx.services.strategies.get("fs-declarative")?;
            fs.aggregate_content(paths, output_path.as_deref(), ctx).await
        }

        connected => {
            let (connection, secrets, strategy) = resolved.ok_or_else(|| {
                EngineError::Validation(format!(
                    "step '{}' with action '{}' requires a 'connection_source'",
                    step.display_name(),
                    connected.kind()
                ))
            })?;

            match connected {
                RunAction::DeclarativeAction {
                    template_key,
                    context,
                    dry_run,
                } => {
                    strategy
                        .run_declarative_action(&connection, &secrets, template_key, context, *dry_run)
                        .await
                }
                RunAction::SqlQuery { query, parameters } => {
                    strategy
                        .run_sql_query(&connection, &secrets, query, parameters, ctx)
                        .await
                }
                RunAction::ReadContent { path } => {
                    let response = strategy
                        .get_content(std::slice::from_ref(path), &connection, &secrets)
                        .await?;
                    Ok(Value::String(response.content))
                }
                RunAction::BrowsePath { path } => {
                    let nodes = strategy
                        .browse_path(std::slice::from_ref(path), &connection, &secrets)
                        .await?;
                    Ok(serde_json::to_value(nodes)?)
                }
                // Handled by the outer arms.
                RunAction::PythonScript { .. }
                | RunAction::RunFlow { .. }
                | RunAction::WriteFiles { .. }
                | RunAction::AggregateContent { .. } => unreachable!(),
            }
        }
    }
}

async fn dispatch_engine(
    ctx: &RunContext,
    step: &Step,
    engine: &str,
    resolved: Option<Resolved>,
) -> Result<Value> {
    debug!(step_id = %step.id, engine = %engine, "executor.engine_block");

    match engine {
        "artifact" => run_artifact_block(ctx, step).await,
        "transform" => run_transform_block(ctx, step).await,
        "cx-action" => run_command_block(ctx, step).await,
        "ui-component" => run_ui_component_block(ctx, step),
        "sql" => {
            let (connection, secrets, strategy) = resolved.ok_or_else(|| {
                EngineError::Validation(format!(
                    "block '{}' with engine 'sql' requires a 'connection_source'",
                    step.id
                ))
            })?;
            let content = required_content(step)?;
            strategy
                .execute_query(content, &ctx.script_input, &connection, &secrets)
                .await
        }
        other => Err(EngineError::NotImplemented {
            strategy: format!("engine:{other}"),
            action: "execute".to_string(),
        }),
    }
}

/// `engine: artifact` serializes a prior step's output to JSON or CSV and
/// writes it through the filesystem strategy.
async fn run_artifact_block(ctx: &RunContext, step: &Step) -> Result<Value> {
    let reference = step
        .inputs
        .as_ref()
        .and_then(|inputs| inputs.first())
        .ok_or_else(|| {
            EngineError::Validation(
                "`engine: artifact` requires an `inputs` field selecting the data to save"
                    .to_string(),
            )
        })?;
    let data = ctx.lookup_block_output(reference)?;

    let operation: Value = serde_yaml::from_str(required_content(step)?)?;
    let format = operation
        .get("format")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            EngineError::Validation("artifact block requires 'format' in its content".to_string())
        })?;
    let target = operation
        .get("target_path")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            EngineError::Validation(
                "artifact block requires 'target_path' in its content".to_string(),
            )
        })?;

    let serialized = match format {
        "json" => serde_json::to_string_pretty(&data)?,
        "csv" => csv_from_value(&data)?,
        other => {
            return Err(EngineError::NotImplemented {
                strategy: "artifact".to_string(),
                action: format!("format '{other}'"),
            })
        }
    };

    let resolved_target = ctx.resolve_path(target);
    info!(target = %resolved_target.display(), format = %format, "artifact.writing");

    let fs = ctx.services.strategies.get("fs-declarative")?;
    fs.write_files(
        &[FileToWrite {
            path: resolved_target.to_string_lossy().to_string(),
            content: serialized,
        }],
        ctx,
    )
    .await
}

async fn run_transform_block(ctx: &RunContext, step: &Step) -> Result<Value> {
    let transformer = ctx.services.transformer.as_ref().ok_or_else(|| {
        EngineError::Value(format!(
            "block '{}' uses `engine: transform` but no transformer service is attached",
            step.id
        ))
    })?;
    let script: Value = serde_yaml::from_str(required_content(step)?)?;
    let input = match step.inputs.as_ref().and_then(|inputs| inputs.first()) {
        Some(reference) => Some(ctx.lookup_block_output(reference)?),
        None => None,
    };
    transformer.run(script, input, ctx).await
}

async fn run_command_block(ctx: &RunContext, step: &Step) -> Result<Value> {
    let commands = ctx.services.commands.as_ref().ok_or_else(|| {
        EngineError::Value(format!(
            "block '{}' uses `engine: cx-action` but no command runner is attached",
            step.id
        ))
    })?;
    let Some(template) = step.content.as_deref().filter(|c| !c.trim().is_empty()) else {
        return Ok(Value::Null);
    };

    let mut render_context = Map::new();
    render_context.insert("inputs".to_string(), Value::Object(ctx.script_input.clone()));
    render_context.insert("steps".to_string(), ctx.steps_value());
    for (key, value) in &ctx.session.variables {
        render_context.insert(key.clone(), value.clone());
    }
    let command = ctx
        .services
        .renderer
        .render_str(template, &Value::Object(render_context))?;
    info!(step_id = %step.id, command = %command, "executor.cx_action");
    commands.execute(&command, ctx).await
}

/// `engine: ui-component` renders embedded templates and returns the
/// structure verbatim; it has no side effects.
fn run_ui_component_block(ctx: &RunContext, step: &Step) -> Result<Value> {
    let definition: Value = serde_yaml::from_str(required_content(step)?)?;

    let mut render_context = Map::new();
    render_context.insert("steps".to_string(), ctx.steps_value());
    if let Some(inputs) = &step.inputs {
        for reference in inputs {
            if let Some((block_id, _)) = reference.split_once('.') {
                if let Some(state) = ctx.steps.get(block_id) {
                    for (name, value) in &state.outputs {
                        render_context.insert(name.clone(), value.clone());
                    }
                }
            }
        }
    }

    ctx.services
        .renderer
        .render_value(&definition, &Value::Object(render_context))
}

/// Dispatches a `run_flow` action by recursing into the scheduler with a
/// fresh sub-run context.
async fn run_sub_flow(
    ctx: &RunContext,
    flow_name: &str,
    inputs: &Map<String, Value>,
) -> Result<Value> {
    let path = find_flow(ctx, flow_name)?;
    info!(flow = %flow_name, path = %path.display(), "executor.run_flow");
    let mut sub_context = ctx.sub_context(path, inputs.clone());

    // Boxed to break the scheduler <-> executor future cycle.
    let results = std::pin::Pin::from(Box::new(crate::scheduler::run_path(
        &mut sub_context,
        false,
        None,
    ))
        as Box<dyn std::future::Future<Output = Result<Map<String, Value>>> + Send + '_>)
    .await?;
    Ok(Value::Object(results))
}

/// Locates a flow by name: next to the current document first, then the
/// shared flows directory.
fn find_flow(ctx: &RunContext, flow_name: &str) -> Result<std::path::PathBuf> {
    let mut candidates = Vec::new();
    let names = if flow_name.ends_with(".flow.yaml") || flow_name.ends_with(".flow.yml") {
        vec![flow_name.to_string()]
    } else {
        vec![
            format!("{flow_name}.flow.yaml"),
            format!("{flow_name}.flow.yml"),
        ]
    };

    if let Some(base) = ctx.current_flow_path.as_ref().and_then(|p| p.parent()) {
        for name in &names {
            candidates.push(base.join(name));
        }
    }
    for name in &names {
        candidates.push(ctx.services.settings.flows_dir().join(name));
    }

    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| EngineError::NotFound(format!("flow '{flow_name}' could not be located")))
}

fn required_content(step: &Step) -> Result<&str> {
    step.content.as_deref().ok_or_else(|| {
        EngineError::Validation(format!("block '{}' has no content", step.id))
    })
}

/// Serializes a list of mappings (or a single mapping) to CSV. Columns keep
/// their first-seen order across records.
fn csv_from_value(data: &Value) -> Result<String> {
    let rows: Vec<&Map<String, Value>> = match data {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_object().ok_or_else(|| {
                    EngineError::Value(
                        "csv serialization requires a list of mappings".to_string(),
                    )
                })
            })
            .collect::<Result<_>>()?,
        Value::Object(map) => vec![map],
        _ => {
            return Err(EngineError::Value(
                "csv serialization requires a list of mappings".to_string(),
            ))
        }
    };

    let mut columns: Vec<&str> = Vec::new();
    for row in &rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&columns)
        .map_err(|err| EngineError::Io(format!("csv write failed: {err}")))?;
    for row in &rows {
        let record: Vec<String> = columns
            .iter()
            .map(|column| match row.get(*column) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect();
        writer
            .write_record(&record)
            .map_err(|err| EngineError::Io(format!("csv write failed: {err}")))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| EngineError::Io(format!("csv write failed: {err}")))?;
    String::from_utf8(bytes).map_err(|err| EngineError::Io(format!("csv write failed: {err}")))
}

/// Unwraps a mapping with exactly one key (and no `error`) to its value.
///
/// Applied only at ad-hoc command boundaries, never to step results persisted
/// in the manifest.
pub fn unwrap_single_key(value: Value) -> Value {
    match &value {
        Value::Object(map) if map.len() == 1 && !map.contains_key("error") => {
            map.values().next().cloned().unwrap_or(Value::Null)
        }
        _ => value,
    }
}
