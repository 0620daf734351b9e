//! # DAG Scheduler
//!
//! Drives a parsed document: validates inputs and dependencies, computes
//! topological generations, and runs each step through render, conditional
//! evaluation, cache lookup, execution, recording and status emission.
//!
//! Steps in one generation are independent by construction; this
//! implementation executes them serially to keep event ordering
//! deterministic. The run manifest is serialized on every exit path so
//! partial runs stay inspectable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{RunContext, StepState};
use crate::document::model::{Document, OutputsSpec, Step};
use crate::errors::{EngineError, Result};
use crate::events::{self, StatusEvent, StatusSink};
use crate::executor;
use crate::manifest::{RunManifest, RunStatus, StepRecord};
use crate::store::canonical_json;
use crate::strategies::fs::guess_mime;

/// A step failure carrying enough context for the error event and the
/// synthetic manifest record.
struct RunFailure {
    step_id: String,
    duration_ms: u64,
    error: EngineError,
}

/// Loads the document referenced by the context and executes it.
pub async fn run_path(
    ctx: &mut RunContext,
    no_cache: bool,
    sink: Option<Arc<dyn StatusSink>>,
) -> Result<Map<String, Value>> {
    let path = ctx.current_flow_path.clone().ok_or_else(|| {
        EngineError::Validation(
            "run context has no document path to execute".to_string(),
        )
    })?;
    info!(path = %path.display(), "engine.load_script");
    let document = crate::document::load(&path)?;
    apply_input_defaults(&document, &mut ctx.script_input)?;
    run_document(ctx, &document, no_cache, sink).await
}

/// Validates supplied inputs against the document's declared inputs: missing
/// required inputs fail, missing optional inputs acquire their defaults.
pub fn apply_input_defaults(document: &Document, inputs: &mut Map<String, Value>) -> Result<()> {
    for (name, spec) in &document.inputs {
        if inputs.contains_key(name) {
            continue;
        }
        if spec.required {
            return Err(EngineError::Validation(format!(
                "missing required input parameter: '{name}'"
            )));
        }
        if let Some(default) = &spec.default {
            debug!(param = %name, "engine.input.default_applied");
            inputs.insert(name.clone(), default.clone());
        }
    }
    Ok(())
}

/// Executes a pre-parsed document. Dispatch failures mark the manifest
/// `failed`, append a synthetic `error` record, surface an `error` entry in
/// the returned map, and the manifest is written regardless.
pub async fn run_document(
    ctx: &mut RunContext,
    document: &Document,
    no_cache: bool,
    sink: Option<Arc<dyn StatusSink>>,
) -> Result<Map<String, Value>> {
    // Graph validation happens before the run directory exists: a cyclic
    // document never produces a manifest.
    let generations = topological_generations(&document.steps)?;

    let run_id = format!("run_{}", &Uuid::new_v4().simple().to_string()[..12]);
    let mut manifest = RunManifest::new(
        &run_id,
        Some(document.name.clone()),
        ctx.script_input.clone(),
    );
    let mut final_results = Map::new();

    info!(run_id = %run_id, document = %document.name, no_cache, "engine.run.begin");

    let outcome = execute_generations(
        ctx,
        document,
        &generations,
        no_cache,
        &sink,
        &mut manifest,
        &mut final_results,
    )
    .await;

    match outcome {
        Ok(()) => {
            manifest.status = RunStatus::Completed;
            info!(run_id = %run_id, "engine.run.success");
        }
        Err(failure) => {
            error!(run_id = %run_id, step_id = %failure.step_id, error = %failure.error, "engine.run.failed");
            if let Some(sink) = &sink {
                sink.emit(StatusEvent::error(
                    &failure.step_id,
                    &failure.error.to_string(),
                    failure.duration_ms,
                ))
                .await;
            }
            manifest.status = RunStatus::Failed;
            manifest
                .steps
                .push(StepRecord::failed("error", &failure.error.to_string()));
            final_results.insert(
                "error".to_string(),
                Value::String(failure.error.to_string()),
            );
        }
    }

    // The manifest write is the run's `finally`: it happens on success and
    // failure alike.
    manifest.save(&ctx.services.settings.runs_dir())?;
    Ok(final_results)
}

#[allow(clippy::too_many_arguments)]
async fn execute_generations(
    ctx: &mut RunContext,
    document: &Document,
    generations: &[Vec<String>],
    no_cache: bool,
    sink: &Option<Arc<dyn StatusSink>>,
    manifest: &mut RunManifest,
    final_results: &mut Map<String, Value>,
) -> std::result::Result<(), RunFailure> {
    let step_map: HashMap<&str, &Step> = document
        .steps
        .iter()
        .map(|step| (step.id.as_str(), step))
        .collect();

    for generation in generations {
        for step_id in generation {
            let step = step_map[step_id.as_str()];
            let started = Instant::now();
            let fail = |error: EngineError, started: &Instant| RunFailure {
                step_id: step_id.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                error,
            };

            let render_context = assemble_render_context(ctx, document, step);

            // Conditional gate.
            if let Some(condition) = &step.condition {
                let expression = condition_expression(condition);
                let passed = ctx
                    .services
                    .renderer
                    .eval_bool(expression, &render_context)
                    .map_err(|err| {
                        fail(
                            EngineError::Validation(format!(
                                "failed to evaluate 'if' condition for step '{step_id}': {err}"
                            )),
                            &started,
                        )
                    })?;
                if !passed {
                    info!(step_id = %step_id, reason = "if_condition", "engine.step.skipped");
                    if let Some(sink) = sink {
                        sink.emit(StatusEvent::skipped(step_id, "Conditional returned false"))
                            .await;
                    }
                    manifest.steps.push(StepRecord::skipped(
                        step_id,
                        "Skipped: if_condition evaluated to false.",
                    ));
                    ctx.steps.insert(step_id.clone(), StepState::default());
                    final_results.insert(step_id.clone(), Value::Null);
                    continue;
                }
            }

            if let Some(sink) = sink {
                sink.emit(StatusEvent::running(step_id)).await;
            }

            // Render the raw step into a concrete one.
            let raw_step_value =
                serde_json::to_value(step).map_err(|err| fail(err.into(), &started))?;
            let rendered_value = ctx
                .services
                .renderer
                .render_value(&raw_step_value, &render_context)
                .map_err(|err| fail(err, &started))?;
            let rendered_step: Step =
                serde_json::from_value(rendered_value.clone()).map_err(|err| {
                    fail(
                        EngineError::Validation(format!(
                            "failed to render/validate step '{step_id}': {err}"
                        )),
                        &started,
                    )
                })?;

            // Cache key over the canonical rendered step plus sorted parent
            // output hashes.
            let cache_key = compute_cache_key(&rendered_value, step.dependencies(), ctx);
            let cached = if no_cache {
                None
            } else {
                ctx.services.cache_index.find_completed(&cache_key)
            };

            let (raw_result, record) = match cached {
                Some(mut record) => {
                    let result = match &record.output_hash {
                        Some(hash) => ctx
                            .services
                            .store
                            .read_json(hash)
                            .map_err(|err| fail(err, &started))?,
                        None => Value::Null,
                    };
                    record.cache_hit = true;
                    info!(step_id = %step_id, "engine.step.cache_hit");
                    (result, record)
                }
                None => {
                    let result = executor::execute_step(ctx, &rendered_step)
                        .await
                        .map_err(|err| fail(err, &started))?;
                    let output_hash = ctx
                        .services
                        .store
                        .write_json(&result)
                        .map_err(|err| fail(err, &started))?;
                    (
                        result,
                        StepRecord::completed(step_id, &cache_key, output_hash),
                    )
                }
            };

            let duration_ms = started.elapsed().as_millis() as u64;

            // A result carrying an `error` key is a failure, exactly like a
            // raised one.
            if let Some(message) = raw_result.get("error").and_then(Value::as_str) {
                return Err(fail(
                    EngineError::Io(format!("step '{step_id}' failed: {message}")),
                    &started,
                ));
            }

            if let Some(sink) = sink {
                let output = events::build_block_output(
                    &raw_result,
                    record.output_hash.as_deref(),
                    ctx.services.settings.inline_threshold_bytes,
                );
                sink.emit(StatusEvent::success(step_id, output, duration_ms))
                    .await;
            }

            let outputs = project_outputs(rendered_step.outputs.as_ref(), &raw_result);

            capture_artifacts(ctx, &raw_result, manifest);
            manifest.steps.push(record.clone());
            final_results.insert(step_id.clone(), raw_result.clone());
            ctx.steps.insert(
                step_id.clone(),
                StepState {
                    result: raw_result,
                    outputs,
                    output_hash: record.output_hash,
                },
            );

            debug!(step_id = %step_id, duration_ms, "engine.step.finished");
        }
    }

    Ok(())
}

/// `{page, inputs, steps, ...session variables, ...step context}`.
fn assemble_render_context(ctx: &RunContext, document: &Document, step: &Step) -> Value {
    let mut context = Map::new();
    context.insert("page".to_string(), document.as_context_value());
    context.insert(
        "inputs".to_string(),
        Value::Object(ctx.script_input.clone()),
    );
    context.insert("steps".to_string(), ctx.steps_value());
    for (key, value) in &ctx.session.variables {
        context.insert(key.clone(), value.clone());
    }
    if let Some(extra) = &step.context {
        for (key, value) in extra {
            context.insert(key.clone(), value.clone());
        }
    }
    Value::Object(context)
}

/// `if:` values may be bare expressions or wrapped in a single `{{ … }}`
/// block; both evaluate the same way.
fn condition_expression(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
        trimmed[2..trimmed.len() - 2].trim()
    } else {
        trimmed
    }
}

/// SHA-256 over the canonical rendered step definition and the sorted
/// `(parent id, parent output hash)` pairs.
fn compute_cache_key(rendered_step: &Value, dependencies: &[String], ctx: &RunContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(rendered_step).as_bytes());

    let mut parents: Vec<&String> = dependencies.iter().collect();
    parents.sort();
    for parent in parents {
        let hash = ctx
            .steps
            .get(parent)
            .and_then(|state| state.output_hash.as_deref())
            .unwrap_or("");
        hasher.update(format!("{parent}:{hash}").as_bytes());
    }
    format!("sha256:{:x}", hasher.finalize())
}

/// Applies the step's outputs specification against the raw result.
fn project_outputs(spec: Option<&OutputsSpec>, result: &Value) -> Map<String, Value> {
    let mut outputs = Map::new();
    match spec {
        None => {}
        Some(OutputsSpec::Names(names)) => {
            for name in names {
                outputs.insert(name.clone(), result.clone());
            }
        }
        Some(OutputsSpec::Projections(projections)) => {
            for (name, expression) in projections {
                let path = if expression.starts_with('$') {
                    expression.clone()
                } else {
                    format!("$.{expression}")
                };
                let value = match jsonpath_lib::select(result, &path) {
                    Ok(matches) => match matches.len() {
                        0 => Value::Null,
                        1 => matches[0].clone(),
                        _ => Value::Array(matches.into_iter().cloned().collect()),
                    },
                    Err(err) => {
                        warn!(output = %name, query = %expression, error = %err, "engine.outputs.projection_failed");
                        Value::Null
                    }
                };
                outputs.insert(name.clone(), value);
            }
        }
    }
    outputs
}

/// Hashes files listed under a result's `artifacts` mapping into the content
/// store and records them in the manifest. Unreadable entries are skipped
/// with a warning.
fn capture_artifacts(ctx: &RunContext, result: &Value, manifest: &mut RunManifest) {
    let Some(artifacts) = result.get("artifacts").and_then(Value::as_object) else {
        return;
    };
    for paths in artifacts.values() {
        let listed: Vec<&str> = match paths {
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            Value::String(single) => vec![single.as_str()],
            _ => continue,
        };
        for raw in listed {
            let path = std::path::PathBuf::from(raw.trim_start_matches("file://"));
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "engine.artifact.read_failed");
                    continue;
                }
            };
            let size_bytes = bytes.len() as u64;
            match ctx.services.store.write(&bytes) {
                Ok(content_hash) => {
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| raw.to_string());
                    manifest.artifacts.insert(
                        file_name,
                        crate::manifest::ArtifactRecord {
                            content_hash,
                            mime_type: guess_mime(&path),
                            size_bytes,
                        },
                    );
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "engine.artifact.store_failed");
                }
            }
        }
    }
}

/// Kahn-style peeling into generations. Rejects unknown dependencies and
/// names the cycle when one exists.
pub fn topological_generations(steps: &[Step]) -> Result<Vec<Vec<String>>> {
    let ids: HashSet<&str> = steps.iter().map(|step| step.id.as_str()).collect();

    let mut remaining: HashMap<&str, HashSet<&str>> = HashMap::new();
    for step in steps {
        let mut dependencies = HashSet::new();
        for dep in step.dependencies() {
            if !ids.contains(dep.as_str()) {
                return Err(EngineError::Validation(format!(
                    "step '{}' has an invalid dependency: '{dep}'",
                    step.id
                )));
            }
            dependencies.insert(dep.as_str());
        }
        remaining.insert(step.id.as_str(), dependencies);
    }

    let mut generations: Vec<Vec<String>> = Vec::new();
    let mut resolved: HashSet<&str> = HashSet::new();

    while !remaining.is_empty() {
        // Document order keeps generations deterministic.
        let mut ready: Vec<&str> = steps
            .iter()
            .map(|step| step.id.as_str())
            .filter(|id| {
                remaining
                    .get(id)
                    .map(|deps| deps.iter().all(|dep| resolved.contains(dep)))
                    .unwrap_or(false)
            })
            .collect();
        ready.dedup();

        if ready.is_empty() {
            let cycle = describe_cycle(&remaining);
            return Err(EngineError::Validation(format!(
                "workflow contains a circular dependency: {cycle}"
            )));
        }

        for id in &ready {
            remaining.remove(id);
            resolved.insert(id);
        }
        generations.push(ready.into_iter().map(String::from).collect());
    }

    Ok(generations)
}

/// Walks the unresolved subgraph until a node repeats, producing a readable
/// `a -> b -> a` chain.
fn describe_cycle(remaining: &HashMap<&str, HashSet<&str>>) -> String {
    let Some(start) = remaining.keys().min().copied() else {
        return "<empty>".to_string();
    };

    let mut chain: Vec<&str> = vec![start];
    let mut seen: HashSet<&str> = HashSet::from([start]);
    let mut current = start;

    loop {
        let next = remaining
            .get(current)
            .and_then(|deps| deps.iter().find(|dep| remaining.contains_key(*dep)))
            .copied();
        match next {
            Some(next) if seen.contains(next) => {
                chain.push(next);
                let loop_start = chain.iter().position(|id| *id == next).unwrap_or(0);
                return chain[loop_start..].join(" -> ");
            }
            Some(next) => {
                chain.push(next);
                seen.insert(next);
                current = next;
            }
            None => return chain.join(" -> "),
        }
    }
}
