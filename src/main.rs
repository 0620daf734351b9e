//! cxflow — execution engine for declarative data workflows.
//!
//! Runs workflow documents (`.flow.yaml` flows and `.cx.md` contextual
//! pages): parses them into a step graph, executes the steps in dependency
//! order against connected services, memoizes results in a content-addressed
//! cache, and records every run in a manifest under `CX_HOME`.
//!
//! ```bash
//! cxflow run --file report.flow.yaml --input day=2026-08-01
//! cxflow validate --file report.flow.yaml
//! cxflow test-connection user:warehouse
//! ```

mod connections;
mod context;
mod document;
mod errors;
mod events;
mod executor;
mod manifest;
mod scheduler;
mod settings;
mod store;
mod strategies;
mod telemetry;
mod template;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{error, info, Level};

use context::{RunContext, ServiceRegistry};
use events::{StatusEvent, StatusSink};
use settings::Settings;
use strategies::ConnectorStrategy;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "cxflow")]
#[command(about = "Execution engine for declarative data workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Executes a workflow document.
    Run {
        /// Path to a `.flow.yaml` / `.flow.yml` / `.cx.md` document.
        #[arg(short, long)]
        file: PathBuf,

        /// Input parameters as `name=value`; values parse as JSON when they
        /// can, and fall back to plain strings.
        #[arg(short, long = "input", value_name = "NAME=VALUE")]
        inputs: Vec<String>,

        /// Bypasses cache lookups and forces re-execution of every step.
        #[arg(long, default_value = "false")]
        no_cache: bool,

        /// Writes the final results map to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only critical errors on stderr.
        #[arg(long, short = 's', default_value = "false")]
        silent: bool,

        /// Debug-level logs (step rendering, cache keys, dispatch).
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,

        /// Exports traces to an OpenTelemetry collector.
        #[arg(long, default_value = "false")]
        otel: bool,

        /// OTLP endpoint override (defaults to OTEL_EXPORTER_OTLP_ENDPOINT).
        #[arg(long)]
        otel_endpoint: Option<String>,
    },

    /// Parses a document and checks its step graph without executing.
    Validate {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Resolves a connection source and probes its credentials.
    TestConnection {
        /// Connection source, e.g. `user:warehouse`.
        source: String,
    },
}

/// Streams step lifecycle events to the structured log.
struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn emit(&self, event: StatusEvent) {
        match event.duration_ms {
            Some(duration_ms) => {
                info!(step_id = %event.step_id, phase = ?event.phase, duration_ms, "step.status")
            }
            None => info!(step_id = %event.step_id, phase = ?event.phase, "step.status"),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            inputs,
            no_cache,
            output,
            silent,
            verbose,
            otel,
            otel_endpoint,
        } => {
            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if silent {
                Level::ERROR
            } else if verbose {
                Level::DEBUG
            } else {
                Level::INFO
            };
            if otel {
                if let Some(endpoint) = otel_endpoint {
                    telemetry_config.otlp_endpoint = Some(endpoint);
                } else if telemetry_config.otlp_endpoint.is_none() {
                    telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
                }
            } else {
                telemetry_config.otlp_endpoint = None;
            }
            if let Err(err) = init_telemetry(telemetry_config) {
                eprintln!("Warning: failed to initialize telemetry: {err}");
            }

            let exit_code = run_document_command(file, inputs, no_cache, output, silent).await;
            shutdown_telemetry();
            std::process::exit(exit_code);
        }

        Commands::Validate { file } => {
            let _ = init_telemetry(TelemetryConfig::default());
            std::process::exit(validate_command(&file));
        }

        Commands::TestConnection { source } => {
            let _ = init_telemetry(TelemetryConfig::default());
            std::process::exit(test_connection_command(&source).await);
        }
    }
}

async fn run_document_command(
    file: PathBuf,
    inputs: Vec<String>,
    no_cache: bool,
    output: Option<PathBuf>,
    silent: bool,
) -> i32 {
    let script_input = match parse_inputs(&inputs) {
        Ok(map) => map,
        Err(message) => {
            error!(error = %message, "invalid --input argument");
            return 1;
        }
    };

    let services = Arc::new(ServiceRegistry::new(Settings::from_env()));
    let mut ctx = RunContext::new(services, Some(file.clone()));
    ctx.script_input = script_input;

    let sink: Option<Arc<dyn StatusSink>> = if silent {
        None
    } else {
        Some(Arc::new(LogSink))
    };

    let results = match scheduler::run_path(&mut ctx, no_cache, sink).await {
        Ok(results) => results,
        Err(err) => {
            error!(error = %err, path = %file.display(), "run failed before execution");
            return 1;
        }
    };

    let failed = results.contains_key("error");

    // Display applies the single-key envelope unwrap; persisted results and
    // the manifest keep the raw shape.
    let mut display = Map::new();
    for (step_id, value) in &results {
        display.insert(step_id.clone(), executor::unwrap_single_key(value.clone()));
    }
    let rendered = serde_json::to_string_pretty(&Value::Object(display))
        .unwrap_or_else(|_| "{}".to_string());

    if let Some(path) = output {
        if let Err(err) = std::fs::write(&path, &rendered) {
            error!(error = %err, path = %path.display(), "failed to write results");
            return 1;
        }
        if !silent {
            info!(path = %path.display(), "results written");
        }
    } else if !silent {
        println!("{rendered}");
    }

    if failed {
        1
    } else {
        0
    }
}

fn validate_command(file: &PathBuf) -> i32 {
    let document = match document::load(file) {
        Ok(document) => document,
        Err(err) => {
            error!(error = %err, path = %file.display(), "document is invalid");
            return 1;
        }
    };

    match scheduler::topological_generations(&document.steps) {
        Ok(generations) => {
            info!(
                document = %document.name,
                steps = document.steps.len(),
                executable = document.executable_ids().len(),
                generations = generations.len(),
                "document is valid"
            );
            0
        }
        Err(err) => {
            error!(error = %err, "document graph is invalid");
            1
        }
    }
}

async fn test_connection_command(source: &str) -> i32 {
    let services = ServiceRegistry::new(Settings::from_env());
    let (connection, secrets) = match services.resolver.resolve(source).await {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(error = %err, source = %source, "connection resolution failed");
            return 1;
        }
    };
    let strategy = match services.strategies.for_connection(&connection) {
        Ok(strategy) => strategy,
        Err(err) => {
            error!(error = %err, "no strategy for connection");
            return 1;
        }
    };

    match strategy.test_connection(&connection, &secrets).await {
        Ok(true) => {
            info!(connection = %connection.name, strategy = strategy.key(), "connection ok");
            0
        }
        Ok(false) | Err(_) => {
            error!(connection = %connection.name, "connection test failed");
            1
        }
    }
}

/// Parses `name=value` pairs; values that parse as JSON keep their native
/// type, everything else is a string.
fn parse_inputs(pairs: &[String]) -> Result<Map<String, Value>, String> {
    let mut inputs = Map::new();
    for pair in pairs {
        let (name, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("'{pair}' is not of the form name=value"))?;
        if name.trim().is_empty() {
            return Err(format!("'{pair}' has an empty input name"));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(name.trim().to_string(), value);
    }
    Ok(inputs)
}
