//! # Strategies
//!
//! Typed I/O adapters behind a uniform capability contract. A strategy is
//! addressed by the string key declared in a connection's blueprint
//! (`connector_provider_key`) and must be stateless with respect to run
//! identity: instances are shared across runs.
//!
//! Capabilities a strategy does not support fail with a typed
//! `NotImplemented` error, which the scheduler surfaces verbatim.

pub mod fetcher;
pub mod fs;
pub mod git;
pub mod oauth;
pub mod python;
pub mod rest;
pub mod sql;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connections::{ApiCatalog, Connection, SecretMap};
use crate::context::RunContext;
use crate::document::model::FileToWrite;
use crate::errors::{EngineError, Result};
use crate::settings::Settings;

/// One entry in a virtual directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VfsNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl VfsNode {
    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            node_type: "file".to_string(),
            metadata: None,
        }
    }

    pub fn directory(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            node_type: "directory".to_string(),
            metadata: None,
        }
    }
}

/// A virtual file read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VfsFileContent {
    pub path: String,
    pub content: String,
    pub mime_type: String,
    pub size: u64,
}

/// Borrowed view of a `python_script` action's fields.
#[derive(Debug, Clone, Copy)]
pub struct PythonScriptRequest<'a> {
    pub script_path: Option<&'a str>,
    pub script_content: Option<&'a str>,
    pub args: &'a [String],
    pub input_data: Option<&'a Value>,
    pub connection_source: Option<&'a str>,
}

/// The uniform capability contract.
///
/// `test_connection` is mandatory; everything else defaults to a typed
/// `NotImplemented` failure so each adapter implements exactly the
/// capabilities its service supports.
#[async_trait]
pub trait ConnectorStrategy: Send + Sync {
    fn key(&self) -> &'static str;

    /// Cheap credential validation.
    async fn test_connection(&self, connection: &Connection, secrets: &SecretMap) -> Result<bool>;

    /// Lists a virtual directory at an opaque path.
    async fn browse_path(
        &self,
        path_parts: &[String],
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<Vec<VfsNode>> {
        let _ = (path_parts, connection, secrets);
        Err(EngineError::not_implemented(self.key(), "browse_path"))
    }

    /// Reads a virtual file.
    async fn get_content(
        &self,
        path_parts: &[String],
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<VfsFileContent> {
        let _ = (path_parts, connection, secrets);
        Err(EngineError::not_implemented(self.key(), "get_content"))
    }

    /// Executes a blueprint-defined named action.
    async fn run_declarative_action(
        &self,
        connection: &Connection,
        secrets: &SecretMap,
        template_key: &str,
        input: &Map<String, Value>,
        dry_run: bool,
    ) -> Result<Value> {
        let _ = (connection, secrets, template_key, input, dry_run);
        Err(EngineError::not_implemented(self.key(), "run_declarative_action"))
    }

    /// Runs a SQL query action, loading a query file when `query` is a path
    /// and expanding list parameters into `IN (…)` placeholders.
    async fn run_sql_query(
        &self,
        connection: &Connection,
        secrets: &SecretMap,
        query: &str,
        parameters: &Map<String, Value>,
        context: &RunContext,
    ) -> Result<Value> {
        let _ = (connection, secrets, query, parameters, context);
        Err(EngineError::not_implemented(self.key(), "run_sql_query"))
    }

    /// Executes inline SQL text (the `sql` engine).
    async fn execute_query(
        &self,
        query: &str,
        parameters: &Map<String, Value>,
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<Value> {
        let _ = (query, parameters, connection, secrets);
        Err(EngineError::not_implemented(self.key(), "execute_query"))
    }

    /// Executes a Python script in the project sandbox.
    async fn run_python_script(
        &self,
        connection: Option<&Connection>,
        request: PythonScriptRequest<'_>,
        context: &RunContext,
    ) -> Result<Value> {
        let _ = (connection, request, context);
        Err(EngineError::not_implemented(self.key(), "run_python_script"))
    }

    /// Writes files to the local filesystem.
    async fn write_files(&self, files: &[FileToWrite], context: &RunContext) -> Result<Value> {
        let _ = (files, context);
        Err(EngineError::not_implemented(self.key(), "write_files"))
    }

    /// Bundles text content from a set of paths.
    async fn aggregate_content(
        &self,
        paths: &[String],
        output_path: Option<&str>,
        context: &RunContext,
    ) -> Result<Value> {
        let _ = (paths, output_path, context);
        Err(EngineError::not_implemented(self.key(), "aggregate_content"))
    }
}

/// Maps strategy keys to shared adapter instances.
pub struct StrategyRegistry {
    strategies: HashMap<&'static str, Arc<dyn ConnectorStrategy>>,
}

impl StrategyRegistry {
    pub fn new(settings: &Settings) -> Self {
        let rest = Arc::new(rest::RestStrategy::new(settings.http_timeout_secs));
        let fs = Arc::new(fs::FilesystemStrategy::new());

        let mut strategies: HashMap<&'static str, Arc<dyn ConnectorStrategy>> = HashMap::new();
        let mut register = |strategy: Arc<dyn ConnectorStrategy>| {
            strategies.insert(strategy.key(), strategy);
        };

        register(rest.clone());
        register(Arc::new(oauth::OauthStrategy::new(
            rest.clone(),
            settings.http_timeout_secs,
        )));
        register(Arc::new(git::GitStrategy::new(
            settings.git_dir(),
            rest.clone(),
        )));
        register(Arc::new(sql::SqlStrategy::new(sql::SqlDialect::Postgres)));
        register(Arc::new(sql::SqlStrategy::new(sql::SqlDialect::Mysql)));
        register(Arc::new(sql::SqlStrategy::new(sql::SqlDialect::Sqlite)));
        register(fs.clone());
        register(Arc::new(python::SandboxedPythonStrategy::new()));
        register(Arc::new(fetcher::SmartFetcherStrategy::new(rest, fs)));

        Self { strategies }
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn ConnectorStrategy>> {
        self.strategies.get(key).cloned().ok_or_else(|| {
            EngineError::NotFound(format!("no connector strategy registered for key '{key}'"))
        })
    }

    /// Resolves the strategy selected by a connection's blueprint.
    pub fn for_connection(&self, connection: &Connection) -> Result<Arc<dyn ConnectorStrategy>> {
        let catalog = connection.catalog().ok_or_else(|| {
            EngineError::Value(format!(
                "connection '{}' is missing its catalog/blueprint",
                connection.name
            ))
        })?;
        if catalog.connector_provider_key.is_empty() {
            return Err(EngineError::Value(format!(
                "blueprint for connection '{}' has no connector_provider_key",
                connection.name
            )));
        }
        self.get(&catalog.connector_provider_key)
    }

    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = self.strategies.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

/// Validates an instance against a named JSON Schema from the blueprint
/// package.
pub(crate) fn validate_against_schema(
    catalog: &ApiCatalog,
    schema_name: &str,
    instance: &Value,
    what: &str,
) -> Result<()> {
    let schema = catalog.schema(schema_name).ok_or_else(|| {
        EngineError::Value(format!(
            "blueprint does not define a schema named '{schema_name}'"
        ))
    })?;
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|err| EngineError::Value(format!("invalid schema '{schema_name}': {err}")))?;
    if let Err(errors) = compiled.validate(instance) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(EngineError::Value(format!(
            "invalid {what} for schema '{schema_name}': {}",
            messages.join("; ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_contains_required_strategies() {
        let settings = Settings::for_home("/tmp/cx-registry-test");
        let registry = StrategyRegistry::new(&settings);
        let keys = registry.keys();
        for expected in [
            "rest-declarative",
            "oauth2-declarative",
            "git-declarative",
            "sql-postgres",
            "sql-mysql",
            "sql-sqlite",
            "fs-declarative",
            "python-sandboxed",
            "internal-smart_fetcher",
        ] {
            assert!(keys.contains(&expected), "missing strategy {expected}");
        }
    }

    #[test]
    fn test_for_connection_dispatches_on_provider_key() {
        let settings = Settings::for_home("/tmp/cx-registry-test");
        let registry = StrategyRegistry::new(&settings);

        let connection = Connection::ephemeral("fs", ApiCatalog::with_provider("fs-declarative"));
        let strategy = registry.for_connection(&connection).unwrap();
        assert_eq!(strategy.key(), "fs-declarative");

        let missing = Connection {
            catalog: None,
            ..connection
        };
        assert!(matches!(
            registry.for_connection(&missing),
            Err(EngineError::Value(_))
        ));
    }

    #[test]
    fn test_unknown_strategy_key_is_not_found() {
        let settings = Settings::for_home("/tmp/cx-registry-test");
        let registry = StrategyRegistry::new(&settings);
        assert!(matches!(
            registry.get("sql-oracle"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_schema_validation() {
        let mut catalog = ApiCatalog::with_provider("rest-declarative");
        let mut schemas = Map::new();
        schemas.insert(
            "Message".to_string(),
            json!({
                "type": "object",
                "required": ["channel"],
                "properties": {"channel": {"type": "string"}}
            }),
        );
        catalog.schemas = Some(schemas);

        assert!(validate_against_schema(
            &catalog,
            "Message",
            &json!({"channel": "ops"}),
            "parameters"
        )
        .is_ok());

        let err = validate_against_schema(&catalog, "Message", &json!({}), "parameters")
            .unwrap_err();
        assert!(matches!(err, EngineError::Value(_)));

        assert!(validate_against_schema(&catalog, "Ghost", &json!({}), "parameters").is_err());
    }
}
