// Module: Context
// Per-run state and the service registry handed to every step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::connections::resolver::ConnectionResolver;
use crate::errors::{EngineError, Result};
use crate::manifest::CacheIndex;
use crate::settings::Settings;
use crate::store::ContentStore;
use crate::strategies::StrategyRegistry;
use crate::template::Renderer;

/// Collaborator contract for the `transform` engine. The transformer service
/// itself lives outside the engine.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn run(&self, script: Value, input: Option<Value>, context: &RunContext)
        -> Result<Value>;
}

/// Collaborator contract for the `cx-action` engine: evaluates a rendered
/// shell-language command line.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, command: &str, context: &RunContext) -> Result<Value>;
}

/// Session-scoped variables merged into every step's render context.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub variables: Map<String, Value>,
}

/// Dependency container shared by the scheduler, the executor and the
/// strategies. Built once per process; everything inside is stateless with
/// respect to run identity.
pub struct ServiceRegistry {
    pub settings: Settings,
    pub store: ContentStore,
    pub cache_index: CacheIndex,
    pub renderer: Renderer,
    pub resolver: ConnectionResolver,
    pub strategies: StrategyRegistry,
    pub transformer: Option<Arc<dyn Transformer>>,
    pub commands: Option<Arc<dyn CommandRunner>>,
}

impl ServiceRegistry {
    pub fn new(settings: Settings) -> Self {
        let store = ContentStore::new(settings.cache_dir());
        let cache_index = CacheIndex::new(settings.runs_dir(), settings.cache_scan_depth);
        let resolver = ConnectionResolver::new(settings.clone());
        let strategies = StrategyRegistry::new(&settings);
        Self {
            settings,
            store,
            cache_index,
            renderer: Renderer::new(),
            resolver,
            strategies,
            transformer: None,
            commands: None,
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn with_command_runner(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.commands = Some(commands);
        self
    }
}

/// State of one completed (or skipped) step, visible to later steps as
/// `steps.<id>`.
#[derive(Debug, Clone, Default)]
pub struct StepState {
    pub result: Value,
    pub outputs: Map<String, Value>,
    pub output_hash: Option<String>,
}

impl StepState {
    pub fn as_value(&self) -> Value {
        serde_json::json!({
            "result": self.result,
            "outputs": self.outputs,
            "output_hash": self.output_hash,
        })
    }
}

/// The in-memory container for all state of a single run.
pub struct RunContext {
    pub services: Arc<ServiceRegistry>,
    pub session: SessionState,
    /// User-supplied inputs, after defaults were applied.
    pub script_input: Map<String, Value>,
    pub piped_input: Option<Value>,
    /// The currently executing document, for relative path resolution.
    pub current_flow_path: Option<PathBuf>,
    /// Completed step states, keyed by step id.
    pub steps: BTreeMap<String, StepState>,
}

impl RunContext {
    pub fn new(services: Arc<ServiceRegistry>, flow_path: Option<PathBuf>) -> Self {
        Self {
            services,
            session: SessionState::default(),
            script_input: Map::new(),
            piped_input: None,
            current_flow_path: flow_path,
            steps: BTreeMap::new(),
        }
    }

    /// Derives a fresh context for a sub-flow run, sharing services and
    /// session variables but none of the step state.
    pub fn sub_context(&self, flow_path: PathBuf, inputs: Map<String, Value>) -> Self {
        Self {
            services: Arc::clone(&self.services),
            session: self.session.clone(),
            script_input: inputs,
            piped_input: self.piped_input.clone(),
            current_flow_path: Some(flow_path),
            steps: BTreeMap::new(),
        }
    }

    /// The live `steps` mapping as a JSON value for template contexts.
    pub fn steps_value(&self) -> Value {
        let mut map = Map::new();
        for (id, state) in &self.steps {
            map.insert(id.clone(), state.as_value());
        }
        Value::Object(map)
    }

    /// Resolves a path against the currently executing document.
    ///
    /// `file://` prefixes are stripped, `~` expands to the home directory,
    /// absolute paths pass through, and relative paths anchor at the
    /// document's directory (falling back to the working directory).
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let trimmed = raw.trim().trim_start_matches("file://");

        if let Some(rest) = trimmed.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }

        let path = Path::new(trimmed);
        if path.is_absolute() {
            return path.to_path_buf();
        }

        match self
            .current_flow_path
            .as_ref()
            .and_then(|p| p.parent())
        {
            Some(base) => base.join(path),
            None => path.to_path_buf(),
        }
    }

    /// Looks up `block_id.output_name` in the step map, the reference form
    /// used by engine-block `inputs`.
    pub fn lookup_block_output(&self, reference: &str) -> Result<Value> {
        let (block_id, output_name) = reference.split_once('.').ok_or_else(|| {
            EngineError::Value(format!(
                "input reference '{reference}' must have the form '<block_id>.<output_name>'"
            ))
        })?;
        let state = self.steps.get(block_id).ok_or_else(|| {
            EngineError::Value(format!("input reference '{reference}' names an unknown step"))
        })?;
        state.outputs.get(output_name).cloned().ok_or_else(|| {
            EngineError::Value(format!(
                "step '{block_id}' has no output named '{output_name}'"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<ServiceRegistry> {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::for_home(dir.path());
        // The tempdir may be dropped; path resolution below never touches it.
        Arc::new(ServiceRegistry::new(settings))
    }

    #[test]
    fn test_resolve_path_relative_to_document() {
        let mut ctx = RunContext::new(registry(), Some(PathBuf::from("/work/flows/job.flow.yaml")));
        assert_eq!(
            ctx.resolve_path("data/out.json"),
            PathBuf::from("/work/flows/data/out.json")
        );
        assert_eq!(
            ctx.resolve_path("file:///etc/hosts"),
            PathBuf::from("/etc/hosts")
        );

        ctx.current_flow_path = None;
        assert_eq!(ctx.resolve_path("out.json"), PathBuf::from("out.json"));
    }

    #[test]
    fn test_lookup_block_output() {
        let mut ctx = RunContext::new(registry(), None);
        let mut outputs = Map::new();
        outputs.insert("rows".to_string(), json!([{"n": 1}]));
        ctx.steps.insert(
            "fetch".to_string(),
            StepState {
                result: json!([{"n": 1}]),
                outputs,
                output_hash: Some("sha256:abc".to_string()),
            },
        );

        assert_eq!(
            ctx.lookup_block_output("fetch.rows").unwrap(),
            json!([{"n": 1}])
        );
        assert!(ctx.lookup_block_output("fetch.missing").is_err());
        assert!(ctx.lookup_block_output("ghost.rows").is_err());
        assert!(ctx.lookup_block_output("no-dot").is_err());
    }

    #[test]
    fn test_steps_value_shape() {
        let mut ctx = RunContext::new(registry(), None);
        ctx.steps.insert(
            "a".to_string(),
            StepState {
                result: json!(1),
                outputs: Map::new(),
                output_hash: None,
            },
        );
        let value = ctx.steps_value();
        assert_eq!(value["a"]["result"], json!(1));
        assert_eq!(value["a"]["output_hash"], json!(null));
    }

    #[test]
    fn test_sub_context_shares_session_not_steps() {
        let mut ctx = RunContext::new(registry(), None);
        ctx.session
            .variables
            .insert("env".to_string(), json!("prod"));
        ctx.steps.insert("a".to_string(), StepState::default());

        let sub = ctx.sub_context(PathBuf::from("/x/sub.flow.yaml"), Map::new());
        assert_eq!(sub.session.variables["env"], json!("prod"));
        assert!(sub.steps.is_empty());
    }
}
