//! Data model shared by both document formats.
//!
//! A `Step` carries exactly one execution body: either a `run` action record
//! (tagged by its `action` field) or an `engine` + `content` pair produced by
//! contextual pages. Markdown runs become inert `engine: markdown` steps that
//! are preserved for rendering order but never executed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Engine name for non-executable markdown steps.
pub const ENGINE_MARKDOWN: &str = "markdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Flow,
    Page,
}

/// A parsed workflow document: front matter plus the ordered step list.
#[derive(Debug, Clone)]
pub struct Document {
    pub kind: DocumentKind,
    pub name: String,
    pub description: Option<String>,
    pub inputs: BTreeMap<String, InputSpec>,
    pub steps: Vec<Step>,
}

impl Document {
    /// The document as a JSON value, exposed to templates as `page`.
    pub fn as_context_value(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputs": self.inputs,
            "steps": self.steps,
        })
    }

    /// Ids of steps that can actually execute (everything except markdown).
    pub fn executable_ids(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.is_markdown())
            .map(|s| s.id.as_str())
            .collect()
    }
}

/// Declared input parameter of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A uniquely identified unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Boolean expression gating execution.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    /// For engine blocks: `block_id.output_name` references selecting input
    /// data from prior steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<OutputsSpec>,
    /// Extra template variables merged into this step's render context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

impl Step {
    pub fn markdown(id: String, content: String) -> Self {
        Self {
            id,
            name: None,
            connection_source: None,
            run: None,
            engine: Some(ENGINE_MARKDOWN.to_string()),
            content: Some(content),
            condition: None,
            depends_on: None,
            inputs: None,
            outputs: None,
            context: None,
        }
    }

    pub fn is_markdown(&self) -> bool {
        self.engine.as_deref() == Some(ENGINE_MARKDOWN)
    }

    pub fn dependencies(&self) -> &[String] {
        self.depends_on.as_deref().unwrap_or_default()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Outputs specification: either names aliasing the whole result, or a
/// mapping of name to a path expression projected from the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputsSpec {
    Names(Vec<String>),
    Projections(BTreeMap<String, String>),
}

/// The closed set of `run` action kinds, tagged by the `action` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RunAction {
    DeclarativeAction {
        template_key: String,
        #[serde(default)]
        context: Map<String, Value>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        dry_run: bool,
    },
    SqlQuery {
        /// Inline SQL, or a path to a query file (`file:` prefix or `.sql`).
        query: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },
    PythonScript {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        script_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        script_content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_source: Option<String>,
    },
    ReadContent {
        path: String,
    },
    BrowsePath {
        path: String,
    },
    WriteFiles {
        files: Vec<FileToWrite>,
    },
    AggregateContent {
        paths: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_path: Option<String>,
    },
    RunFlow {
        flow_name: String,
        #[serde(default)]
        inputs: Map<String, Value>,
    },
}

impl RunAction {
    /// The wire tag of this action kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeclarativeAction { .. } => "declarative_action",
            Self::SqlQuery { .. } => "sql_query",
            Self::PythonScript { .. } => "python_script",
            Self::ReadContent { .. } => "read_content",
            Self::BrowsePath { .. } => "browse_path",
            Self::WriteFiles { .. } => "write_files",
            Self::AggregateContent { .. } => "aggregate_content",
            Self::RunFlow { .. } => "run_flow",
        }
    }

    /// Whether this action needs a resolved connection and strategy.
    pub fn requires_connection(&self) -> bool {
        !matches!(
            self,
            Self::PythonScript { .. }
                | Self::RunFlow { .. }
                | Self::WriteFiles { .. }
                | Self::AggregateContent { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileToWrite {
    pub path: String,
    pub content: String,
}
