// Module: Document
// Loads workflow documents from their two on-disk formats (YAML flows and
// Markdown contextual pages) into one executable step list.

pub mod flow;
pub mod model;
pub mod page;

use std::path::Path;

use crate::errors::{EngineError, Result};
pub use model::{
    Document, DocumentKind, FileToWrite, InputSpec, OutputsSpec, RunAction, Step, ENGINE_MARKDOWN,
};

/// Loads a document, detecting the format from the file name.
///
/// `.cx.md` parses as a contextual page; `.flow.yaml` / `.flow.yml` parse as
/// a flow. Anything else is rejected.
pub fn load(path: &Path) -> Result<Document> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if name.ends_with(".cx.md") {
        page::parse_file(path)
    } else if name.ends_with(".flow.yaml") || name.ends_with(".flow.yml") {
        flow::parse_file(path)
    } else {
        Err(EngineError::Value(format!(
            "unsupported document type: '{name}' (expected .flow.yaml, .flow.yml or .cx.md)"
        )))
    }
}
