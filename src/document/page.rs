//! Contextual page format (`.cx.md`).
//!
//! A page is Markdown with optional YAML front matter. Parsing happens in two
//! passes:
//!
//! 1. Split the body into a stream alternating markdown runs and fenced code
//!    blocks.
//! 2. Walk the stream. A YAML fence containing a top-level `cx_block: true`
//!    key is a metadata block and pairs with the immediately following code
//!    block: the metadata supplies the step fields, the paired fence supplies
//!    `content` (or, for the `run` engine, the YAML action payload). Unpaired
//!    metadata and ordinary fences degrade to markdown.
//!
//! Markdown runs become synthetic `md_N` steps that are never executed but
//! preserve rendering order.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::document::model::{Document, DocumentKind, InputSpec, Step};
use crate::errors::{EngineError, Result};

static FENCED_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(\w*)\n(.*?)\n```").expect("valid fence regex"));

static FRONT_MATTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A\s*---(.*?)---").expect("valid front matter regex"));

pub fn parse_file(path: &Path) -> Result<Document> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        EngineError::NotFound(format!("could not read page '{}': {err}", path.display()))
    })?;
    parse_str(&raw)
}

pub fn parse_str(raw: &str) -> Result<Document> {
    let (front_matter, body) = split_front_matter(raw)?;
    let steps = parse_blocks(body)?;

    let name = front_matter
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            EngineError::Validation("page front matter is missing a 'name' field".to_string())
        })?
        .to_string();
    let description = front_matter
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);
    let inputs: BTreeMap<String, InputSpec> = match front_matter.get("inputs") {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| EngineError::Validation(format!("invalid page inputs: {err}")))?,
        None => BTreeMap::new(),
    };

    Ok(Document {
        kind: DocumentKind::Page,
        name,
        description,
        inputs,
        steps,
    })
}

fn split_front_matter(raw: &str) -> Result<(Map<String, Value>, &str)> {
    if let Some(captures) = FRONT_MATTER_RE.captures(raw) {
        let yaml = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let end = captures.get(0).map(|m| m.end()).unwrap_or(0);
        let parsed: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|err| EngineError::Validation(format!("invalid page front matter: {err}")))?;
        let json = yaml_to_json(parsed)?;
        let map = match json {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(EngineError::Validation(
                    "page front matter must be a mapping".to_string(),
                ))
            }
        };
        Ok((map, raw[end..].trim_start_matches(['\n', '\r'])))
    } else {
        Ok((Map::new(), raw))
    }
}

enum Part<'a> {
    Markdown(&'a str),
    CodeBlock { full: &'a str, lang: String, inner: &'a str },
}

fn split_parts(content: &str) -> Vec<Part<'_>> {
    let mut parts = Vec::new();
    let mut last_end = 0;
    for captures in FENCED_BLOCK_RE.captures_iter(content) {
        let whole = captures.get(0).expect("match");
        let markdown = content[last_end..whole.start()].trim();
        if !markdown.is_empty() {
            parts.push(Part::Markdown(markdown));
        }
        let lang = captures
            .get(1)
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_default();
        let inner = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        parts.push(Part::CodeBlock {
            full: whole.as_str(),
            lang: if lang.is_empty() { "text".to_string() } else { lang },
            inner,
        });
        last_end = whole.end();
    }
    let tail = content[last_end..].trim();
    if !tail.is_empty() {
        parts.push(Part::Markdown(tail));
    }
    parts
}

fn parse_blocks(content: &str) -> Result<Vec<Step>> {
    let parts = split_parts(content);
    let mut steps: Vec<Step> = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();
    let mut index = 0;

    while index < parts.len() {
        match &parts[index] {
            Part::Markdown(text) => {
                steps.push(Step::markdown(format!("md_{}", steps.len()), text.to_string()));
                index += 1;
            }
            Part::CodeBlock { full, lang, inner } => {
                let metadata = if lang == "yaml" { parse_cx_metadata(inner) } else { None };

                let Some(metadata) = metadata else {
                    // Ordinary fenced block: preserved as markdown.
                    steps.push(Step::markdown(format!("md_{}", steps.len()), full.to_string()));
                    index += 1;
                    continue;
                };

                let Some(Part::CodeBlock { lang: code_lang, inner: code_inner, .. }) =
                    parts.get(index + 1)
                else {
                    warn!(
                        id = metadata.get("id").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                        "page.orphaned_metadata_block"
                    );
                    steps.push(Step::markdown(format!("md_{}", steps.len()), full.to_string()));
                    index += 1;
                    continue;
                };

                let step = build_executable_step(metadata, code_lang, code_inner)?;
                if !seen_ids.insert(step.id.clone()) {
                    return Err(EngineError::Validation(format!(
                        "duplicate executable block id '{}'",
                        step.id
                    )));
                }
                steps.push(step);
                index += 2;
            }
        }
    }

    Ok(steps)
}

/// Parses a YAML fence as cx metadata. `None` when it is not a mapping with a
/// top-level `cx_block: true`.
fn parse_cx_metadata(inner: &str) -> Option<Map<String, Value>> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(inner).ok()?;
    let json = yaml_to_json(parsed).ok()?;
    let map = match json {
        Value::Object(map) => map,
        _ => return None,
    };
    if map.get("cx_block") == Some(&Value::Bool(true)) {
        Some(map)
    } else {
        None
    }
}

fn build_executable_step(
    mut metadata: Map<String, Value>,
    code_lang: &str,
    code_inner: &str,
) -> Result<Step> {
    metadata.remove("cx_block");

    let id = metadata
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| {
            EngineError::Validation(
                "an executable block is missing a required 'id' field".to_string(),
            )
        })?;

    let engine = metadata
        .get("engine")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| code_lang.to_string());
    if engine.is_empty() || engine == "text" {
        return Err(EngineError::Validation(format!(
            "engine for block '{id}' is not specified in metadata or code fence"
        )));
    }

    if engine == "run" {
        // The paired fence holds the YAML payload of the `run` field.
        let payload: serde_yaml::Value = serde_yaml::from_str(code_inner).map_err(|err| {
            EngineError::Validation(format!("invalid run payload for block '{id}': {err}"))
        })?;
        let payload = yaml_to_json(payload)?;
        if !payload.get("action").map(Value::is_string).unwrap_or(false) {
            return Err(EngineError::Validation(format!(
                "content of run block '{id}' must be a YAML mapping with an 'action' key"
            )));
        }
        metadata.remove("engine");
        metadata.insert("run".to_string(), payload);
    } else {
        metadata.insert("engine".to_string(), Value::String(engine));
        metadata.insert("content".to_string(), Value::String(code_inner.to_string()));
    }

    serde_json::from_value(Value::Object(metadata)).map_err(|err| {
        EngineError::Validation(format!("invalid executable block structure for '{id}': {err}"))
    })
}

/// Renders a document back to page markdown. Non-essential formatting may
/// differ from the source; executable ids and bodies are preserved.
pub fn to_markdown(document: &Document) -> Result<String> {
    let mut out = String::new();

    let mut front = Map::new();
    front.insert("name".to_string(), Value::String(document.name.clone()));
    if let Some(description) = &document.description {
        front.insert("description".to_string(), Value::String(description.clone()));
    }
    if !document.inputs.is_empty() {
        front.insert("inputs".to_string(), serde_json::to_value(&document.inputs)?);
    }
    out.push_str("---\n");
    out.push_str(&serde_yaml::to_string(&front)?);
    out.push_str("---\n\n");

    for step in &document.steps {
        if step.is_markdown() {
            out.push_str(step.content.as_deref().unwrap_or_default());
            out.push_str("\n\n");
            continue;
        }

        let mut metadata = match serde_json::to_value(step)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        metadata.remove("content");
        let run = metadata.remove("run");
        let engine = metadata.remove("engine");

        let mut header = Map::new();
        header.insert("cx_block".to_string(), Value::Bool(true));
        header.insert("id".to_string(), Value::String(step.id.clone()));
        if run.is_some() {
            header.insert("engine".to_string(), Value::String("run".to_string()));
        } else if let Some(engine) = engine.clone() {
            header.insert("engine".to_string(), engine);
        }
        metadata.remove("id");
        for (key, value) in metadata {
            header.insert(key, value);
        }

        out.push_str("```yaml\n");
        out.push_str(&serde_yaml::to_string(&header)?);
        out.push_str("```\n\n");

        if let Some(run) = run {
            out.push_str("```yaml\n");
            out.push_str(&serde_yaml::to_string(&run)?);
            out.push_str("```\n\n");
        } else {
            let lang = fence_language(engine.as_ref().and_then(Value::as_str).unwrap_or("text"));
            out.push_str("```");
            out.push_str(lang);
            out.push('\n');
            out.push_str(step.content.as_deref().unwrap_or_default());
            out.push_str("\n```\n\n");
        }
    }

    Ok(out)
}

fn fence_language(engine: &str) -> &str {
    match engine {
        "sql" => "sql",
        "python" => "python",
        "artifact" | "ui-component" | "transform" => "yaml",
        other => other,
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::model::{OutputsSpec, RunAction};

    const SAMPLE: &str = r#"---
name: Quarterly Numbers
description: Pull totals and plot them.
inputs:
  quarter:
    required: true
---

# Quarterly numbers

This page pulls the quarter's totals.

```yaml
cx_block: true
id: fetch_totals
connection_source: "user:warehouse"
outputs:
  rows: "$"
```

```sql
SELECT region, total FROM sales WHERE quarter = :quarter
```

Some commentary between blocks.

```yaml
cx_block: true
id: save_report
depends_on: [fetch_totals]
inputs: ["fetch_totals.rows"]
```

```yaml
action: write_files
files:
  - path: report.json
    content: "{{ steps.fetch_totals.outputs.rows }}"
```

```js
console.log("not executable");
```
"#;

    #[test]
    fn test_parse_page_structure() {
        let doc = parse_str(SAMPLE).unwrap();
        assert_eq!(doc.kind, DocumentKind::Page);
        assert_eq!(doc.name, "Quarterly Numbers");
        assert!(doc.inputs["quarter"].required);

        let executable: Vec<&Step> = doc.steps.iter().filter(|s| !s.is_markdown()).collect();
        assert_eq!(executable.len(), 2);

        let fetch = executable[0];
        assert_eq!(fetch.id, "fetch_totals");
        // Engine falls back to the fence language.
        assert_eq!(fetch.engine.as_deref(), Some("sql"));
        assert!(fetch.content.as_deref().unwrap().contains("FROM sales"));
        assert!(matches!(
            fetch.outputs,
            Some(OutputsSpec::Projections(_))
        ));

        let save = executable[1];
        assert_eq!(save.id, "save_report");
        assert_eq!(save.dependencies(), ["fetch_totals"]);
        assert!(matches!(save.run, Some(RunAction::WriteFiles { .. })));
        assert!(save.engine.is_none());
    }

    #[test]
    fn test_markdown_runs_get_sequential_ids() {
        let doc = parse_str(SAMPLE).unwrap();
        let md_ids: Vec<&str> = doc
            .steps
            .iter()
            .filter(|s| s.is_markdown())
            .map(|s| s.id.as_str())
            .collect();
        assert!(!md_ids.is_empty());
        for id in &md_ids {
            assert!(id.starts_with("md_"), "unexpected markdown id {id}");
        }
        // The trailing js fence is preserved as markdown, not executed.
        assert!(doc
            .steps
            .iter()
            .any(|s| s.is_markdown() && s.content.as_deref().unwrap_or("").contains("console.log")));
    }

    #[test]
    fn test_orphaned_metadata_degrades_to_markdown() {
        let raw = "---\nname: Orphan\n---\n\n```yaml\ncx_block: true\nid: lonely\nengine: sql\n```\n";
        let doc = parse_str(raw).unwrap();
        assert!(doc.steps.iter().all(|s| s.is_markdown()));
    }

    #[test]
    fn test_metadata_without_id_is_rejected() {
        let raw = "---\nname: Bad\n---\n\n```yaml\ncx_block: true\nengine: sql\n```\n\n```sql\nSELECT 1\n```\n";
        assert!(matches!(parse_str(raw), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_run_block_requires_action_key() {
        let raw = "---\nname: Bad\n---\n\n```yaml\ncx_block: true\nid: r\nengine: run\n```\n\n```yaml\nquery: SELECT 1\n```\n";
        assert!(matches!(parse_str(raw), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_round_trip_preserves_executable_steps() {
        let first = parse_str(SAMPLE).unwrap();
        let rendered = to_markdown(&first).unwrap();
        let second = parse_str(&rendered).unwrap();

        let ids = |doc: &Document| -> Vec<String> {
            doc.steps
                .iter()
                .filter(|s| !s.is_markdown())
                .map(|s| s.id.clone())
                .collect()
        };
        assert_eq!(ids(&first), ids(&second));

        for (a, b) in first
            .steps
            .iter()
            .filter(|s| !s.is_markdown())
            .zip(second.steps.iter().filter(|s| !s.is_markdown()))
        {
            assert_eq!(a.id, b.id);
            assert_eq!(a.engine, b.engine);
            assert_eq!(a.run, b.run);
            assert_eq!(
                a.content.as_deref().map(str::trim),
                b.content.as_deref().map(str::trim)
            );
            assert_eq!(a.depends_on, b.depends_on);
            assert_eq!(a.outputs, b.outputs);
        }
    }

    #[test]
    fn test_page_without_front_matter_name_is_rejected() {
        assert!(matches!(
            parse_str("# Just markdown\n"),
            Err(EngineError::Validation(_))
        ));
    }
}
