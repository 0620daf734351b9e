//! Flow YAML format (`.flow.yaml` / `.flow.yml`).
//!
//! A flow is a plain YAML mapping: `name`, optional `description`, optional
//! `inputs` (name to `{required, default, description}`), and an ordered
//! `steps` list. Parse then serialize then parse is a fixed point.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::document::model::{Document, DocumentKind, InputSpec, Step};
use crate::errors::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSpec>,
    pub steps: Vec<Step>,
}

pub fn parse_file(path: &Path) -> Result<Document> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        EngineError::NotFound(format!("could not read flow '{}': {err}", path.display()))
    })?;
    parse_str(&raw)
}

pub fn parse_str(raw: &str) -> Result<Document> {
    let file: FlowFile = serde_yaml::from_str(raw)
        .map_err(|err| EngineError::Validation(format!("invalid flow document: {err}")))?;
    validate_step_ids(&file.steps)?;
    Ok(Document {
        kind: DocumentKind::Flow,
        name: file.name,
        description: file.description,
        inputs: file.inputs,
        steps: file.steps,
    })
}

/// Serializes a flow document back to YAML.
pub fn to_yaml(document: &Document) -> Result<String> {
    let file = FlowFile {
        name: document.name.clone(),
        description: document.description.clone(),
        inputs: document.inputs.clone(),
        steps: document.steps.clone(),
    };
    Ok(serde_yaml::to_string(&file)?)
}

fn validate_step_ids(steps: &[Step]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(EngineError::Validation(
                "flow contains a step with an empty id".to_string(),
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate step id '{}' in flow",
                step.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::model::{OutputsSpec, RunAction};
    use serde_json::json;

    const SAMPLE: &str = r#"
name: daily-report
description: Pull yesterday's totals and write a report.
inputs:
  day:
    required: true
    description: ISO date to report on
  limit:
    default: 100
steps:
  - id: fetch
    connection_source: "user:warehouse"
    run:
      action: sql_query
      query: "SELECT total FROM sales WHERE day = :day"
      parameters:
        day: "{{ inputs.day }}"
    outputs:
      total: "$[0].total"
  - id: publish
    depends_on: [fetch]
    if: "{{ steps.fetch.outputs.total > 0 }}"
    run:
      action: declarative_action
      template_key: post_report
      context:
        total: "{{ steps.fetch.outputs.total }}"
"#;

    #[test]
    fn test_parse_sample_flow() {
        let doc = parse_str(SAMPLE).unwrap();
        assert_eq!(doc.kind, DocumentKind::Flow);
        assert_eq!(doc.name, "daily-report");
        assert!(doc.inputs["day"].required);
        assert_eq!(doc.inputs["limit"].default, Some(json!(100)));
        assert_eq!(doc.steps.len(), 2);

        let fetch = &doc.steps[0];
        assert_eq!(fetch.connection_source.as_deref(), Some("user:warehouse"));
        assert!(matches!(fetch.run, Some(RunAction::SqlQuery { .. })));
        match fetch.outputs.as_ref().unwrap() {
            OutputsSpec::Projections(map) => assert_eq!(map["total"], "$[0].total"),
            other => panic!("unexpected outputs: {other:?}"),
        }

        let publish = &doc.steps[1];
        assert_eq!(publish.dependencies(), ["fetch"]);
        assert!(publish.condition.as_deref().unwrap().contains("outputs.total"));
    }

    #[test]
    fn test_parse_serialize_parse_is_fixed_point() {
        let first = parse_str(SAMPLE).unwrap();
        let yaml = to_yaml(&first).unwrap();
        let second = parse_str(&yaml).unwrap();
        assert_eq!(first.name, second.name);
        assert_eq!(first.description, second.description);
        assert_eq!(first.inputs, second.inputs);
        assert_eq!(first.steps, second.steps);

        let third = parse_str(&to_yaml(&second).unwrap()).unwrap();
        assert_eq!(second.steps, third.steps);
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let raw = "name: bad\nsteps:\n  - id: a\n    engine: sql\n    content: SELECT 1\n  - id: a\n    engine: sql\n    content: SELECT 2\n";
        assert!(matches!(
            parse_str(raw),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_step_id_is_rejected() {
        let raw = "name: bad\nsteps:\n  - id: \"  \"\n    engine: sql\n    content: SELECT 1\n";
        assert!(matches!(parse_str(raw), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = parse_file(Path::new("/nonexistent/x.flow.yaml")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
