//! # Run Manifest
//!
//! The durable record of a run: per-step results, final status, rendered
//! input parameters, and captured artifacts. One manifest per run, mutated in
//! place while the run progresses and serialized exactly once when it ends,
//! so partial runs stay inspectable.
//!
//! The `CacheIndex` consults recent manifests to locate prior completed step
//! results by cache key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

/// Terminal record for a single step. Created once the step reaches a
/// terminal state and never mutated afterwards (the cache-hit flag is set
/// before the record is appended).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    pub summary: String,
    pub cache_key: String,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
}

impl StepRecord {
    pub fn completed(step_id: &str, cache_key: &str, output_hash: String) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Completed,
            summary: "Completed successfully.".to_string(),
            cache_key: cache_key.to_string(),
            cache_hit: false,
            output_hash: Some(output_hash),
        }
    }

    pub fn skipped(step_id: &str, summary: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            summary: summary.to_string(),
            cache_key: String::new(),
            cache_hit: false,
            output_hash: None,
        }
    }

    pub fn failed(step_id: &str, summary: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Failed,
            summary: summary.to_string(),
            cache_key: String::new(),
            cache_hit: false,
            output_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub content_hash: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    pub status: RunStatus,
    pub timestamp_utc: DateTime<Utc>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, ArtifactRecord>,
}

impl RunManifest {
    pub fn new(run_id: &str, flow_id: Option<String>, parameters: Map<String, Value>) -> Self {
        Self {
            run_id: run_id.to_string(),
            flow_id,
            status: RunStatus::Running,
            timestamp_utc: Utc::now(),
            parameters,
            steps: Vec::new(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Serializes the manifest to `<runs_dir>/<run_id>/manifest.json`.
    pub fn save(&self, runs_dir: &Path) -> Result<PathBuf> {
        let run_dir = runs_dir.join(&self.run_id);
        std::fs::create_dir_all(&run_dir)?;
        let path = run_dir.join("manifest.json");
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "manifest.written");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Locates prior completed step results by cache key.
///
/// Scans the `scan_depth` most recent manifests (by file modification time,
/// newest first). Absence is a cache miss, never a failure: unreadable
/// manifests are skipped with a warning.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    runs_dir: PathBuf,
    scan_depth: usize,
}

impl CacheIndex {
    pub fn new(runs_dir: impl AsRef<Path>, scan_depth: usize) -> Self {
        Self {
            runs_dir: runs_dir.as_ref().to_path_buf(),
            scan_depth: scan_depth.max(1),
        }
    }

    pub fn find_completed(&self, cache_key: &str) -> Option<StepRecord> {
        if cache_key.is_empty() {
            return None;
        }
        for path in self.recent_manifests() {
            let manifest = match RunManifest::load(&path) {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cache.scan_error");
                    continue;
                }
            };
            for record in &manifest.steps {
                if record.cache_key == cache_key && record.status == StepStatus::Completed {
                    debug!(cache_key = %cache_key, found_in_run = %manifest.run_id, "cache.hit");
                    return Some(record.clone());
                }
            }
        }
        debug!(cache_key = %cache_key, "cache.miss");
        None
    }

    fn recent_manifests(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.runs_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut manifests: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path().join("manifest.json");
                let mtime = path.metadata().and_then(|m| m.modified()).ok()?;
                Some((mtime, path))
            })
            .collect();

        manifests.sort_by(|a, b| b.0.cmp(&a.0));
        manifests
            .into_iter()
            .take(self.scan_depth)
            .map(|(_, path)| path)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_manifest(run_id: &str) -> RunManifest {
        let mut parameters = Map::new();
        parameters.insert("limit".to_string(), json!(10));
        let mut manifest = RunManifest::new(run_id, Some("nightly-sync".to_string()), parameters);
        manifest.steps.push(StepRecord::completed(
            "fetch",
            "sha256:aaaa",
            "sha256:bbbb".to_string(),
        ));
        manifest.steps.push(StepRecord::skipped(
            "notify",
            "Skipped: if_condition evaluated to false.",
        ));
        manifest.status = RunStatus::Completed;
        manifest.artifacts.insert(
            "out.json".to_string(),
            ArtifactRecord {
                content_hash: "sha256:cccc".to_string(),
                mime_type: "application/json".to_string(),
                size_bytes: 42,
            },
        );
        manifest
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest("run_0001");
        let path = manifest.save(dir.path()).unwrap();

        let loaded = RunManifest::load(&path).unwrap();
        assert_eq!(loaded.run_id, manifest.run_id);
        assert_eq!(loaded.flow_id, manifest.flow_id);
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.steps, manifest.steps);
        assert_eq!(loaded.artifacts, manifest.artifacts);
        assert_eq!(loaded.parameters, manifest.parameters);
    }

    #[test]
    fn test_cache_index_finds_completed_step() {
        let dir = tempfile::tempdir().unwrap();
        sample_manifest("run_0001").save(dir.path()).unwrap();

        let index = CacheIndex::new(dir.path(), 100);
        let hit = index.find_completed("sha256:aaaa").unwrap();
        assert_eq!(hit.step_id, "fetch");
        assert_eq!(hit.output_hash.as_deref(), Some("sha256:bbbb"));
    }

    #[test]
    fn test_cache_index_ignores_non_completed_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = sample_manifest("run_0002");
        manifest.steps[0].status = StepStatus::Failed;
        manifest.save(dir.path()).unwrap();

        let index = CacheIndex::new(dir.path(), 100);
        assert!(index.find_completed("sha256:aaaa").is_none());
    }

    #[test]
    fn test_cache_index_miss_on_empty_key_and_missing_dir() {
        let index = CacheIndex::new("/nonexistent/runs", 100);
        assert!(index.find_completed("").is_none());
        assert!(index.find_completed("sha256:aaaa").is_none());
    }

    #[test]
    fn test_exactly_one_record_per_terminal_step() {
        let manifest = sample_manifest("run_0003");
        for record in &manifest.steps {
            let count = manifest
                .steps
                .iter()
                .filter(|r| r.step_id == record.step_id)
                .count();
            assert_eq!(count, 1, "duplicate record for step {}", record.step_id);
        }
    }
}
