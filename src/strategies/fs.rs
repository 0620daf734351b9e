//! Declarative filesystem strategy.
//!
//! Serves local files as a VFS: directory listings, mime-typed content
//! reads, file writes for the `artifact` engine and `write_files` action,
//! and text bundling via `aggregate_content`.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::connections::{Connection, SecretMap};
use crate::context::RunContext;
use crate::document::model::FileToWrite;
use crate::errors::{EngineError, Result};
use crate::strategies::{ConnectorStrategy, VfsFileContent, VfsNode};

/// Files larger than this are skipped by `aggregate_content`.
const AGGREGATE_MAX_FILE_BYTES: u64 = 1024 * 1024;

pub struct FilesystemStrategy;

impl FilesystemStrategy {
    pub fn new() -> Self {
        Self
    }

    fn read_text_file(path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)?;
        if bytes.contains(&0) {
            return Err(EngineError::Value(format!(
                "'{}' looks like a binary file and cannot be read as text",
                path.display()
            )));
        }
        String::from_utf8(bytes).map_err(|_| {
            EngineError::Value(format!("'{}' is not valid UTF-8", path.display()))
        })
    }
}

impl Default for FilesystemStrategy {
    fn default() -> Self {
        Self::new()
    }
}

pub fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[async_trait]
impl ConnectorStrategy for FilesystemStrategy {
    fn key(&self) -> &'static str {
        "fs-declarative"
    }

    async fn test_connection(&self, _connection: &Connection, _secrets: &SecretMap) -> Result<bool> {
        Ok(true)
    }

    async fn browse_path(
        &self,
        path_parts: &[String],
        _connection: &Connection,
        _secrets: &SecretMap,
    ) -> Result<Vec<VfsNode>> {
        let raw = path_parts.first().map(String::as_str).unwrap_or(".");
        let dir = Path::new(raw);
        if !dir.is_dir() {
            return Err(EngineError::NotFound(format!(
                "directory not found: {}",
                dir.display()
            )));
        }

        let mut nodes = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path().to_string_lossy().to_string();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                nodes.push(VfsNode::directory(name, path));
            } else {
                let mut node = VfsNode::file(name, path);
                if let Ok(meta) = entry.metadata() {
                    node.metadata = Some(json!({"size": meta.len()}));
                }
                nodes.push(node);
            }
        }
        nodes.sort_by(|a, b| {
            (a.node_type != "directory")
                .cmp(&(b.node_type != "directory"))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(nodes)
    }

    async fn get_content(
        &self,
        path_parts: &[String],
        _connection: &Connection,
        _secrets: &SecretMap,
    ) -> Result<VfsFileContent> {
        let raw = path_parts
            .first()
            .ok_or_else(|| EngineError::Value("get_content requires a path".to_string()))?;
        let path = Path::new(raw);
        if !path.is_file() {
            return Err(EngineError::NotFound(format!(
                "file not found: {}",
                path.display()
            )));
        }
        let content = Self::read_text_file(path)?;
        Ok(VfsFileContent {
            path: path.to_string_lossy().to_string(),
            size: content.len() as u64,
            mime_type: guess_mime(path),
            content,
        })
    }

    async fn write_files(&self, files: &[FileToWrite], context: &RunContext) -> Result<Value> {
        let mut written = Vec::with_capacity(files.len());
        for file in files {
            let path = context.resolve_path(&file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, file.content.as_bytes())?;
            debug!(path = %path.display(), bytes = file.content.len(), "fs.write_files.written");
            written.push(path.to_string_lossy().to_string());
        }
        Ok(json!({"status": "success", "files_written": written}))
    }

    async fn aggregate_content(
        &self,
        paths: &[String],
        output_path: Option<&str>,
        context: &RunContext,
    ) -> Result<Value> {
        let mut bundle = String::new();
        let mut file_count = 0usize;

        for raw in paths {
            let root = context.resolve_path(raw);
            let files: Vec<std::path::PathBuf> = if root.is_dir() {
                WalkDir::new(&root)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.into_path())
                    .collect()
            } else if root.is_file() {
                vec![root.clone()]
            } else {
                return Err(EngineError::NotFound(format!(
                    "aggregate_content path not found: {}",
                    root.display()
                )));
            };

            for file in files {
                let size = file.metadata().map(|m| m.len()).unwrap_or(0);
                if size > AGGREGATE_MAX_FILE_BYTES {
                    warn!(path = %file.display(), size, "fs.aggregate.skipping_large_file");
                    continue;
                }
                match Self::read_text_file(&file) {
                    Ok(text) => {
                        bundle.push_str(&format!("--- FILE: {} ---\n", file.display()));
                        bundle.push_str(&text);
                        if !text.ends_with('\n') {
                            bundle.push('\n');
                        }
                        bundle.push('\n');
                        file_count += 1;
                    }
                    Err(_) => {
                        debug!(path = %file.display(), "fs.aggregate.skipping_binary_file");
                    }
                }
            }
        }

        let total_bytes = bundle.len();
        if let Some(out) = output_path {
            let out = context.resolve_path(out);
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out, bundle.as_bytes())?;
            return Ok(json!({
                "status": "success",
                "file_count": file_count,
                "total_bytes": total_bytes,
                "output_path": out.to_string_lossy(),
            }));
        }

        let mut result = Map::new();
        result.insert("content".to_string(), Value::String(bundle));
        result.insert("file_count".to_string(), json!(file_count));
        result.insert("total_bytes".to_string(), json!(total_bytes));
        Ok(Value::Object(result))
    }
}
