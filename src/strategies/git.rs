//! Declarative Git strategy.
//!
//! Repository metadata can be listed through REST endpoints declared in the
//! blueprint (composed over the REST engine); file content comes from an
//! on-disk clone cache under `<cx_home>/git`, refreshed with a fast-forward
//! pull on reuse.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use crate::connections::{Connection, SecretMap};
use crate::errors::{EngineError, Result};
use crate::store::sha256_hex;
use crate::strategies::fs::guess_mime;
use crate::strategies::rest::RestStrategy;
use crate::strategies::{ConnectorStrategy, VfsFileContent, VfsNode};
use crate::template::Renderer;

pub struct GitStrategy {
    git_root: PathBuf,
    rest: Arc<RestStrategy>,
    renderer: Renderer,
}

impl GitStrategy {
    pub fn new(git_root: PathBuf, rest: Arc<RestStrategy>) -> Self {
        Self {
            git_root,
            rest,
            renderer: Renderer::new(),
        }
    }

    fn clone_url(&self, connection: &Connection, secrets: &SecretMap) -> Result<String> {
        let template = connection
            .catalog()
            .and_then(|c| c.browse_config.as_ref())
            .and_then(|b| b.clone_url_template.as_deref())
            .ok_or_else(|| {
                EngineError::Value(format!(
                    "connection '{}' has no clone_url_template in its blueprint",
                    connection.name
                ))
            })?;
        let context = json!({"details": connection.details, "secrets": secrets});
        self.renderer.render_str(template, &context)
    }

    /// Clone cache slot for a repository, keyed by a hash of its URL.
    fn repo_path(&self, clone_url: &str) -> PathBuf {
        self.git_root.join(&sha256_hex(clone_url.as_bytes())[..16])
    }

    async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut command = Command::new("git");
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let output = command
            .output()
            .await
            .map_err(|err| EngineError::Io(format!("failed to spawn git: {err}")))?;
        if !output.status.success() {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .chars()
                .take(500)
                .collect();
            return Err(EngineError::Io(format!(
                "git {} failed: {stderr}",
                args.first().copied().unwrap_or("")
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Ensures a current work tree for the repository, cloning on first use
    /// and fast-forwarding afterwards.
    async fn ensure_repo(&self, clone_url: &str) -> Result<PathBuf> {
        let path = self.repo_path(clone_url);
        if path.join(".git").is_dir() {
            debug!(path = %path.display(), "git.cache.pull");
            Self::run_git(&["pull", "--ff-only"], Some(&path)).await?;
        } else {
            std::fs::create_dir_all(&self.git_root)?;
            info!(url = %clone_url, path = %path.display(), "git.cache.clone");
            let target = path.to_string_lossy();
            Self::run_git(&["clone", "--depth", "1", clone_url, target.as_ref()], None).await?;
        }
        Ok(path)
    }

    /// Joins a repo-relative path, rejecting traversal out of the work tree.
    fn safe_join(repo: &Path, relative: &str) -> Result<PathBuf> {
        let relative = relative.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            return Err(EngineError::Value(format!(
                "path '{relative}' escapes the repository"
            )));
        }
        Ok(repo.join(relative))
    }

    fn has_listing_endpoints(connection: &Connection) -> bool {
        connection
            .catalog()
            .and_then(|c| c.browse_config.as_ref())
            .map(|b| !b.listing_endpoints.is_empty())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ConnectorStrategy for GitStrategy {
    fn key(&self) -> &'static str {
        "git-declarative"
    }

    async fn test_connection(&self, connection: &Connection, secrets: &SecretMap) -> Result<bool> {
        let clone_url = self.clone_url(connection, secrets)?;
        match Self::run_git(&["ls-remote", "--heads", &clone_url], None).await {
            Ok(_) => Ok(true),
            Err(err) => Err(EngineError::Connection(format!(
                "git remote check failed: {err}"
            ))),
        }
    }

    async fn browse_path(
        &self,
        path_parts: &[String],
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<Vec<VfsNode>> {
        // Metadata endpoints (branches, tags, PRs) come from the service API
        // when the blueprint declares them.
        if Self::has_listing_endpoints(connection) {
            return self.rest.browse_path(path_parts, connection, secrets).await;
        }

        let clone_url = self.clone_url(connection, secrets)?;
        let repo = self.ensure_repo(&clone_url).await?;
        let relative = path_parts.first().map(String::as_str).unwrap_or("");
        let dir = Self::safe_join(&repo, relative)?;
        if !dir.is_dir() {
            return Err(EngineError::NotFound(format!(
                "directory '{relative}' not found in repository"
            )));
        }

        let mut nodes = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == ".git" {
                continue;
            }
            let vfs_path = if relative.is_empty() {
                name.clone()
            } else {
                format!("{}/{name}", relative.trim_end_matches('/'))
            };
            if entry.file_type()?.is_dir() {
                nodes.push(VfsNode::directory(name, vfs_path));
            } else {
                nodes.push(VfsNode::file(name, vfs_path));
            }
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn get_content(
        &self,
        path_parts: &[String],
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<VfsFileContent> {
        let relative = path_parts
            .first()
            .ok_or_else(|| EngineError::Value("get_content requires a repository path".to_string()))?;

        let clone_url = self.clone_url(connection, secrets)?;
        let repo = self.ensure_repo(&clone_url).await?;
        let file = Self::safe_join(&repo, relative)?;
        if !file.is_file() {
            return Err(EngineError::NotFound(format!(
                "file '{relative}' not found in repository"
            )));
        }

        let content = std::fs::read_to_string(&file)
            .map_err(|_| EngineError::Value(format!("'{relative}' is not a text file")))?;
        Ok(VfsFileContent {
            path: relative.clone(),
            size: content.len() as u64,
            mime_type: guess_mime(&file),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{ApiCatalog, BrowseConfig};

    fn strategy(root: &Path) -> GitStrategy {
        GitStrategy::new(root.to_path_buf(), Arc::new(RestStrategy::new(5)))
    }

    fn connection_with_clone_url(url: &str) -> Connection {
        let mut catalog = ApiCatalog::with_provider("git-declarative");
        catalog.browse_config = Some(BrowseConfig {
            clone_url_template: Some(url.to_string()),
            ..BrowseConfig::default()
        });
        Connection::ephemeral("repo", catalog)
    }

    #[test]
    fn test_repo_path_is_stable_per_url() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(dir.path());
        let a = strategy.repo_path("https://example.com/a.git");
        let b = strategy.repo_path("https://example.com/a.git");
        let c = strategy.repo_path("https://example.com/c.git");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(dir.path()));
    }

    #[test]
    fn test_safe_join_rejects_traversal() {
        let repo = Path::new("/cache/abc");
        assert!(GitStrategy::safe_join(repo, "src/lib.rs").is_ok());
        assert!(GitStrategy::safe_join(repo, "../outside").is_err());
        assert!(GitStrategy::safe_join(repo, "src/../../outside").is_err());
    }

    #[test]
    fn test_clone_url_renders_from_details() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(dir.path());
        let mut connection =
            connection_with_clone_url("https://{{ details.host }}/{{ details.repo }}.git");
        connection
            .details
            .insert("host".to_string(), serde_json::json!("git.internal"));
        connection
            .details
            .insert("repo".to_string(), serde_json::json!("data/flows"));

        let url = strategy
            .clone_url(&connection, &SecretMap::new())
            .unwrap();
        assert_eq!(url, "https://git.internal/data/flows.git");
    }

    #[test]
    fn test_missing_clone_url_template_is_value_error() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = strategy(dir.path());
        let connection = Connection::ephemeral("bare", ApiCatalog::with_provider("git-declarative"));
        assert!(matches!(
            strategy.clone_url(&connection, &SecretMap::new()),
            Err(EngineError::Value(_))
        ));
    }
}
