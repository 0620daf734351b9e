//! Smart fetcher meta-strategy.
//!
//! Reads content from a generic source, routing by scheme: URLs delegate to
//! the REST engine against a synthesized connection, everything else is
//! treated as a local path and delegates to the filesystem strategy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::connections::{ApiCatalog, BrowseConfig, Connection, SecretMap};
use crate::errors::{EngineError, Result};
use crate::strategies::fs::FilesystemStrategy;
use crate::strategies::rest::RestStrategy;
use crate::strategies::{ConnectorStrategy, VfsFileContent};

pub struct SmartFetcherStrategy {
    rest: Arc<RestStrategy>,
    fs: Arc<FilesystemStrategy>,
}

impl SmartFetcherStrategy {
    pub fn new(rest: Arc<RestStrategy>, fs: Arc<FilesystemStrategy>) -> Self {
        Self { rest, fs }
    }

    /// Synthesizes an unauthenticated REST connection for a bare URL.
    fn url_connection(parsed: &url::Url) -> Connection {
        let mut base = format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or(""));
        if let Some(port) = parsed.port() {
            base.push_str(&format!(":{port}"));
        }
        let mut catalog = ApiCatalog::with_provider("rest-declarative");
        catalog.browse_config = Some(BrowseConfig {
            base_url_template: Some(base),
            ..BrowseConfig::default()
        });
        Connection::ephemeral("url_fetcher", catalog)
    }
}

#[async_trait]
impl ConnectorStrategy for SmartFetcherStrategy {
    fn key(&self) -> &'static str {
        "internal-smart_fetcher"
    }

    async fn test_connection(&self, _connection: &Connection, _secrets: &SecretMap) -> Result<bool> {
        Ok(true)
    }

    async fn get_content(
        &self,
        path_parts: &[String],
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<VfsFileContent> {
        let source = path_parts
            .first()
            .ok_or_else(|| EngineError::Value("smart fetcher requires a path or URL".to_string()))?;

        if source.starts_with("http://") || source.starts_with("https://") {
            let parsed = url::Url::parse(source)
                .map_err(|err| EngineError::Value(format!("invalid URL '{source}': {err}")))?;
            let mut endpoint = parsed.path().to_string();
            if let Some(query) = parsed.query() {
                endpoint.push('?');
                endpoint.push_str(query);
            }
            debug!(url = %source, "fetcher.delegating_to_rest");
            let delegated = Self::url_connection(&parsed);
            return self
                .rest
                .get_content(&[endpoint], &delegated, &SecretMap::new())
                .await
                .map_err(|err| {
                    EngineError::Io(format!("smart fetcher failed to read '{source}': {err}"))
                });
        }

        debug!(path = %source, "fetcher.delegating_to_fs");
        self.fs
            .get_content(std::slice::from_ref(source), connection, secrets)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn strategy() -> SmartFetcherStrategy {
        SmartFetcherStrategy::new(
            Arc::new(RestStrategy::new(5)),
            Arc::new(FilesystemStrategy::new()),
        )
    }

    fn conn() -> Connection {
        Connection::ephemeral("fetch", ApiCatalog::with_provider("internal-smart_fetcher"))
    }

    #[tokio::test]
    async fn test_url_routes_to_rest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/report"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": [1, 2]})))
            .mount(&server)
            .await;

        let content = strategy()
            .get_content(
                &[format!("{}/data/report?page=2", server.uri())],
                &conn(),
                &SecretMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(content.mime_type, "application/json");
        assert!(content.content.contains("rows"));
    }

    #[tokio::test]
    async fn test_path_routes_to_fs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        std::fs::write(&file, "# notes\n").unwrap();

        let content = strategy()
            .get_content(
                &[file.to_string_lossy().to_string()],
                &conn(),
                &SecretMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(content.content, "# notes\n");
    }

    #[tokio::test]
    async fn test_browse_is_not_supported() {
        let err = strategy()
            .browse_path(&[], &conn(), &SecretMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotImplemented { .. }));
    }

    #[tokio::test]
    async fn test_missing_source_is_value_error() {
        let err = strategy()
            .get_content(&[], &conn(), &SecretMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Value(_)));
    }
}
