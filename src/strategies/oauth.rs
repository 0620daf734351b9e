//! OAuth2-wrapped REST strategy.
//!
//! Composes over the declarative REST engine: before delegating, it makes
//! sure the secret map carries a fresh access token, refreshing it through
//! the blueprint's `oauth_config.token_url` with the refresh-token grant when
//! the stored one is missing or expired. Delegated calls authenticate with a
//! bearer header.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::connections::{AuthConfig, Connection, SecretMap};
use crate::errors::{EngineError, Result};
use crate::strategies::rest::RestStrategy;
use crate::strategies::{ConnectorStrategy, VfsFileContent, VfsNode};

/// Tokens expiring within this window are refreshed eagerly.
const EXPIRY_SKEW_SECS: i64 = 60;

pub struct OauthStrategy {
    rest: Arc<RestStrategy>,
    http: reqwest::Client,
}

impl OauthStrategy {
    pub fn new(rest: Arc<RestStrategy>, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { rest, http }
    }

    fn token_is_fresh(secrets: &SecretMap) -> bool {
        if !secrets.contains_key("access_token") {
            return false;
        }
        match secrets.get("expires_at") {
            Some(raw) => match raw.parse::<DateTime<Utc>>() {
                Ok(expires_at) => expires_at - Duration::seconds(EXPIRY_SKEW_SECS) > Utc::now(),
                Err(_) => false,
            },
            // No recorded expiry: assume the token is usable.
            None => true,
        }
    }

    /// Returns a secret map guaranteed to hold a usable `access_token`.
    async fn ensure_fresh_secrets(
        &self,
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<SecretMap> {
        if Self::token_is_fresh(secrets) {
            return Ok(secrets.clone());
        }

        let token_url = connection
            .catalog()
            .and_then(|c| c.oauth_config.as_ref())
            .map(|o| o.token_url.clone())
            .ok_or_else(|| {
                EngineError::Connection(format!(
                    "connection '{}' has no oauth_config.token_url and its access token is stale",
                    connection.name
                ))
            })?;
        let refresh_token = secrets.get("refresh_token").cloned().ok_or_else(|| {
            EngineError::Connection(format!(
                "connection '{}' has no refresh_token to renew its access token",
                connection.name
            ))
        })?;

        info!(connection = %connection.name, "oauth.refreshing_access_token");
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token),
        ];
        if let Some(client_id) = secrets.get("client_id") {
            form.push(("client_id".to_string(), client_id.clone()));
        }
        if let Some(client_secret) = secrets.get("client_secret") {
            form.push(("client_secret".to_string(), client_secret.clone()));
        }

        let response = self.http.post(&token_url).form(&form).send().await?;
        let status = response.status();
        let body: Value = if status.is_success() {
            response.json().await?
        } else {
            let excerpt: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(300)
                .collect();
            return Err(EngineError::Connection(format!(
                "token refresh failed with HTTP {status}: {excerpt}"
            )));
        };

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Connection("token endpoint returned no access_token".to_string())
            })?;

        let mut fresh = secrets.clone();
        fresh.insert("access_token".to_string(), access_token.to_string());
        if let Some(new_refresh) = body.get("refresh_token").and_then(Value::as_str) {
            fresh.insert("refresh_token".to_string(), new_refresh.to_string());
        }
        if let Some(expires_in) = body.get("expires_in").and_then(Value::as_i64) {
            let expires_at = Utc::now() + Duration::seconds(expires_in);
            fresh.insert("expires_at".to_string(), expires_at.to_rfc3339());
        }
        debug!(connection = %connection.name, "oauth.token_refreshed");
        Ok(fresh)
    }

    /// The delegated connection authenticates with a bearer header unless the
    /// blueprint already configured something explicit.
    fn bearer_connection(connection: &Connection) -> Connection {
        let mut delegated = connection.clone();
        if let Some(catalog) = delegated.catalog.as_mut() {
            if catalog.auth_config.is_none() {
                catalog.auth_config = Some(AuthConfig {
                    kind: Some("bearer".to_string()),
                    ..AuthConfig::default()
                });
            }
        }
        delegated
    }
}

#[async_trait]
impl ConnectorStrategy for OauthStrategy {
    fn key(&self) -> &'static str {
        "oauth2-declarative"
    }

    async fn test_connection(&self, connection: &Connection, secrets: &SecretMap) -> Result<bool> {
        let fresh = self.ensure_fresh_secrets(connection, secrets).await?;
        self.rest
            .test_connection(&Self::bearer_connection(connection), &fresh)
            .await
    }

    async fn browse_path(
        &self,
        path_parts: &[String],
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<Vec<VfsNode>> {
        let fresh = self.ensure_fresh_secrets(connection, secrets).await?;
        self.rest
            .browse_path(path_parts, &Self::bearer_connection(connection), &fresh)
            .await
    }

    async fn get_content(
        &self,
        path_parts: &[String],
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<VfsFileContent> {
        let fresh = self.ensure_fresh_secrets(connection, secrets).await?;
        self.rest
            .get_content(path_parts, &Self::bearer_connection(connection), &fresh)
            .await
    }

    async fn run_declarative_action(
        &self,
        connection: &Connection,
        secrets: &SecretMap,
        template_key: &str,
        input: &Map<String, Value>,
        dry_run: bool,
    ) -> Result<Value> {
        let fresh = self.ensure_fresh_secrets(connection, secrets).await?;
        self.rest
            .run_declarative_action(
                &Self::bearer_connection(connection),
                &fresh,
                template_key,
                input,
                dry_run,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{ApiCatalog, BrowseConfig, OauthConfig, TestConnectionConfig};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connection_for(server_uri: &str) -> Connection {
        let mut catalog = ApiCatalog::with_provider("oauth2-declarative");
        catalog.browse_config = Some(BrowseConfig {
            base_url_template: Some("{{ details.base_url }}".to_string()),
            ..BrowseConfig::default()
        });
        catalog.oauth_config = Some(OauthConfig {
            token_url: format!("{server_uri}/oauth/token"),
        });
        catalog.test_connection_config = Some(TestConnectionConfig {
            endpoint: "/me".to_string(),
            http_method: "GET".to_string(),
        });

        let mut connection = Connection::ephemeral("cloud", catalog);
        connection
            .details
            .insert("base_url".to_string(), json!(server_uri));
        connection
    }

    #[test]
    fn test_token_freshness() {
        let mut secrets = SecretMap::new();
        assert!(!OauthStrategy::token_is_fresh(&secrets));

        secrets.insert("access_token".to_string(), "tok".to_string());
        assert!(OauthStrategy::token_is_fresh(&secrets));

        secrets.insert(
            "expires_at".to_string(),
            (Utc::now() - Duration::seconds(10)).to_rfc3339(),
        );
        assert!(!OauthStrategy::token_is_fresh(&secrets));

        secrets.insert(
            "expires_at".to_string(),
            (Utc::now() + Duration::seconds(3600)).to_rfc3339(),
        );
        assert!(OauthStrategy::token_is_fresh(&secrets));
    }

    #[tokio::test]
    async fn test_stale_token_is_refreshed_before_delegation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh-token",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header("Authorization", "Bearer fresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "u1"})))
            .mount(&server)
            .await;

        let strategy = OauthStrategy::new(Arc::new(RestStrategy::new(5)), 5);
        let mut secrets = SecretMap::new();
        secrets.insert("refresh_token".to_string(), "r-tok".to_string());
        secrets.insert("access_token".to_string(), "stale".to_string());
        secrets.insert(
            "expires_at".to_string(),
            (Utc::now() - Duration::seconds(120)).to_rfc3339(),
        );

        assert!(strategy
            .test_connection(&connection_for(&server.uri()), &secrets)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_a_connection_error() {
        let server = MockServer::start().await;
        let strategy = OauthStrategy::new(Arc::new(RestStrategy::new(5)), 5);

        let err = strategy
            .test_connection(&connection_for(&server.uri()), &SecretMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Connection(_)));
    }
}
