//! # Connections
//!
//! The connection model and the declarative blueprint (`ApiCatalog`) that
//! describes an external service: which strategy drives it, how to reach it,
//! how to authenticate, and which named actions it exposes.

pub mod resolver;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Secrets loaded from a connection's `.secret.env` file. Keys are
/// lowercased on load.
pub type SecretMap = BTreeMap<String, String>;

/// A bound connection to an external service, as declared in a
/// `<alias>.conn.yaml` file. The blueprint catalog is merged in lazily by the
/// resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_catalog_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method_type: Option<String>,
    /// Non-secret connection details (host, port, database, workspace ids…).
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<ApiCatalog>,
}

impl Connection {
    pub fn catalog(&self) -> Option<&ApiCatalog> {
        self.catalog.as_ref()
    }

    /// A minimal unauthenticated connection, used by meta-strategies that
    /// synthesize targets on the fly.
    pub fn ephemeral(name: &str, catalog: ApiCatalog) -> Self {
        Self {
            name: name.to_string(),
            id: format!("temp:{name}"),
            api_catalog_id: None,
            auth_method_type: Some("none".to_string()),
            details: Map::new(),
            catalog: Some(catalog),
        }
    }
}

/// A declarative service description loaded from `blueprint.cx.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiCatalog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Selects the strategy in the registry.
    pub connector_provider_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browse_config: Option<BrowseConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_config: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_config: Option<OauthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_connection_config: Option<TestConnectionConfig>,
    /// Named JSON Schema documents (from the package's `schemas.json`) used
    /// to validate action parameters and payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<Map<String, Value>>,
}

impl ApiCatalog {
    pub fn with_provider(key: &str) -> Self {
        Self {
            connector_provider_key: key.to_string(),
            ..Self::default()
        }
    }

    pub fn action_template(&self, template_key: &str) -> Option<&ActionTemplate> {
        self.browse_config
            .as_ref()?
            .action_templates
            .get(template_key)
    }

    pub fn schema(&self, name: &str) -> Option<&Value> {
        self.schemas.as_ref()?.get(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowseConfig {
    /// Template for the service base URL, rendered with `details`/`secrets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url_template: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listing_endpoints: Vec<ListingEndpoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub action_templates: BTreeMap<String, ActionTemplate>,
    /// Template for the git clone URL (git strategy only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_url_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Value>,
}

/// One virtual directory level served by a REST listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingEndpoint {
    /// First path segment this endpoint serves; empty matches the root.
    #[serde(default)]
    pub path_prefix: String,
    pub api_endpoint: String,
    /// JSONPath selecting the item list from the response; whole body if
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_field: Option<String>,
}

/// A blueprint-defined named action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionTemplate {
    /// Endpoint template for REST strategies; SQL text for SQL strategies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    #[serde(default = "default_http_method")]
    pub http_method: String,
    /// Name of the schema validating rendered user parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<String>,
    /// Name of the schema validating the constructed request payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_schema: Option<String>,
    /// Optional templated body; defaults to the validated parameters for
    /// POST/PUT/PATCH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_template: Option<Value>,
    /// Templated query string parameters appended to the endpoint.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, String>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// `basic`, `header`, `bearer` or `none`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthConfig {
    pub token_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConnectionConfig {
    pub endpoint: String,
    #[serde(default = "default_http_method")]
    pub http_method: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLUEPRINT_YAML: &str = r#"
id: "blueprint:community/httpbin@0.1.0"
name: httpbin
connector_provider_key: rest-declarative
browse_config:
  base_url_template: "https://{{ details.host }}"
  listing_endpoints:
    - path_prefix: ""
      api_endpoint: "/anything/list"
      items_path: "$.items"
      name_field: name
  action_templates:
    echo:
      api_endpoint: "/anything/{{ context.channel }}"
      http_method: POST
      parameters_schema: EchoParams
auth_config:
  type: header
  header_name: X-Api-Key
  value_template: "{{ secrets.api_key }}"
test_connection_config:
  endpoint: "/status/200"
"#;

    #[test]
    fn test_blueprint_yaml_round_trip() {
        let catalog: ApiCatalog = serde_yaml::from_str(BLUEPRINT_YAML).unwrap();
        assert_eq!(catalog.connector_provider_key, "rest-declarative");

        let template = catalog.action_template("echo").unwrap();
        assert_eq!(template.http_method, "POST");
        assert_eq!(template.parameters_schema.as_deref(), Some("EchoParams"));

        let auth = catalog.auth_config.as_ref().unwrap();
        assert_eq!(auth.kind.as_deref(), Some("header"));
        assert_eq!(auth.header_name.as_deref(), Some("X-Api-Key"));

        let again: ApiCatalog =
            serde_yaml::from_str(&serde_yaml::to_string(&catalog).unwrap()).unwrap();
        assert_eq!(
            again.action_template("echo").unwrap().api_endpoint,
            template.api_endpoint
        );
    }

    #[test]
    fn test_connection_yaml_defaults() {
        let raw = "name: Warehouse\napi_catalog_id: community/postgres@1.0.0\ndetails:\n  host: db.internal\n";
        let conn: Connection = serde_yaml::from_str(raw).unwrap();
        assert_eq!(conn.name, "Warehouse");
        assert!(conn.id.is_empty());
        assert!(conn.catalog.is_none());
        assert_eq!(conn.details["host"], serde_json::json!("db.internal"));
    }
}
