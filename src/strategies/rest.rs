//! Declarative REST strategy.
//!
//! A pure engine driven entirely by the connection's blueprint: the base URL,
//! auth method, listing endpoints and named actions all come from templates
//! in the `ApiCatalog`. Action parameters and payloads are validated against
//! the blueprint's named JSON Schemas before any request is sent.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::connections::{ActionTemplate, Connection, SecretMap};
use crate::errors::{EngineError, Result};
use crate::strategies::{validate_against_schema, ConnectorStrategy, VfsFileContent, VfsNode};
use crate::template::Renderer;

pub struct RestStrategy {
    http: reqwest::Client,
    renderer: Renderer,
}

impl RestStrategy {
    pub fn new(timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            renderer: Renderer::new(),
        }
    }

    /// `{details, secrets}` — the render context for connection-level
    /// templates (base URL, auth).
    fn connection_context(connection: &Connection, secrets: &SecretMap) -> Value {
        json!({"details": connection.details, "secrets": secrets})
    }

    fn base_url(&self, connection: &Connection, secrets: &SecretMap) -> Result<String> {
        let template = connection
            .catalog()
            .and_then(|c| c.browse_config.as_ref())
            .and_then(|b| b.base_url_template.as_deref())
            .ok_or_else(|| {
                EngineError::Value(format!(
                    "connection '{}' has no base_url_template in its blueprint",
                    connection.name
                ))
            })?;
        let context = Self::connection_context(connection, secrets);
        let rendered = self.renderer.render_str(template, &context)?;
        Ok(rendered.trim_end_matches('/').to_string())
    }

    fn join_url(base: &str, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{base}/{}", path.trim_start_matches('/'))
    }

    /// Builds the header set and optional basic credentials declared by the
    /// blueprint's `auth_config`.
    fn build_auth(
        &self,
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<(HeaderMap, Option<(String, String)>)> {
        let mut headers = HeaderMap::new();
        let context = Self::connection_context(connection, secrets);

        let Some(auth) = connection.catalog().and_then(|c| c.auth_config.as_ref()) else {
            return Ok((headers, None));
        };

        for (name, template) in &auth.additional_headers {
            let value = self.renderer.render_str(template, &context)?;
            headers.insert(parse_header_name(name)?, parse_header_value(&value)?);
        }

        match auth.kind.as_deref() {
            Some("basic") => {
                let username = self
                    .renderer
                    .render_str(auth.username_template.as_deref().unwrap_or(""), &context)?;
                let password = self
                    .renderer
                    .render_str(auth.password_template.as_deref().unwrap_or(""), &context)?;
                Ok((headers, Some((username, password))))
            }
            Some("header") => {
                let name = auth.header_name.as_deref().ok_or_else(|| {
                    EngineError::Value("header auth requires 'header_name'".to_string())
                })?;
                let value = self
                    .renderer
                    .render_str(auth.value_template.as_deref().unwrap_or(""), &context)?;
                headers.insert(parse_header_name(name)?, parse_header_value(&value)?);
                Ok((headers, None))
            }
            Some("bearer") => {
                let template = auth
                    .value_template
                    .as_deref()
                    .unwrap_or("Bearer {{ secrets.access_token }}");
                let value = self.renderer.render_str(template, &context)?;
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    parse_header_value(&value)?,
                );
                Ok((headers, None))
            }
            _ => Ok((headers, None)),
        }
    }

    async fn request_json(
        &self,
        method: &str,
        url: &str,
        connection: &Connection,
        secrets: &SecretMap,
        body: Option<&Value>,
    ) -> Result<Value> {
        let (headers, basic) = self.build_auth(connection, secrets)?;
        let method: reqwest::Method = method.parse().map_err(|_| {
            EngineError::Value(format!("invalid HTTP method '{method}'"))
        })?;

        let mut builder = self.http.request(method, url).headers(headers);
        if let Some((username, password)) = basic {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let excerpt: String = String::from_utf8_lossy(&bytes).chars().take(500).collect();
            return Err(EngineError::Io(format!(
                "HTTP {status} from {url}: {excerpt}"
            )));
        }

        if bytes.is_empty() {
            return Ok(json!({"status_code": status.as_u16(), "content": null}));
        }
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(String::from_utf8_lossy(&bytes).to_string())),
        }
    }

    /// Processes `read_file:` / `b64encode_file:` parameter directives after
    /// rendering and before schema validation.
    fn process_directives(value: &Value) -> Result<Value> {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), Self::process_directives(item)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items.iter().map(Self::process_directives).collect(),
            Value::String(text) => {
                if let Some(path) = text.strip_prefix("read_file:") {
                    let path = resolve_local(path);
                    Ok(Value::String(std::fs::read_to_string(&path)?))
                } else if let Some(path) = text.strip_prefix("b64encode_file:") {
                    let path = resolve_local(path);
                    let bytes = std::fs::read(&path)?;
                    Ok(Value::String(
                        base64::engine::general_purpose::STANDARD.encode(bytes),
                    ))
                } else {
                    Ok(value.clone())
                }
            }
            _ => Ok(value.clone()),
        }
    }

    fn action_template<'a>(
        connection: &'a Connection,
        template_key: &str,
    ) -> Result<&'a ActionTemplate> {
        connection
            .catalog()
            .and_then(|c| c.action_template(template_key))
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "action '{template_key}' not found in blueprint for connection '{}'",
                    connection.name
                ))
            })
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    name.parse::<HeaderName>()
        .map_err(|_| EngineError::Value(format!("invalid header name '{name}'")))
}

fn parse_header_value(value: &str) -> Result<HeaderValue> {
    value
        .parse::<HeaderValue>()
        .map_err(|_| EngineError::Value("invalid header value".to_string()))
}

fn resolve_local(raw: &str) -> PathBuf {
    let trimmed = raw.trim().trim_start_matches("file://");
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(trimmed)
}

#[async_trait]
impl ConnectorStrategy for RestStrategy {
    fn key(&self) -> &'static str {
        "rest-declarative"
    }

    async fn test_connection(&self, connection: &Connection, secrets: &SecretMap) -> Result<bool> {
        let Some(config) = connection
            .catalog()
            .and_then(|c| c.test_connection_config.as_ref())
        else {
            // No probe configured; credentials were at least resolvable.
            return Ok(true);
        };

        let base = self.base_url(connection, secrets)?;
        let url = Self::join_url(&base, &config.endpoint);
        match self
            .request_json(&config.http_method, &url, connection, secrets, None)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => Err(EngineError::Connection(format!(
                "connection test failed: {err}"
            ))),
        }
    }

    async fn browse_path(
        &self,
        path_parts: &[String],
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<Vec<VfsNode>> {
        let browse = connection
            .catalog()
            .and_then(|c| c.browse_config.as_ref())
            .ok_or_else(|| {
                EngineError::Value(format!(
                    "connection '{}' has no browse_config",
                    connection.name
                ))
            })?;

        let prefix = path_parts.first().map(String::as_str).unwrap_or("");
        let endpoint = browse
            .listing_endpoints
            .iter()
            .find(|e| e.path_prefix == prefix)
            .or_else(|| browse.listing_endpoints.first())
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "no listing endpoint configured for path '{prefix}'"
                ))
            })?;

        let mut context = Self::connection_context(connection, secrets);
        context["path_parts"] = json!(path_parts);
        let rendered_endpoint = self.renderer.render_str(&endpoint.api_endpoint, &context)?;

        let base = self.base_url(connection, secrets)?;
        let url = Self::join_url(&base, &rendered_endpoint);
        let response = self
            .request_json("GET", &url, connection, secrets, None)
            .await?;

        let items: Vec<Value> = match &endpoint.items_path {
            Some(path) => jsonpath_lib::select(&response, path)
                .map_err(|err| {
                    EngineError::Value(format!("invalid items_path '{path}': {err}"))
                })?
                .into_iter()
                .flat_map(|v| match v {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                })
                .collect(),
            None => match response {
                Value::Array(items) => items,
                other => vec![other],
            },
        };

        let name_field = endpoint.name_field.as_deref().unwrap_or("name");
        let id_field = endpoint.id_field.as_deref().unwrap_or("id");
        let nodes = items
            .into_iter()
            .map(|item| {
                let name = item
                    .get(name_field)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| item.to_string());
                let id = item
                    .get(id_field)
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| name.clone());
                let mut node = VfsNode::file(name, id);
                node.metadata = Some(item);
                node
            })
            .collect();
        Ok(nodes)
    }

    async fn get_content(
        &self,
        path_parts: &[String],
        connection: &Connection,
        secrets: &SecretMap,
    ) -> Result<VfsFileContent> {
        let path = path_parts
            .first()
            .ok_or_else(|| EngineError::Value("get_content requires a path".to_string()))?;
        let base = self.base_url(connection, secrets)?;
        let url = Self::join_url(&base, path);
        let response = self
            .request_json("GET", &url, connection, secrets, None)
            .await?;

        let (content, mime_type) = match &response {
            Value::String(text) => (text.clone(), "text/plain".to_string()),
            other => (
                serde_json::to_string_pretty(other)?,
                "application/json".to_string(),
            ),
        };
        Ok(VfsFileContent {
            path: path.clone(),
            size: content.len() as u64,
            mime_type,
            content,
        })
    }

    async fn run_declarative_action(
        &self,
        connection: &Connection,
        secrets: &SecretMap,
        template_key: &str,
        input: &Map<String, Value>,
        dry_run: bool,
    ) -> Result<Value> {
        let template = Self::action_template(connection, template_key)?.clone();
        let catalog = connection.catalog().ok_or_else(|| {
            EngineError::Value(format!(
                "connection '{}' is missing its catalog/blueprint",
                connection.name
            ))
        })?;

        // User parameters are visible at the top level of the render context
        // alongside connection details and secrets.
        let mut full_context = Map::new();
        full_context.insert("details".to_string(), Value::Object(connection.details.clone()));
        full_context.insert("secrets".to_string(), serde_json::to_value(secrets)?);
        for (key, value) in input {
            full_context.insert(key.clone(), value.clone());
        }
        let mut full_context = Value::Object(full_context);

        let rendered_input = self
            .renderer
            .render_value(&Value::Object(input.clone()), &full_context)?;
        let processed_input = Self::process_directives(&rendered_input)?;

        if let Some(schema_name) = &template.parameters_schema {
            validate_against_schema(catalog, schema_name, &processed_input, "parameters")?;
        }

        // Templates in the endpoint and payload see the validated parameters
        // under `context`.
        full_context["context"] = processed_input.clone();

        let endpoint_template = template.api_endpoint.as_deref().ok_or_else(|| {
            EngineError::Value(format!(
                "action template '{template_key}' is missing 'api_endpoint'"
            ))
        })?;
        let mut endpoint = self.renderer.render_str(endpoint_template, &full_context)?;

        if !template.query_params.is_empty() {
            let mut pairs = Vec::new();
            for (key, value_template) in &template.query_params {
                let value = self.renderer.render_str(value_template, &full_context)?;
                pairs.push(format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(&value)
                ));
            }
            let separator = if endpoint.contains('?') { '&' } else { '?' };
            endpoint = format!("{endpoint}{separator}{}", pairs.join("&"));
        }

        let method = template.http_method.to_uppercase();
        let body = if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
            let payload = match &template.payload_template {
                Some(payload_template) => {
                    self.renderer.render_value(payload_template, &full_context)?
                }
                None => processed_input.clone(),
            };
            if let Some(schema_name) = &template.payload_schema {
                validate_against_schema(catalog, schema_name, &payload, "payload")?;
            }
            Some(payload)
        } else {
            None
        };

        if dry_run {
            info!(template_key = %template_key, "rest.declarative_action.dry_run");
            return Ok(json!({
                "dry_run_status": "success",
                "message": format!("Would make a {method} request to {endpoint} with a valid payload."),
            }));
        }

        let base = self.base_url(connection, secrets)?;
        let url = Self::join_url(&base, &endpoint);
        debug!(template_key = %template_key, method = %method, url = %url, "rest.declarative_action.executing");
        self.request_json(&method, &url, connection, secrets, body.as_ref())
            .await
    }
}
