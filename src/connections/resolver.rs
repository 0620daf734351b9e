//! Connection resolution and blueprint package loading.
//!
//! A connection source of the form `user:<alias>` resolves to
//! `<cx_home>/connections/<alias>.conn.yaml` plus a co-located secrets file
//! `<cx_home>/secrets/<alias>.secret.env`. The connection file names a
//! blueprint (`<namespace>/<name>@<version>`) which is located by checking,
//! in order: the user blueprint cache, bundled assets, and finally a remote
//! archive fetch. Downloaded packages unpack through a staging directory and
//! an atomic rename so concurrent first-use across runs is safe.

use std::io::Read;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::connections::{ApiCatalog, Connection, SecretMap};
use crate::errors::{EngineError, Result};
use crate::settings::Settings;

static BLUEPRINT_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<namespace>[\w-]+)/(?P<name>[\w-]+)@(?P<version>[\w.-]+)$")
        .expect("valid blueprint id regex")
});

pub struct ConnectionResolver {
    settings: Settings,
    http: reqwest::Client,
}

impl ConnectionResolver {
    pub fn new(settings: Settings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.http_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { settings, http }
    }

    /// Resolves a connection source to a `(Connection, SecretMap)` pair,
    /// loading the referenced blueprint package on first use.
    pub async fn resolve(&self, source: &str) -> Result<(Connection, SecretMap)> {
        let Some(alias) = source.strip_prefix("user:") else {
            return Err(EngineError::Value(format!(
                "unknown connection source protocol: '{source}'"
            )));
        };

        let conn_path = self
            .settings
            .connections_dir()
            .join(format!("{alias}.conn.yaml"));
        if !conn_path.is_file() {
            return Err(EngineError::NotFound(format!(
                "user connection '{alias}' not found at: {}",
                conn_path.display()
            )));
        }

        let raw = std::fs::read_to_string(&conn_path)?;
        let mut connection: Connection = serde_yaml::from_str(&raw).map_err(|err| {
            EngineError::Validation(format!(
                "invalid schema in '{}': {err}",
                conn_path.display()
            ))
        })?;
        if connection.id.is_empty() {
            connection.id = format!("user:{alias}");
        }

        if connection.catalog.is_none() {
            if let Some(catalog_id) = connection.api_catalog_id.clone() {
                if BLUEPRINT_ID_RE.is_match(&catalog_id) {
                    match self.load_blueprint(&catalog_id).await {
                        Ok(catalog) => connection.catalog = Some(catalog),
                        Err(err) => {
                            warn!(blueprint = %catalog_id, error = %err, "resolver.blueprint_load_failed");
                            return Err(err);
                        }
                    }
                }
            }
        }

        let secrets = self.load_secrets(alias)?;
        debug!(source = %source, connection = %connection.name, "resolver.resolved");
        Ok((connection, secrets))
    }

    fn load_secrets(&self, alias: &str) -> Result<SecretMap> {
        let path = self
            .settings
            .secrets_dir()
            .join(format!("{alias}.secret.env"));
        let mut secrets = SecretMap::new();
        if !path.is_file() {
            return Ok(secrets);
        }
        for item in dotenvy::from_path_iter(&path)
            .map_err(|err| EngineError::Io(format!("could not read secrets file: {err}")))?
        {
            let (key, value) =
                item.map_err(|err| EngineError::Value(format!("invalid secrets line: {err}")))?;
            secrets.insert(key.to_lowercase(), value);
        }
        Ok(secrets)
    }

    /// Loads a blueprint package (`ApiCatalog` plus optional `schemas.json`)
    /// by its `<namespace>/<name>@<version>` id.
    pub async fn load_blueprint(&self, blueprint_id: &str) -> Result<ApiCatalog> {
        let captures = BLUEPRINT_ID_RE.captures(blueprint_id).ok_or_else(|| {
            EngineError::Value(format!(
                "'{blueprint_id}' is not a valid blueprint id (expected 'namespace/name@version')"
            ))
        })?;
        let namespace = &captures["namespace"];
        let name = &captures["name"];
        let version = captures["version"].trim_start_matches('v').to_string();

        let package_dir = self
            .ensure_package(namespace, name, &version, blueprint_id)
            .await?;
        self.load_package(&package_dir, blueprint_id)
    }

    /// Locates the package directory, fetching and unpacking on a miss.
    async fn ensure_package(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
        blueprint_id: &str,
    ) -> Result<PathBuf> {
        let cache_dir = self
            .settings
            .blueprints_dir()
            .join(namespace)
            .join(name)
            .join(version);
        if cache_dir.join("blueprint.cx.yaml").is_file() {
            debug!(path = %cache_dir.display(), "resolver.blueprint.cache_hit");
            return Ok(cache_dir);
        }

        if let Some(assets) = &self.settings.bundled_assets_dir {
            let bundled = assets.join("blueprints").join(namespace).join(name);
            if bundled.join("blueprint.cx.yaml").is_file() {
                debug!(path = %bundled.display(), "resolver.blueprint.bundled");
                return Ok(bundled);
            }
        }

        info!(blueprint = %blueprint_id, "resolver.blueprint.fetching");
        let url = format!(
            "{}/{namespace}-{name}-v{version}/{name}.zip",
            self.settings.blueprint_registry_url.trim_end_matches('/')
        );

        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(format!(
                "blueprint '{blueprint_id}' not found in cache, bundled assets or at {url}"
            )));
        }
        if !response.status().is_success() {
            return Err(EngineError::Io(format!(
                "failed to download blueprint '{blueprint_id}': HTTP {}",
                response.status()
            )));
        }
        let archive = response.bytes().await?.to_vec();

        let target = cache_dir.clone();
        tokio::task::spawn_blocking(move || unpack_archive(&archive, &target))
            .await
            .map_err(|err| EngineError::Io(format!("blueprint unpack task failed: {err}")))??;

        info!(path = %cache_dir.display(), "resolver.blueprint.unpacked");
        Ok(cache_dir)
    }

    fn load_package(&self, package_dir: &Path, blueprint_id: &str) -> Result<ApiCatalog> {
        let blueprint_path = package_dir.join("blueprint.cx.yaml");
        let raw = std::fs::read_to_string(&blueprint_path).map_err(|_| {
            EngineError::NotFound(format!(
                "blueprint package '{blueprint_id}' is missing blueprint.cx.yaml"
            ))
        })?;
        let mut catalog: ApiCatalog = serde_yaml::from_str(&raw).map_err(|err| {
            EngineError::Validation(format!("invalid blueprint '{blueprint_id}': {err}"))
        })?;

        let schemas_path = package_dir.join("schemas.json");
        if schemas_path.is_file() {
            let raw = std::fs::read_to_string(&schemas_path)?;
            let schemas: Map<String, Value> = serde_json::from_str(&raw).map_err(|err| {
                EngineError::Validation(format!(
                    "invalid schemas.json in blueprint '{blueprint_id}': {err}"
                ))
            })?;
            catalog.schemas = Some(schemas);
        }

        Ok(catalog)
    }
}

/// Unpacks a zip archive into `target` via a sibling staging directory and a
/// final rename. Losing the rename race to a concurrent unpack is success.
fn unpack_archive(archive: &[u8], target: &Path) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| EngineError::Io("blueprint cache path has no parent".to_string()))?;
    std::fs::create_dir_all(parent)?;

    let staging = tempfile::tempdir_in(parent)
        .map_err(|err| EngineError::Io(format!("could not create staging directory: {err}")))?;

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive))
        .map_err(|err| EngineError::Io(format!("invalid blueprint archive: {err}")))?;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| EngineError::Io(format!("corrupt blueprint archive: {err}")))?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            continue;
        };
        let out_path = staging.path().join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(dir) = out_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            std::fs::write(&out_path, bytes)?;
        }
    }

    let staged = staging.into_path();
    match std::fs::rename(&staged, target) {
        Ok(()) => Ok(()),
        Err(_) if target.join("blueprint.cx.yaml").is_file() => {
            let _ = std::fs::remove_dir_all(&staged);
            Ok(())
        }
        Err(err) => {
            let _ = std::fs::remove_dir_all(&staged);
            Err(EngineError::Io(format!(
                "could not move blueprint into cache: {err}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_connection_fixture(home: &Path) {
        let connections = home.join("connections");
        let secrets = home.join("secrets");
        std::fs::create_dir_all(&connections).unwrap();
        std::fs::create_dir_all(&secrets).unwrap();

        std::fs::write(
            connections.join("warehouse.conn.yaml"),
            "name: Warehouse\napi_catalog_id: community/postgres@1.0.0\ndetails:\n  host: db.internal\n  database: analytics\n",
        )
        .unwrap();
        std::fs::write(
            secrets.join("warehouse.secret.env"),
            "DB_USER=svc\nDB_PASSWORD=hunter2\n",
        )
        .unwrap();

        let blueprint_dir = home.join("blueprints/community/postgres/1.0.0");
        std::fs::create_dir_all(&blueprint_dir).unwrap();
        std::fs::write(
            blueprint_dir.join("blueprint.cx.yaml"),
            "connector_provider_key: sql-postgres\n",
        )
        .unwrap();
        std::fs::write(
            blueprint_dir.join("schemas.json"),
            r#"{"QueryParams": {"type": "object"}}"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_user_connection_with_blueprint_and_secrets() {
        let home = tempfile::tempdir().unwrap();
        write_connection_fixture(home.path());
        let resolver = ConnectionResolver::new(Settings::for_home(home.path()));

        let (connection, secrets) = resolver.resolve("user:warehouse").await.unwrap();
        assert_eq!(connection.id, "user:warehouse");
        assert_eq!(
            connection.catalog.as_ref().unwrap().connector_provider_key,
            "sql-postgres"
        );
        assert!(connection
            .catalog
            .as_ref()
            .unwrap()
            .schema("QueryParams")
            .is_some());

        // Secret keys are downcased on load.
        assert_eq!(secrets.get("db_user").map(String::as_str), Some("svc"));
        assert_eq!(
            secrets.get("db_password").map(String::as_str),
            Some("hunter2")
        );
    }

    #[tokio::test]
    async fn test_unknown_source_protocol_is_rejected() {
        let home = tempfile::tempdir().unwrap();
        let resolver = ConnectionResolver::new(Settings::for_home(home.path()));
        assert!(matches!(
            resolver.resolve("vault:warehouse").await,
            Err(EngineError::Value(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_connection_is_not_found() {
        let home = tempfile::tempdir().unwrap();
        let resolver = ConnectionResolver::new(Settings::for_home(home.path()));
        assert!(matches!(
            resolver.resolve("user:ghost").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_blueprint_id_is_rejected() {
        let home = tempfile::tempdir().unwrap();
        let resolver = ConnectionResolver::new(Settings::for_home(home.path()));
        assert!(matches!(
            resolver.load_blueprint("not-an-id").await,
            Err(EngineError::Value(_))
        ));
    }

    #[test]
    fn test_unpack_archive_is_atomic_and_tolerates_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("community/svc/1.0.0");

        let mut archive = Vec::new();
        {
            let mut writer =
                zip::ZipWriter::new(std::io::Cursor::new(&mut archive));
            let options = zip::write::FileOptions::default();
            use std::io::Write;
            writer
                .start_file("blueprint.cx.yaml", options)
                .unwrap();
            writer
                .write_all(b"connector_provider_key: rest-declarative\n")
                .unwrap();
            writer.finish().unwrap();
        }

        unpack_archive(&archive, &target).unwrap();
        assert!(target.join("blueprint.cx.yaml").is_file());

        // A second unpack over the populated target must not fail.
        unpack_archive(&archive, &target).unwrap();
        assert!(target.join("blueprint.cx.yaml").is_file());
    }
}
