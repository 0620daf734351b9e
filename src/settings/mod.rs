//! # Settings
//!
//! Process-level configuration, resolved once from the environment.
//!
//! All engine state lives under a single home directory (`CX_HOME`, default
//! `~/.cx`):
//!
//! | Subdirectory  | Contents                                   |
//! |---------------|--------------------------------------------|
//! | `cache/`      | content-addressed objects (`<2>/<62>`)     |
//! | `runs/`       | one directory per run, with `manifest.json`|
//! | `connections/`| `<alias>.conn.yaml` connection files       |
//! | `secrets/`    | `<alias>.secret.env` secret files          |
//! | `blueprints/` | unpacked blueprint packages                |
//! | `flows/`      | shared flow documents for `run_flow`       |
//! | `git/`        | clone cache for the git strategy           |

use std::path::{Path, PathBuf};

/// Default threshold below which step results are embedded inline in status
/// events (256 KiB of JSON-encoded payload).
pub const DEFAULT_INLINE_THRESHOLD_BYTES: usize = 256 * 1024;

/// Default number of recent run manifests scanned on a cache lookup.
pub const DEFAULT_CACHE_SCAN_DEPTH: usize = 100;

/// Default timeout applied to HTTP clients built by strategies.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

const DEFAULT_BLUEPRINT_REGISTRY: &str =
    "https://github.com/cxflow-io/blueprints/releases/download";

/// Engine configuration knobs plus the home-directory layout.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    /// Inline-vs-claim-check threshold for status event payloads, in bytes.
    pub inline_threshold_bytes: usize,
    /// How many recent manifests the cache index scans per lookup.
    pub cache_scan_depth: usize,
    pub http_timeout_secs: u64,
    /// Base URL blueprint archives are fetched from on a cache miss.
    pub blueprint_registry_url: String,
    /// Optional directory of bundled blueprint assets shipped with the binary.
    pub bundled_assets_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cx");
        Self {
            home,
            inline_threshold_bytes: DEFAULT_INLINE_THRESHOLD_BYTES,
            cache_scan_depth: DEFAULT_CACHE_SCAN_DEPTH,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            blueprint_registry_url: DEFAULT_BLUEPRINT_REGISTRY.to_string(),
            bundled_assets_dir: None,
        }
    }
}

impl Settings {
    /// Loads settings from the environment, falling back to defaults.
    ///
    /// Recognized variables: `CX_HOME`, `CX_INLINE_THRESHOLD_BYTES`,
    /// `CX_CACHE_SCAN_DEPTH`, `CX_HTTP_TIMEOUT_SECS`,
    /// `CX_BLUEPRINT_REGISTRY`, `CX_ASSETS_DIR`.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(home) = std::env::var("CX_HOME") {
            if !home.trim().is_empty() {
                settings.home = PathBuf::from(home);
            }
        }
        if let Some(v) = parse_env::<usize>("CX_INLINE_THRESHOLD_BYTES") {
            settings.inline_threshold_bytes = v;
        }
        if let Some(v) = parse_env::<usize>("CX_CACHE_SCAN_DEPTH") {
            settings.cache_scan_depth = v.max(1);
        }
        if let Some(v) = parse_env::<u64>("CX_HTTP_TIMEOUT_SECS") {
            settings.http_timeout_secs = v.max(1);
        }
        if let Ok(url) = std::env::var("CX_BLUEPRINT_REGISTRY") {
            if !url.trim().is_empty() {
                settings.blueprint_registry_url = url;
            }
        }
        if let Ok(dir) = std::env::var("CX_ASSETS_DIR") {
            if !dir.trim().is_empty() {
                settings.bundled_assets_dir = Some(PathBuf::from(dir));
            }
        }

        settings
    }

    /// Builds settings rooted at an explicit home directory. Used by tests
    /// and by embedders that manage their own layout.
    pub fn for_home(home: impl AsRef<Path>) -> Self {
        Self {
            home: home.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn connections_dir(&self) -> PathBuf {
        self.home.join("connections")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.home.join("secrets")
    }

    pub fn blueprints_dir(&self) -> PathBuf {
        self.home.join("blueprints")
    }

    pub fn flows_dir(&self) -> PathBuf {
        self.home.join("flows")
    }

    pub fn git_dir(&self) -> PathBuf {
        self.home.join("git")
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::for_home("/tmp/cx-test-home");
        assert_eq!(settings.inline_threshold_bytes, 256 * 1024);
        assert_eq!(settings.cache_scan_depth, 100);
        assert_eq!(settings.http_timeout_secs, 30);
    }

    #[test]
    fn test_home_layout() {
        let settings = Settings::for_home("/srv/cx");
        assert_eq!(settings.cache_dir(), PathBuf::from("/srv/cx/cache"));
        assert_eq!(settings.runs_dir(), PathBuf::from("/srv/cx/runs"));
        assert_eq!(
            settings.connections_dir(),
            PathBuf::from("/srv/cx/connections")
        );
        assert_eq!(settings.git_dir(), PathBuf::from("/srv/cx/git"));
    }
}
