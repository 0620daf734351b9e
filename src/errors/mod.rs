// Module: Errors
// Typed error kinds shared across the engine. Strategies fail with these and
// the scheduler propagates them verbatim.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Every failure the engine can surface, by kind.
///
/// `Validation` stops a run before any step executes; `Template` wraps the
/// offending template source; the remaining kinds originate inside strategies
/// or the stores and fail the step they occurred in.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("template rendering failed for '{template}': {message}")]
    Template { template: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("invalid value: {0}")]
    Value(String),

    #[error("action '{action}' is not implemented by the '{strategy}' strategy")]
    NotImplemented { strategy: String, action: String },
}

impl EngineError {
    pub fn template(template: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Template {
            template: template.into(),
            message: message.to_string(),
        }
    }

    pub fn not_implemented(strategy: impl Into<String>, action: impl Into<String>) -> Self {
        Self::NotImplemented {
            strategy: strategy.into(),
            action: action.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Value(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Value(format!("YAML: {err}"))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Io(err.to_string())
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Io(format!("SQL: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_implemented_message_names_strategy_and_action() {
        let err = EngineError::not_implemented("fs-declarative", "run_sql_query");
        let msg = err.to_string();
        assert!(msg.contains("run_sql_query"));
        assert!(msg.contains("fs-declarative"));
    }

    #[test]
    fn test_io_not_found_maps_to_not_found_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.yaml");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_template_error_carries_source() {
        let err = EngineError::template("{{ broken", "unexpected end of template");
        assert!(err.to_string().contains("{{ broken"));
    }
}
