//! Application error types.
//!
//! These errors are serializable so the request broker can hand a structured
//! failure back across the messaging channel.

use serde::Serialize;
use thiserror::Error;

/// Application-level errors produced by the merge-request pipeline.
///
/// All variants serialize to a structured JSON object for the page context.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AppError {
    /// SQLite operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },

    /// GitLab API request returned a non-success status.
    #[error("GitLab API error: {message}")]
    GitLabApi {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Network request failed before a response arrived.
    #[error("Network error: {message}")]
    Network { message: String },

    /// Base URL or project mapping is missing or malformed.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },

    /// GitLab answered with a body of unexpected shape.
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Internal application error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: None,
        }
    }

    /// Create a database error with operation context.
    pub fn database_with_op(message: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a GitLab API error with status code and endpoint.
    pub fn gitlab_api_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::GitLabApi {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            field: None,
        }
    }

    /// Create an invalid configuration error naming the offending setting.
    pub fn invalid_config_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a protocol error for an endpoint that returned an unexpected shape.
    pub fn protocol(message: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::GitLabApi { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// Whether this error means the pipeline should quietly produce nothing.
    pub fn is_invalid_config(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }
}

// Conversions from common error types

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("Request timed out")
        } else if err.is_connect() {
            Self::network("Failed to connect to server")
        } else if let Some(status) = err.status() {
            Self::GitLabApi {
                message: format!("HTTP error: {}", err),
                status_code: Some(status.as_u16()),
                endpoint: None,
            }
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {}", err))
    }
}

impl From<crate::db::DbError> for AppError {
    fn from(err: crate::db::DbError) -> Self {
        Self::database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let err = AppError::database_with_op("disk I/O error", "set kv_entries");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"Database\""));
        assert!(json.contains("disk I/O error"));
        assert!(json.contains("set kv_entries"));
    }

    #[test]
    fn test_gitlab_api_error_full() {
        let err = AppError::gitlab_api_full("Not Found", 404, "/projects/7/merge_requests");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"status_code\":404"));
        assert!(json.contains("/projects/7/merge_requests"));
        assert_eq!(err.status_code(), Some(404));
    }

    #[test]
    fn test_optional_fields_not_serialized() {
        let err = AppError::invalid_config("missing base URL");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("field"));
        assert!(err.is_invalid_config());
        assert_eq!(err.status_code(), None);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = AppError::protocol("expected a JSON array", "/projects/1/members/all");
        assert_eq!(format!("{}", err), "Protocol error: expected a JSON array");
    }
}
