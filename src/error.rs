//! Error types for pbr-keeper.
//!
//! Every failure the core can surface to a caller is one of the kinds below.
//! Idempotency checks ("already exists", "already absent") never reach this
//! type; they are absorbed where the kernel object is reconciled.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PbrError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{tool} failed for {object}: {output}")]
    ExternalTool {
        tool: String,
        object: String,
        output: String,
    },

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Teardown finished with {} error(s)", .0.len())]
    Teardown(Vec<PbrError>),

    #[error("File system error: {0}")]
    Io(#[from] std::io::Error),

    /// Plumbing failure that fits no other kind
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PbrError>;

impl PbrError {
    /// Stable machine-readable code used by the HTTP envelope.
    pub fn code(&self) -> &'static str {
        match self {
            PbrError::Validation(_) => "validation",
            PbrError::NotFound(_) => "not_found",
            PbrError::Conflict(_) => "conflict",
            PbrError::ExternalTool { .. } | PbrError::Teardown(_) => "external_tool",
            PbrError::TransientNetwork(_) => "transient_network",
            PbrError::Cancelled => "cancelled",
            PbrError::Io(_) => "io",
            PbrError::Internal(_) => "internal",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PbrError::Cancelled)
    }

    pub(crate) fn tool(tool: &str, object: impl Into<String>, output: impl Into<String>) -> Self {
        PbrError::ExternalTool {
            tool: tool.to_string(),
            object: object.into(),
            output: output.into().trim().to_string(),
        }
    }

    /// Convert to the `{error:{code,message,details}}` envelope.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let details = match self {
            PbrError::ExternalTool {
                tool,
                object,
                output,
            } => Some(serde_json::json!({
                "tool": tool,
                "object": object,
                "output": output,
            })),
            PbrError::Teardown(errors) => Some(serde_json::Value::Array(
                errors
                    .iter()
                    .map(|e| serde_json::json!({ "code": e.code(), "message": e.to_string() }))
                    .collect(),
            )),
            _ => None,
        };

        ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
                details,
            },
        }
    }
}

// Shared single-flight results hand the same error to every waiter.
impl Clone for PbrError {
    fn clone(&self) -> Self {
        match self {
            PbrError::Validation(s) => PbrError::Validation(s.clone()),
            PbrError::NotFound(s) => PbrError::NotFound(s.clone()),
            PbrError::Conflict(s) => PbrError::Conflict(s.clone()),
            PbrError::ExternalTool {
                tool,
                object,
                output,
            } => PbrError::ExternalTool {
                tool: tool.clone(),
                object: object.clone(),
                output: output.clone(),
            },
            PbrError::TransientNetwork(s) => PbrError::TransientNetwork(s.clone()),
            PbrError::Cancelled => PbrError::Cancelled,
            PbrError::Teardown(errors) => PbrError::Teardown(errors.clone()),
            PbrError::Io(e) => PbrError::Io(std::io::Error::new(e.kind(), e.to_string())),
            PbrError::Internal(s) => PbrError::Internal(s.clone()),
        }
    }
}

// Plumbing errors keep their context message. An io root cause maps to
// `Io` with the same kind.
impl From<anyhow::Error> for PbrError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<PbrError>() {
            Ok(inner) => return inner,
            Err(other) => other,
        };
        let io_kind = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<std::io::Error>())
            .map(std::io::Error::kind);
        match io_kind {
            Some(kind) => PbrError::Io(std::io::Error::new(kind, format!("{:#}", err))),
            None => PbrError::Internal(format!("{:#}", err)),
        }
    }
}

/// Error body as returned to HTTP clients.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
