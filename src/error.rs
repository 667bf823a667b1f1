use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures surfaced by the conversion service.
///
/// Stage failures inside a running job are recorded on the job as a message
/// and never reach the scheduler; the HTTP layer renders the rest through
/// [`IntoResponse`].
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("None of the requested jobs have completed")]
    NoContent,

    #[error("{tool} exited with code {exit_code:?}: {stderr}")]
    ExternalTool {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exceeded the {seconds}s time limit and was terminated")]
    Timeout { tool: String, seconds: u64 },

    #[error("Failed to fetch {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("{0}")]
    Internal(String),
}

impl ConvertError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "INVALID_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NoContent => "NO_COMPLETED_JOBS",
            Self::ExternalTool { .. } => "EXTERNAL_TOOL_FAILED",
            Self::Launch { .. } => "TOOL_LAUNCH_FAILED",
            Self::Timeout { .. } => "TOOL_TIMEOUT",
            Self::Network { .. } => "NETWORK_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::NoContent => StatusCode::NOT_FOUND,
            Self::ExternalTool { .. } | Self::Network { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Launch { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ConvertError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl From<JsonRejection> for ConvertError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl IntoResponse for ConvertError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "error": {
                    "code": self.code(),
                    "message": self.to_string()
                }
            })),
        )
            .into_response()
    }
}
