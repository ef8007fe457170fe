use thiserror::Error;

/// Errors talking to the Photos Library API.
///
/// `is_retryable()` separates transient failures (rate limits, server errors,
/// dropped connections) from ones a retry cannot fix (bad token, malformed
/// responses).
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("Malformed API response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => *status == 429 || *status >= 500,
            RemoteError::Http(e) => !e.is_decode() && !e.is_builder(),
            RemoteError::Decode(_) => false,
        }
    }

    /// HTTP 401/403 mean the access token is expired or lacks the
    /// `photoslibrary.readonly` scope.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, RemoteError::Status { status: 401 | 403, .. })
    }
}
