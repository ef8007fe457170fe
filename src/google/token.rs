//! Access-token loading.
//!
//! The token is issued and refreshed outside this tool; here it is only read
//! from the environment or from the JSON file written by Google's
//! installed-app flow.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("No access token: set GPHOTOS_ACCESS_TOKEN or create {0}")]
    Missing(PathBuf),

    #[error("Failed to read token file {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed token file {path}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Access token in {path} expired at {expiry}; refresh it and re-run")]
    Expired { path: PathBuf, expiry: DateTime<Utc> },

    #[error("Token file {0} contains an empty token")]
    Empty(PathBuf),
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    #[serde(alias = "access_token")]
    token: Option<String>,
    expiry: Option<String>,
}

/// Resolve the bearer token. An explicit token (from the environment or the
/// CLI) wins over the token file and is never checked for expiry.
pub fn load_access_token(
    explicit: Option<&str>,
    path: &Path,
    now: DateTime<Utc>,
) -> Result<String, TokenError> {
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TokenError::Missing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(TokenError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let file: TokenFile = serde_json::from_str(&raw).map_err(|source| TokenError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(expiry) = file.expiry.as_deref().and_then(parse_expiry) {
        if expiry <= now {
            return Err(TokenError::Expired {
                path: path.to_path_buf(),
                expiry,
            });
        }
        tracing::debug!(%expiry, "Access token loaded from file");
    }

    match file.token {
        Some(t) if !t.trim().is_empty() => Ok(t.trim().to_string()),
        _ => Err(TokenError::Empty(path.to_path_buf())),
    }
}

/// google-auth writes naive UTC timestamps; other writers use RFC 3339.
fn parse_expiry(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    match NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => Some(naive.and_utc()),
        Err(_) => {
            tracing::warn!(expiry = s, "Unrecognised token expiry format, ignoring");
            None
        }
    }
}
