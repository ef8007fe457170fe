use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use crate::retry::{self, RetryAction, RetryConfig};

pub(crate) const PART_EXTENSION: &str = "part";

/// Hidden temp file next to the destination: `dir/.name.part`.
///
/// Same directory so the final rename never crosses filesystems.
pub(crate) fn part_path(download_path: &Path) -> PathBuf {
    let name = download_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    download_path.with_file_name(format!(".{name}.{PART_EXTENSION}"))
}

/// Download `url` to `download_path` via a `.part` temp file.
///
/// Each attempt deletes any existing `.part` file and starts from scratch.
/// On completion the `.part` file is renamed onto the destination, so the
/// destination either does not exist or holds the complete body. Retries
/// with exponential backoff on transient failures. Returns the byte count.
pub async fn download_file(
    client: &Client,
    url: &str,
    download_path: &Path,
    retry_config: &RetryConfig,
) -> Result<u64, DownloadError> {
    let part_path = part_path(download_path);
    let what = download_path.display().to_string();

    let result = retry::retry_with_backoff(
        retry_config,
        &what,
        |e: &DownloadError| {
            if e.is_retryable() {
                RetryAction::Retry
            } else {
                RetryAction::Abort
            }
        },
        || async {
            let _ = fs::remove_file(&part_path).await;
            attempt_download(client, url, download_path, &part_path).await
        },
    )
    .await;

    match result {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            let _ = fs::remove_file(&part_path).await;
            if e.is_retryable() {
                Err(DownloadError::RetriesExhausted {
                    retries: retry_config.max_retries,
                    path: what,
                    last_error: e.to_string(),
                })
            } else {
                Err(e)
            }
        }
    }
}

/// Single download attempt.
async fn attempt_download(
    client: &Client,
    url: &str,
    download_path: &Path,
    part_path: &Path,
) -> Result<u64, DownloadError> {
    let path_str = download_path.display().to_string();
    let response = client.get(url).send().await.map_err(|e| DownloadError::Http {
        source: e,
        path: path_str.clone(),
    })?;

    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus {
            status: response.status().as_u16(),
            path: path_str,
        });
    }

    let content_length = response.content_length();

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part_path)
        .await?;

    let mut bytes_written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::warn!(
                path = %path_str,
                content_length,
                bytes_written,
                error = %e,
                "Body stream error"
            );
            DownloadError::Http {
                source: e,
                path: path_str.clone(),
            }
        })?;
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    if let Some(expected) = content_length {
        if expected != bytes_written {
            return Err(DownloadError::Truncated {
                expected,
                actual: bytes_written,
                path: path_str,
            });
        }
    }

    fs::rename(part_path, download_path).await?;

    Ok(bytes_written)
}
