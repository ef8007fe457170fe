use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::error::RemoteError;
use super::index::{AlbumPage, MediaIndex, MediaPage};
use super::item::{AlbumsResponse, MediaItemWire, SearchResponse};
use crate::retry::{self, RetryAction, RetryConfig};
use crate::types::SyncWindow;

const DEFAULT_BASE_URL: &str = "https://photoslibrary.googleapis.com";

/// Maximum page sizes accepted by the API.
const MEDIA_PAGE_SIZE: u32 = 100;
const ALBUM_PAGE_SIZE: u32 = 50;

/// Error bodies are echoed into logs; keep them short.
const MAX_ERROR_BODY: usize = 512;

/// REST client for the Photos Library API.
///
/// Every listing call is retried with backoff on transient failures; the
/// caller sees an error only once retries are exhausted.
pub struct GooglePhotosClient {
    http: Client,
    base_url: String,
    access_token: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for GooglePhotosClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GooglePhotosClient")
            .field("base_url", &self.base_url)
            .field("access_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl GooglePhotosClient {
    pub fn new(access_token: impl Into<String>, retry: RetryConfig) -> Result<Self, RemoteError> {
        Self::with_base_url(DEFAULT_BASE_URL, access_token, retry)
    }

    pub fn with_base_url(
        base_url: &str,
        access_token: impl Into<String>,
        retry: RetryConfig,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            retry,
        })
    }

    /// Client for fetching content bytes. Content URLs are pre-signed, so the
    /// bearer token is not attached to them.
    pub fn download_client(&self) -> Client {
        self.http.clone()
    }

    async fn search(&self, body: Value) -> Result<MediaPage, RemoteError> {
        let url = format!("{}/v1/mediaItems:search", self.base_url);
        let (url, body) = (url.as_str(), &body);
        let response: SearchResponse =
            retry::retry_with_backoff(&self.retry, "mediaItems:search", classify, move || async move {
                let resp = self
                    .http
                    .post(url)
                    .bearer_auth(&self.access_token)
                    .json(body)
                    .send()
                    .await?;
                read_json(resp).await
            })
            .await?;

        Ok(MediaPage {
            items: response
                .media_items
                .into_iter()
                .filter_map(MediaItemWire::into_item)
                .collect(),
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl MediaIndex for GooglePhotosClient {
    async fn list_media_items(
        &self,
        window: &SyncWindow,
        page_token: Option<&str>,
    ) -> Result<MediaPage, RemoteError> {
        let mut body = json!({
            "pageSize": MEDIA_PAGE_SIZE,
            "filters": {
                "dateFilter": {
                    "ranges": [{
                        "startDate": date_json(window.start()),
                        "endDate": date_json(window.end()),
                    }]
                }
            }
        });
        if let Some(token) = page_token {
            body["pageToken"] = Value::String(token.to_string());
        }
        tracing::debug!(window = %window, page_token, "Listing media items");
        self.search(body).await
    }

    async fn list_albums(&self, page_token: Option<&str>) -> Result<AlbumPage, RemoteError> {
        let url = format!("{}/v1/albums", self.base_url);
        let mut query = vec![("pageSize", ALBUM_PAGE_SIZE.to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let (url, query) = (url.as_str(), &query);
        tracing::debug!(page_token, "Listing albums");
        let response: AlbumsResponse =
            retry::retry_with_backoff(&self.retry, "albums.list", classify, move || async move {
                let resp = self
                    .http
                    .get(url)
                    .bearer_auth(&self.access_token)
                    .query(query)
                    .send()
                    .await?;
                read_json(resp).await
            })
            .await?;

        Ok(AlbumPage {
            albums: response.albums.into_iter().map(Into::into).collect(),
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn list_album_items(
        &self,
        album_id: &str,
        page_token: Option<&str>,
    ) -> Result<MediaPage, RemoteError> {
        let mut body = json!({
            "albumId": album_id,
            "pageSize": MEDIA_PAGE_SIZE,
        });
        if let Some(token) = page_token {
            body["pageToken"] = Value::String(token.to_string());
        }
        tracing::debug!(album_id, page_token, "Listing album items");
        self.search(body).await
    }
}

fn classify(e: &RemoteError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

fn date_json(date: chrono::NaiveDate) -> Value {
    use chrono::Datelike;
    json!({"year": date.year(), "month": date.month(), "day": date.day()})
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        let body: String = text.chars().take(MAX_ERROR_BODY).collect();
        return Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(serde_json::from_str(&text)?)
}
