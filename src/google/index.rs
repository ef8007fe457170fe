use async_trait::async_trait;

use super::error::RemoteError;
use super::item::{AlbumSummary, MediaItem};
use crate::types::SyncWindow;

/// One page of media items plus the continuation token, if any.
#[derive(Debug, Clone, Default)]
pub struct MediaPage {
    pub items: Vec<MediaItem>,
    pub next_page_token: Option<String>,
}

/// One page of albums plus the continuation token, if any.
#[derive(Debug, Clone, Default)]
pub struct AlbumPage {
    pub albums: Vec<AlbumSummary>,
    pub next_page_token: Option<String>,
}

/// Paginated, read-only view of the remote library.
///
/// Object-safe so the engine can hold a `&dyn MediaIndex`; tests substitute
/// an in-memory index.
#[async_trait]
pub trait MediaIndex: Send + Sync {
    /// Items whose creation date falls inside `window` (inclusive).
    async fn list_media_items(
        &self,
        window: &SyncWindow,
        page_token: Option<&str>,
    ) -> Result<MediaPage, RemoteError>;

    async fn list_albums(&self, page_token: Option<&str>) -> Result<AlbumPage, RemoteError>;

    async fn list_album_items(
        &self,
        album_id: &str,
        page_token: Option<&str>,
    ) -> Result<MediaPage, RemoteError>;
}

/// In-memory index serving fixed data in pages, with offsets as page tokens.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct StaticIndex {
    pub items: Vec<MediaItem>,
    pub albums: Vec<(AlbumSummary, Vec<MediaItem>)>,
    pub page_size: usize,
    pub fail_listing: bool,
}

#[cfg(test)]
impl StaticIndex {
    pub fn new(items: Vec<MediaItem>) -> Self {
        Self {
            items,
            page_size: 2,
            ..Default::default()
        }
    }

    fn page<T: Clone>(&self, all: &[T], page_token: Option<&str>) -> (Vec<T>, Option<String>) {
        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size.max(1)).min(all.len());
        let next = (end < all.len()).then(|| end.to_string());
        (all[start.min(end)..end].to_vec(), next)
    }
}

#[cfg(test)]
#[async_trait]
impl MediaIndex for StaticIndex {
    async fn list_media_items(
        &self,
        window: &SyncWindow,
        page_token: Option<&str>,
    ) -> Result<MediaPage, RemoteError> {
        if self.fail_listing {
            return Err(RemoteError::Status {
                status: 503,
                body: "backend unavailable".to_string(),
            });
        }
        let in_window: Vec<MediaItem> = self
            .items
            .iter()
            .filter(|i| window.contains(i.creation_time.date_naive()))
            .cloned()
            .collect();
        let (items, next_page_token) = self.page(&in_window, page_token);
        Ok(MediaPage {
            items,
            next_page_token,
        })
    }

    async fn list_albums(&self, page_token: Option<&str>) -> Result<AlbumPage, RemoteError> {
        let summaries: Vec<AlbumSummary> = self.albums.iter().map(|(a, _)| a.clone()).collect();
        let (albums, next_page_token) = self.page(&summaries, page_token);
        Ok(AlbumPage {
            albums,
            next_page_token,
        })
    }

    async fn list_album_items(
        &self,
        album_id: &str,
        page_token: Option<&str>,
    ) -> Result<MediaPage, RemoteError> {
        let members = self
            .albums
            .iter()
            .find(|(a, _)| a.id == album_id)
            .map(|(_, m)| m.clone())
            .unwrap_or_default();
        let (items, next_page_token) = self.page(&members, page_token);
        Ok(MediaPage {
            items,
            next_page_token,
        })
    }
}
