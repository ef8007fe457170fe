use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A media item as listed by the remote index. Never mutated locally.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub filename: String,
    pub creation_time: DateTime<Utc>,
    /// Content URL; only valid for about an hour after listing.
    pub base_url: String,
    pub mime_type: Option<String>,
    pub metadata: MediaMetadata,
}

impl MediaItem {
    pub fn is_video(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|m| m.starts_with("video/"))
    }

    /// URL returning the original bytes: `=dv` for videos, `=d` otherwise.
    pub fn download_url(&self) -> String {
        let suffix = if self.is_video() { "dv" } else { "d" };
        format!("{}={}", self.base_url, suffix)
    }
}

/// Descriptive metadata persisted next to the ledger record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
}

/// An album as returned by the album listing, before member enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumSummary {
    pub id: String,
    pub title: String,
    pub item_count: Option<u64>,
}

/// Per-run snapshot of an album and the ids of its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumEntry {
    pub id: String,
    pub title: String,
    pub members: Vec<String>,
}

// ── Wire formats ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SearchResponse {
    #[serde(default)]
    pub media_items: Vec<MediaItemWire>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AlbumsResponse {
    #[serde(default)]
    pub albums: Vec<AlbumWire>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MediaItemWire {
    pub id: String,
    pub filename: Option<String>,
    pub base_url: Option<String>,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub media_metadata: MediaMetadataWire,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MediaMetadataWire {
    pub creation_time: Option<DateTime<Utc>>,
    // int64 fields are JSON strings in this API
    pub width: Option<String>,
    pub height: Option<String>,
    pub photo: Option<PhotoWire>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PhotoWire {
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AlbumWire {
    pub id: String,
    pub title: Option<String>,
    pub media_items_count: Option<String>,
}

impl MediaItemWire {
    /// Convert to a [`MediaItem`], returning `None` (with a warning) when the
    /// API omitted a field the sync path depends on.
    pub(crate) fn into_item(self) -> Option<MediaItem> {
        let Some(creation_time) = self.media_metadata.creation_time else {
            tracing::warn!(id = %self.id, "Media item has no creationTime, ignoring");
            return None;
        };
        let Some(base_url) = self.base_url else {
            tracing::warn!(id = %self.id, "Media item has no baseUrl, ignoring");
            return None;
        };
        let filename = match self.filename {
            Some(f) if !f.is_empty() => f,
            _ => {
                tracing::warn!(id = %self.id, "Media item has no filename, ignoring");
                return None;
            }
        };
        let photo = self.media_metadata.photo.unwrap_or_default();
        Some(MediaItem {
            id: self.id,
            filename,
            creation_time,
            base_url,
            mime_type: self.mime_type,
            metadata: MediaMetadata {
                width: self.media_metadata.width.and_then(|w| w.parse().ok()),
                height: self.media_metadata.height.and_then(|h| h.parse().ok()),
                camera_make: photo.camera_make,
                camera_model: photo.camera_model,
            },
        })
    }
}

impl From<AlbumWire> for AlbumSummary {
    fn from(wire: AlbumWire) -> Self {
        Self {
            title: wire.title.unwrap_or_default(),
            item_count: wire.media_items_count.and_then(|c| c.parse().ok()),
            id: wire.id,
        }
    }
}
