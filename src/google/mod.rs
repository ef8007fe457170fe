//! Google Photos Library API: the remote media index. The sync engine and
//! album linker only see the [`MediaIndex`] trait; [`GooglePhotosClient`] is
//! the REST implementation used by the binary.

mod client;
pub mod error;
mod index;
mod item;
pub mod token;

pub use client::GooglePhotosClient;
pub use error::RemoteError;
pub use index::{AlbumPage, MediaIndex, MediaPage};
pub use item::{AlbumEntry, AlbumSummary, MediaItem, MediaMetadata};

#[cfg(test)]
pub(crate) use index::StaticIndex;
