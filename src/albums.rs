//! Album linker: mirrors remote album membership as symlinks into the
//! year-month tree.
//!
//! Albums are not persisted; membership is fetched fresh on each run and
//! resolved against the ledger's downloaded paths.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

use crate::download::paths::{clean_filename, id_suffix, insert_suffix};
use crate::google::{AlbumEntry, MediaIndex, RemoteError};
use crate::state::{Ledger, StateError};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Ledger unavailable")]
    LedgerUnavailable(#[from] StateError),

    #[error("Cannot create album directory {path}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkReport {
    /// Links that are in place after the run, new or pre-existing.
    pub linked: u64,
    /// Members with no downloaded file to point at.
    pub missing: u64,
    /// Links that could not be created.
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Created,
    Unchanged,
    Replaced,
    /// A regular file or directory occupies the link name.
    Blocked,
}

/// Page through every album and its members.
pub async fn fetch_album_entries(index: &dyn MediaIndex) -> Result<Vec<AlbumEntry>, RemoteError> {
    let mut summaries = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
        let page = index.list_albums(page_token.as_deref()).await?;
        summaries.extend(page.albums);
        match page.next_page_token {
            Some(t) => page_token = Some(t),
            None => break,
        }
    }

    let mut entries = Vec::with_capacity(summaries.len());
    for album in summaries {
        let mut members = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = index
                .list_album_items(&album.id, page_token.as_deref())
                .await?;
            members.extend(page.items.into_iter().map(|i| i.id));
            match page.next_page_token {
                Some(t) => page_token = Some(t),
                None => break,
            }
        }
        tracing::debug!(album = %album.title, members = members.len(), "Fetched album");
        entries.push(AlbumEntry {
            id: album.id,
            title: album.title,
            members,
        });
    }
    tracing::info!("Found {} albums", entries.len());
    Ok(entries)
}

pub struct AlbumLinker<'a> {
    ledger: &'a dyn Ledger,
    albums_root: PathBuf,
    dry_run: bool,
}

impl<'a> AlbumLinker<'a> {
    pub fn new(ledger: &'a dyn Ledger, albums_root: PathBuf, dry_run: bool) -> Self {
        Self {
            ledger,
            albums_root,
            dry_run,
        }
    }

    /// Ensure `<albums_root>/<album>/<file>` links to every downloaded member.
    ///
    /// Idempotent and independent of member order: correct links are left
    /// alone, stale links are repointed, links into the tree for items that
    /// are no longer members are removed, and regular files are never
    /// replaced.
    pub async fn link_albums(&self, albums: &[AlbumEntry]) -> Result<LinkReport, LinkError> {
        let downloaded: HashMap<String, PathBuf> =
            self.ledger.all_downloaded().await?.into_iter().collect();
        let tracked: HashSet<&Path> = downloaded.values().map(PathBuf::as_path).collect();
        let mut report = LinkReport::default();
        let mut album_dirs: HashMap<String, &str> = HashMap::new();

        for album in albums {
            let dir_name = album_dir_name(album, &mut album_dirs);
            let album_dir = self.albums_root.join(&dir_name);
            if !self.dry_run {
                fs::create_dir_all(&album_dir)
                    .await
                    .map_err(|source| LinkError::Filesystem {
                        path: album_dir.clone(),
                        source,
                    })?;
            }

            let mut seen: HashSet<&str> = HashSet::new();
            let mut present: Vec<(&str, &Path)> = Vec::with_capacity(album.members.len());
            for member in &album.members {
                if !seen.insert(member.as_str()) {
                    continue;
                }
                let Some(target) = downloaded.get(member) else {
                    tracing::debug!(album = %album.title, id = %member, "Album member not downloaded");
                    report.missing += 1;
                    continue;
                };
                if !fs::try_exists(target).await.unwrap_or(false) {
                    tracing::warn!(
                        album = %album.title,
                        id = %member,
                        path = %target.display(),
                        "Downloaded file is missing on disk"
                    );
                    report.missing += 1;
                    continue;
                }
                present.push((member.as_str(), target.as_path()));
            }

            let mut wanted: HashSet<String> = HashSet::with_capacity(present.len());
            for ((member, target), name) in present.iter().zip(link_names(&present)) {
                if !wanted.insert(name.clone()) {
                    tracing::warn!(album = %album.title, id = %member, name = %name, "Link name already used in album");
                    report.failed += 1;
                    continue;
                }
                let link = album_dir.join(&name);

                if self.dry_run {
                    tracing::info!(link = %link.display(), points_to = %target.display(), "[DRY RUN] Would link");
                    report.linked += 1;
                    continue;
                }

                match ensure_symlink(&link, target).await {
                    Ok(LinkState::Blocked) => {
                        tracing::warn!(link = %link.display(), "Not a symlink, leaving it in place");
                        report.failed += 1;
                    }
                    Ok(state) => {
                        if state != LinkState::Unchanged {
                            tracing::info!(
                                album = %album.title,
                                link = %link.display(),
                                replaced = state == LinkState::Replaced,
                                "Linked"
                            );
                        }
                        report.linked += 1;
                    }
                    Err(e) => {
                        tracing::error!(link = %link.display(), error = %e, "Failed to create link");
                        report.failed += 1;
                    }
                }
            }

            let removed = self.prune_stale_links(&album_dir, &wanted, &tracked).await;
            if removed > 0 {
                tracing::debug!(album = %album.title, removed, "Pruned stale links");
            }
        }

        tracing::info!("── Albums ──");
        tracing::info!(
            "  {} linked, {} missing, {} failed",
            report.linked,
            report.missing,
            report.failed
        );
        Ok(report)
    }

    /// Remove symlinks in `album_dir` that point at a tracked download but
    /// are not part of the album's current link set. Foreign symlinks and
    /// regular files are left alone. Returns how many were removed.
    async fn prune_stale_links(
        &self,
        album_dir: &Path,
        wanted: &HashSet<String>,
        tracked: &HashSet<&Path>,
    ) -> u64 {
        let mut entries = match fs::read_dir(album_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!(dir = %album_dir.display(), error = %e, "Cannot scan album directory");
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %album_dir.display(), error = %e, "Cannot scan album directory");
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if wanted.contains(&name) {
                continue;
            }
            let link = entry.path();
            // read_link fails on anything that is not a symlink
            let Ok(points_to) = fs::read_link(&link).await else {
                continue;
            };
            if !tracked.contains(points_to.as_path()) {
                continue;
            }
            if self.dry_run {
                tracing::info!(link = %link.display(), "[DRY RUN] Would remove stale link");
                removed += 1;
                continue;
            }
            match fs::remove_file(&link).await {
                Ok(()) => {
                    tracing::info!(link = %link.display(), "Removed stale link");
                    removed += 1;
                }
                Err(e) => tracing::warn!(link = %link.display(), error = %e, "Failed to remove stale link"),
            }
        }
        removed
    }
}

/// Directory name for an album: the cleaned title, the id when the title
/// cleans to nothing, and an id suffix when another album took the name.
fn album_dir_name<'e>(album: &'e AlbumEntry, taken: &mut HashMap<String, &'e str>) -> String {
    let mut name = clean_filename(&album.title);
    if name.is_empty() || name == "." || name == ".." {
        name = clean_filename(&album.id);
    }
    match taken.get(&name) {
        Some(owner) if *owner != album.id => {
            name = format!("{name}-{}", id_suffix(&album.id));
        }
        _ => {}
    }
    taken.insert(name.clone(), &album.id);
    name
}

/// Link names for distinct `(member, target)` pairs, in input order.
///
/// Members sharing a file name are ranked by id: the lowest id keeps the bare
/// name and the others get the id suffix, so the result does not depend on
/// the order the API lists members in.
fn link_names(members: &[(&str, &Path)]) -> Vec<String> {
    let bases: Vec<String> = members
        .iter()
        .map(|(member, target)| {
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| id_suffix(member))
        })
        .collect();

    let mut owners: HashMap<&str, &str> = HashMap::new();
    for (base, (member, _)) in bases.iter().zip(members) {
        owners
            .entry(base.as_str())
            .and_modify(|owner| {
                if *member < *owner {
                    *owner = *member;
                }
            })
            .or_insert(*member);
    }

    bases
        .iter()
        .zip(members)
        .map(|(base, (member, _))| {
            if owners.get(base.as_str()) == Some(member) {
                base.clone()
            } else {
                insert_suffix(base, &id_suffix(member))
            }
        })
        .collect()
}

async fn ensure_symlink(link: &Path, target: &Path) -> io::Result<LinkState> {
    match fs::symlink_metadata(link).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(link).await? == target {
                return Ok(LinkState::Unchanged);
            }
            fs::remove_file(link).await?;
            create_symlink(target, link).await?;
            Ok(LinkState::Replaced)
        }
        Ok(_) => Ok(LinkState::Blocked),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            create_symlink(target, link).await?;
            Ok(LinkState::Created)
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
async fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(windows)]
async fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink_file(target, link).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::google::{AlbumSummary, MediaItem, MediaMetadata, StaticIndex};
    use crate::state::{SqliteLedger, SyncRecord};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        dir: tempfile::TempDir,
        ledger: SqliteLedger,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                ledger: SqliteLedger::open_in_memory().unwrap(),
            }
        }

        fn albums_root(&self) -> PathBuf {
            self.dir.path().join("Albums")
        }

        /// Record `id` as downloaded to `<dir>/<rel>` and write the file.
        async fn downloaded(&self, id: &str, rel: &str) -> PathBuf {
            let path = self.dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, id).unwrap();
            let record = SyncRecord::pending(&media(id, rel), path.clone()).into_downloaded(path.clone());
            self.ledger.upsert(&record).await.unwrap();
            path
        }

        fn linker(&self) -> AlbumLinker<'_> {
            AlbumLinker::new(&self.ledger, self.albums_root(), false)
        }
    }

    fn media(id: &str, filename: &str) -> MediaItem {
        MediaItem {
            id: id.to_string(),
            filename: filename.to_string(),
            creation_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            base_url: String::new(),
            mime_type: None,
            metadata: MediaMetadata::default(),
        }
    }

    fn album(id: &str, title: &str, members: &[&str]) -> AlbumEntry {
        AlbumEntry {
            id: id.to_string(),
            title: title.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn links_in(dir: &Path) -> Vec<(String, PathBuf)> {
        let mut out: Vec<(String, PathBuf)> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.file_name().to_string_lossy().into_owned(),
                    std::fs::read_link(e.path()).unwrap(),
                )
            })
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_links_downloaded_members() {
        let fx = Fixture::new();
        let a = fx.downloaded("a", "2024-01/a.jpg").await;
        let b = fx.downloaded("b", "2024-02/b.jpg").await;

        let report = fx
            .linker()
            .link_albums(&[album("alb", "Trip", &["a", "b"])])
            .await
            .unwrap();

        assert_eq!(report, LinkReport { linked: 2, missing: 0, failed: 0 });
        assert_eq!(
            links_in(&fx.albums_root().join("Trip")),
            vec![("a.jpg".to_string(), a), ("b.jpg".to_string(), b)]
        );
    }

    #[tokio::test]
    async fn test_relinking_is_idempotent() {
        let fx = Fixture::new();
        fx.downloaded("a", "2024-01/a.jpg").await;
        fx.downloaded("b", "2024-01/b.jpg").await;
        let albums = [album("alb", "Trip", &["a", "b"]), album("alb2", "Best", &["b"])];

        let first = fx.linker().link_albums(&albums).await.unwrap();
        let trip = links_in(&fx.albums_root().join("Trip"));
        let best = links_in(&fx.albums_root().join("Best"));

        let second = fx.linker().link_albums(&albums).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(links_in(&fx.albums_root().join("Trip")), trip);
        assert_eq!(links_in(&fx.albums_root().join("Best")), best);
    }

    #[tokio::test]
    async fn test_missing_members_are_counted_not_fatal() {
        let fx = Fixture::new();
        fx.downloaded("a", "2024-01/a.jpg").await;
        let gone = fx.downloaded("gone", "2024-01/gone.jpg").await;
        std::fs::remove_file(gone).unwrap();

        let report = fx
            .linker()
            .link_albums(&[album("alb", "Trip", &["a", "never-synced", "gone"])])
            .await
            .unwrap();

        assert_eq!(report, LinkReport { linked: 1, missing: 2, failed: 0 });
        assert_eq!(links_in(&fx.albums_root().join("Trip")).len(), 1);
    }

    #[tokio::test]
    async fn test_stale_link_is_repointed() {
        let fx = Fixture::new();
        let a = fx.downloaded("a", "2024-01/a.jpg").await;
        let trip = fx.albums_root().join("Trip");
        std::fs::create_dir_all(&trip).unwrap();
        std::os::unix::fs::symlink("/somewhere/else.jpg", trip.join("a.jpg")).unwrap();

        let report = fx
            .linker()
            .link_albums(&[album("alb", "Trip", &["a"])])
            .await
            .unwrap();

        assert_eq!(report.linked, 1);
        assert_eq!(std::fs::read_link(trip.join("a.jpg")).unwrap(), a);
    }

    #[tokio::test]
    async fn test_regular_file_is_not_clobbered() {
        let fx = Fixture::new();
        fx.downloaded("a", "2024-01/a.jpg").await;
        let trip = fx.albums_root().join("Trip");
        std::fs::create_dir_all(&trip).unwrap();
        std::fs::write(trip.join("a.jpg"), "keep me").unwrap();

        let report = fx
            .linker()
            .link_albums(&[album("alb", "Trip", &["a"])])
            .await
            .unwrap();

        assert_eq!(report, LinkReport { linked: 0, missing: 0, failed: 1 });
        assert_eq!(std::fs::read_to_string(trip.join("a.jpg")).unwrap(), "keep me");
    }

    #[tokio::test]
    async fn test_same_file_name_in_one_album_is_disambiguated() {
        let fx = Fixture::new();
        let jan = fx.downloaded("jan", "2024-01/IMG_0001.jpg").await;
        let feb = fx.downloaded("feb", "2024-02/IMG_0001.jpg").await;

        let report = fx
            .linker()
            .link_albums(&[album("alb", "Trip", &["jan", "feb", "jan"])])
            .await
            .unwrap();

        assert_eq!(report.linked, 2);
        let suffixed = format!("IMG_0001-{}.jpg", id_suffix("jan"));
        assert_eq!(
            links_in(&fx.albums_root().join("Trip")),
            vec![(suffixed, jan), ("IMG_0001.jpg".to_string(), feb)]
        );
    }

    #[tokio::test]
    async fn test_member_order_does_not_change_links() {
        let fx = Fixture::new();
        fx.downloaded("jan", "2024-01/IMG_0001.jpg").await;
        fx.downloaded("feb", "2024-02/IMG_0001.jpg").await;
        let trip = fx.albums_root().join("Trip");

        fx.linker()
            .link_albums(&[album("alb", "Trip", &["jan", "feb"])])
            .await
            .unwrap();
        let first = links_in(&trip);

        let report = fx
            .linker()
            .link_albums(&[album("alb", "Trip", &["feb", "jan"])])
            .await
            .unwrap();

        assert_eq!(report, LinkReport { linked: 2, missing: 0, failed: 0 });
        assert_eq!(links_in(&trip).len(), 2);
        assert_eq!(links_in(&trip), first);
    }

    #[tokio::test]
    async fn test_departed_member_link_is_removed() {
        let fx = Fixture::new();
        let a = fx.downloaded("a", "2024-01/a.jpg").await;
        fx.downloaded("b", "2024-01/b.jpg").await;
        let trip = fx.albums_root().join("Trip");

        fx.linker()
            .link_albums(&[album("alb", "Trip", &["a", "b"])])
            .await
            .unwrap();
        std::os::unix::fs::symlink("/somewhere/else.jpg", trip.join("mine.jpg")).unwrap();

        fx.linker()
            .link_albums(&[album("alb", "Trip", &["a"])])
            .await
            .unwrap();

        assert_eq!(
            links_in(&trip),
            vec![
                ("a.jpg".to_string(), a),
                ("mine.jpg".to_string(), PathBuf::from("/somewhere/else.jpg")),
            ]
        );
    }

    #[tokio::test]
    async fn test_dry_run_keeps_departed_member_link() {
        let fx = Fixture::new();
        fx.downloaded("a", "2024-01/a.jpg").await;
        fx.downloaded("b", "2024-01/b.jpg").await;
        let trip = fx.albums_root().join("Trip");
        fx.linker()
            .link_albums(&[album("alb", "Trip", &["a", "b"])])
            .await
            .unwrap();

        let report = AlbumLinker::new(&fx.ledger, fx.albums_root(), true)
            .link_albums(&[album("alb", "Trip", &["a"])])
            .await
            .unwrap();

        assert_eq!(report.linked, 1);
        assert_eq!(links_in(&trip).len(), 2);
    }

    #[test]
    fn test_link_names_rank_equal_names_by_id() {
        let jan = Path::new("/d/2024-01/IMG_0001.jpg");
        let feb = Path::new("/d/2024-02/IMG_0001.jpg");
        let other = Path::new("/d/2024-02/b.jpg");

        let forward = link_names(&[("jan", jan), ("feb", feb), ("x", other)]);
        let backward = link_names(&[("x", other), ("feb", feb), ("jan", jan)]);

        let jan_name = format!("IMG_0001-{}.jpg", id_suffix("jan"));
        assert_eq!(forward, [jan_name.clone(), "IMG_0001.jpg".to_string(), "b.jpg".to_string()]);
        assert_eq!(backward, ["b.jpg".to_string(), "IMG_0001.jpg".to_string(), jan_name]);
    }

    #[tokio::test]
    async fn test_album_titles_are_cleaned() {
        let fx = Fixture::new();
        fx.downloaded("a", "2024-01/a.jpg").await;

        fx.linker()
            .link_albums(&[
                album("alb1", "Mum/Dad: 2023", &["a"]),
                album("alb2", "???", &["a"]),
                album("alb3", "Mum/Dad: 2023", &["a"]),
            ])
            .await
            .unwrap();

        let root = fx.albums_root();
        assert!(root.join("MumDad 2023").is_dir());
        assert!(root.join("alb2").is_dir());
        assert!(root.join(format!("MumDad 2023-{}", id_suffix("alb3"))).is_dir());
    }

    #[tokio::test]
    async fn test_dry_run_creates_nothing() {
        let fx = Fixture::new();
        fx.downloaded("a", "2024-01/a.jpg").await;

        let report = AlbumLinker::new(&fx.ledger, fx.albums_root(), true)
            .link_albums(&[album("alb", "Trip", &["a", "x"])])
            .await
            .unwrap();

        assert_eq!(report, LinkReport { linked: 1, missing: 1, failed: 0 });
        assert!(!fx.albums_root().exists());
    }

    #[tokio::test]
    async fn test_fetch_album_entries_pages_everything() {
        let summary = |id: &str| AlbumSummary {
            id: id.to_string(),
            title: format!("Album {id}"),
            item_count: None,
        };
        let members = |ids: &[&str]| ids.iter().map(|id| media(id, "x.jpg")).collect::<Vec<_>>();
        let index = StaticIndex {
            albums: vec![
                (summary("1"), members(&["a", "b", "c"])),
                (summary("2"), members(&[])),
                (summary("3"), members(&["d"])),
            ],
            page_size: 2,
            ..Default::default()
        };

        let entries = fetch_album_entries(&index).await.unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].members, ["a", "b", "c"]);
        assert!(entries[1].members.is_empty());
        assert_eq!(entries[2].title, "Album 3");
        assert_eq!(entries[2].members, ["d"]);
    }

    #[tokio::test]
    async fn test_fetch_album_entries_ignores_bogus_item_count() {
        let index = StaticIndex {
            albums: vec![(
                AlbumSummary {
                    id: "1".to_string(),
                    title: "Huge".to_string(),
                    item_count: Some(u64::MAX / 2),
                },
                vec![media("a", "a.jpg")],
            )],
            page_size: 2,
            ..Default::default()
        };

        let entries = fetch_album_entries(&index).await.unwrap();
        assert_eq!(entries[0].members, ["a"]);
    }
}
