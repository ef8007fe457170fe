//! Drift detection between the ledger and the year-month tree.
//!
//! Phantoms are `Downloaded` records whose file has gone missing. Orphans are
//! files sitting in a `YYYY-MM/` folder that no `Downloaded` record claims.
//! Nothing is repaired here; the report is for the operator.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::download::file::PART_EXTENSION;
use crate::download::paths::is_month_folder;
use crate::state::{Ledger, StateError};

#[derive(Debug, Default)]
pub struct ConsistencyReport {
    pub verified: usize,
    pub phantoms: Vec<(String, PathBuf)>,
    pub orphans: Vec<PathBuf>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.phantoms.is_empty() && self.orphans.is_empty()
    }
}

pub async fn check(ledger: &dyn Ledger, directory: &Path) -> Result<ConsistencyReport, StateError> {
    let downloaded = ledger.all_downloaded().await?;
    let mut report = ConsistencyReport::default();

    for (id, path) in &downloaded {
        // An unreadable path counts as missing.
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            report.verified += 1;
        } else {
            tracing::debug!(id = %id, path = %path.display(), "Ledger entry has no file");
            report.phantoms.push((id.clone(), path.clone()));
        }
    }

    let known: HashSet<PathBuf> = downloaded.into_iter().map(|(_, p)| p).collect();
    let root = directory.to_path_buf();
    let files = tokio::task::spawn_blocking(move || month_tree_files(&root)).await?;

    report.orphans = files.into_iter().filter(|f| !known.contains(f)).collect();
    report.orphans.sort();

    tracing::info!(
        verified = report.verified,
        phantoms = report.phantoms.len(),
        orphans = report.orphans.len(),
        "Consistency check finished"
    );
    Ok(report)
}

/// Regular files exactly one level inside `<root>/YYYY-MM/`.
fn month_tree_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || is_month_folder(&e.file_name().to_string_lossy()))
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map_or(true, |ext| ext != PART_EXTENSION)
        })
        .map(|e| e.into_path())
        .collect()
}
