use std::fmt::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use sha2::{Digest, Sha256};

use crate::google::MediaItem;

/// Hex characters of `sha256(id)` used to disambiguate colliding names.
const ID_SUFFIX_LEN: usize = 8;

/// Plan the local path for `item`: `<directory>/<YYYY>-<MM>/<filename>`.
///
/// Returns `None` for items excluded from backup (WhatsApp-forwarded images).
/// Year and month come from the UTC creation time.
pub fn plan(item: &MediaItem, directory: &Path) -> Option<PathBuf> {
    if is_whatsapp_image(&item.filename) {
        return None;
    }
    let name = match clean_filename(&item.filename) {
        n if n.is_empty() || n == "." || n == ".." => id_suffix(&item.id),
        n => n,
    };
    Some(directory.join(month_folder(&item.creation_time)).join(name))
}

/// `IMG-<digits>-WA<digits>.jpg`, extension matched case-insensitively.
pub fn is_whatsapp_image(filename: &str) -> bool {
    let Some(rest) = filename.strip_prefix("IMG-") else {
        return false;
    };
    let Some(dot) = rest.rfind('.') else {
        return false;
    };
    let (stem, ext) = (&rest[..dot], &rest[dot + 1..]);
    if !ext.eq_ignore_ascii_case("jpg") {
        return false;
    }
    let Some((date, seq)) = stem.split_once("-WA") else {
        return false;
    };
    is_digits(date) && is_digits(seq)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// `YYYY-MM` folder name for a creation time.
pub fn month_folder(created: &DateTime<Utc>) -> String {
    let mut s = String::with_capacity(7);
    let _ = write!(s, "{:04}-{:02}", created.year(), created.month());
    s
}

/// Whether a directory name looks like one produced by [`month_folder`].
pub fn is_month_folder(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() == 7
        && b[4] == b'-'
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[5..].iter().all(u8::is_ascii_digit)
}

/// Clean a filename by removing characters that are invalid on common
/// filesystems: `/`, `\`, `:`, `*`, `?`, `"`, `<`, `>`, `|`.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Insert `-suffix` before the extension: `photo.jpg` → `photo-suffix.jpg`.
/// A leading dot (hidden file) is not treated as an extension separator.
pub fn insert_suffix(filename: &str, suffix: &str) -> String {
    match filename.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = filename.split_at(dot);
            format!("{stem}-{suffix}{ext}")
        }
        _ => format!("{filename}-{suffix}"),
    }
}

/// Short deterministic fingerprint of a media item id.
///
/// Item ids share long common prefixes, so a hash is used rather than a
/// truncation of the id itself.
pub fn id_suffix(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let mut hex = String::with_capacity(ID_SUFFIX_LEN);
    for byte in digest.iter().take(ID_SUFFIX_LEN / 2) {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// `path` with the id fingerprint inserted into its file name.
pub fn with_id_suffix(path: &Path, id: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(insert_suffix(&name, &id_suffix(id)))
}
