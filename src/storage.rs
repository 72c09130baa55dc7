//! On-disk layout for downloaded files.
//!
//! Files are fanned out into subdirectories keyed by the first three
//! digits of the key's numeric part so no single directory accumulates
//! hundreds of thousands of entries:
//! `<storage_root>/DataSet<id>/<first3digits>/<key>.pdf`.

use std::path::{Path, PathBuf};

/// Compute the storage path for a key.
///
/// Key `EFTA02205655` in data set 11 maps to
/// `DataSet11/022/EFTA02205655.pdf`. Keys whose numeric part is shorter
/// than three digits land in a `misc/` bucket.
pub fn local_path(storage_root: &Path, data_set_id: u32, key: &str) -> PathBuf {
    let digit_start = key.find(|c: char| c.is_ascii_digit());
    let subdir = match digit_start {
        Some(idx) if key.len() >= idx + 3 => &key[idx..idx + 3],
        _ => "misc",
    };
    storage_root
        .join(format!("DataSet{data_set_id}"))
        .join(subdir)
        .join(format!("{key}.pdf"))
}

/// Whether a non-empty file already exists at the path.
pub fn file_present(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Remove a partial or unwanted file, ignoring its absence.
pub fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove partial file {:?}: {}", path, e);
        }
    }
}
