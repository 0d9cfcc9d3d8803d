//! Alternate names for the "keep both" conflict resolution.

use std::path::{Path, PathBuf};

/// Find a free sibling name for `path`.
///
/// For "file.txt", tries "file (1).txt", "file (2).txt", etc., asking `exists`
/// about each candidate. Falls back to a timestamp suffix.
pub fn auto_rename_path(path: &Path, exists: impl Fn(&Path) -> bool) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new(""));
    let (stem, extension) = split_name(path);

    for i in 1..1000 {
        let new_name = match extension.as_deref() {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };

        let new_path = parent.join(&new_name);
        if !exists(&new_path) {
            return new_path;
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let new_name = match extension.as_deref() {
        Some(ext) => format!("{stem}_{timestamp}.{ext}"),
        None => format!("{stem}_{timestamp}"),
    };

    parent.join(&new_name)
}

/// Split a file name into stem and extension, keeping dotfiles whole.
fn split_name(path: &Path) -> (String, Option<String>) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    (stem, extension)
}
