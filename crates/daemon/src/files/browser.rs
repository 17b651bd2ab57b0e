//! Directory browsing confined to the session root.
//!
//! The root is canonicalized once at startup. Listings show only real
//! directories and regular files: symbolic links are neither listed,
//! entered nor transferred, so nothing reachable from a session can point
//! outside the root.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use protocol::messages::{FileEntry, LsResponse};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

/// Errors that can occur during directory browsing.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The configured root does not exist.
    #[error("root does not exist: {0}")]
    RootNotFound(PathBuf),

    /// The requested path is not a directory.
    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// `cd` target is not a child directory (or would leave the root).
    #[error("[{0}] directory does not exist.")]
    DirectoryNotFound(String),

    /// The requested path is outside the root.
    #[error("path is outside the session root: {0}")]
    PathOutsideRoot(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The directory a daemon serves. Fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRoot {
    path: PathBuf,
}

impl SessionRoot {
    /// Canonicalizes `path` and checks that it is a directory.
    pub fn new(path: &Path) -> Result<Self, BrowserError> {
        let canonical = fs::canonicalize(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BrowserError::RootNotFound(path.to_path_buf())
            } else {
                BrowserError::Io(e)
            }
        })?;

        if !canonical.is_dir() {
            return Err(BrowserError::NotADirectory(canonical));
        }

        Ok(Self { path: canonical })
    }

    /// The canonical root path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renders `dir` for clients as a root-relative path (`/`, `/sub`).
    pub fn display_path(&self, dir: &Path) -> String {
        match protocol::transfer::relative_name(&self.path, dir) {
            Some(relative) => format!("/{relative}"),
            None => "/".to_string(),
        }
    }

    /// Returns true if `dir` resolves to the root or somewhere beneath it.
    pub fn contains(&self, dir: &Path) -> bool {
        fs::canonicalize(dir)
            .map(|canonical| canonical.starts_with(&self.path))
            .unwrap_or(false)
    }
}

/// Sum of the lengths of every regular file below `dir`.
pub fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Builds the listing for `dir`: immediate child directories (with their
/// recursive size) and files, each sorted by name.
///
/// This is the single source of `ls` responses; a successful `cd` returns
/// exactly what this produces for the new directory.
pub fn list_directory(root: &SessionRoot, dir: &Path) -> Result<LsResponse, BrowserError> {
    if !dir.starts_with(root.path()) {
        return Err(BrowserError::PathOutsideRoot(dir.to_path_buf()));
    }

    let mut dirs = Vec::new();
    let mut files = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();

        if file_type.is_dir() {
            dirs.push(FileEntry::dir(name, directory_size(&entry.path()), modified));
        } else if file_type.is_file() {
            files.push(FileEntry::file(name, metadata.len(), modified));
        }
    }

    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(LsResponse {
        current_directory: root.display_path(dir),
        dirs,
        files,
    })
}

/// Finds an immediate child directory whose name equals `name` exactly.
///
/// Names are compared ordinally, so on case-insensitive filesystems a
/// differently cased target still does not match.
pub fn find_child_directory(dir: &Path, name: &str) -> Result<Option<PathBuf>, BrowserError> {
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        if entry.file_name().to_str() != Some(name) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::FileKind;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, SessionRoot) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), [1u8; 10]).unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        fs::write(temp.path().join("sub").join("b.txt"), [2u8; 20]).unwrap();
        let root = SessionRoot::new(temp.path()).unwrap();
        (temp, root)
    }

    #[test]
    fn test_root_listing_matches_example() {
        let (_temp, root) = fixture();
        let listing = list_directory(&root, root.path()).unwrap();

        assert_eq!(listing.current_directory, "/");
        assert_eq!(listing.dirs.len(), 1);
        assert_eq!(listing.dirs[0].name, "sub");
        assert_eq!(listing.dirs[0].length, 20);
        assert_eq!(listing.dirs[0].kind, FileKind::Dir);
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].name, "a.txt");
        assert_eq!(listing.files[0].length, 10);
    }

    #[test]
    fn test_subdirectory_listing() {
        let (_temp, root) = fixture();
        let sub = root.path().join("sub");
        let listing = list_directory(&root, &sub).unwrap();

        assert_eq!(listing.current_directory, "/sub");
        assert!(listing.dirs.is_empty());
        assert_eq!(listing.files[0].name, "b.txt");
        assert_eq!(listing.files[0].length, 20);
    }

    #[test]
    fn test_empty_directory_has_empty_lists() {
        let temp = TempDir::new().unwrap();
        let root = SessionRoot::new(temp.path()).unwrap();
        let listing = list_directory(&root, root.path()).unwrap();

        assert!(listing.dirs.is_empty());
        assert!(listing.files.is_empty());
        let json = serde_json::to_string(&listing).unwrap();
        assert!(json.contains(r#""Dirs":[]"#));
        assert!(json.contains(r#""Files":[]"#));
    }

    #[test]
    fn test_directory_size_is_recursive() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("x/y")).unwrap();
        fs::write(temp.path().join("x/one"), [0u8; 3]).unwrap();
        fs::write(temp.path().join("x/y/two"), [0u8; 4]).unwrap();

        assert_eq!(directory_size(temp.path()), 7);
        assert_eq!(directory_size(&temp.path().join("x/y")), 4);
    }

    #[test]
    fn test_listing_outside_root_is_rejected() {
        let (_temp, root) = fixture();
        let other = TempDir::new().unwrap();
        let outside = fs::canonicalize(other.path()).unwrap();
        assert!(matches!(
            list_directory(&root, &outside),
            Err(BrowserError::PathOutsideRoot(_))
        ));
    }

    #[test]
    fn test_find_child_directory_is_exact() {
        let (_temp, root) = fixture();
        assert_eq!(
            find_child_directory(root.path(), "sub").unwrap(),
            Some(root.path().join("sub"))
        );
        assert_eq!(find_child_directory(root.path(), "SUB").unwrap(), None);
        assert_eq!(find_child_directory(root.path(), "a.txt").unwrap(), None);
        assert_eq!(find_child_directory(root.path(), "missing").unwrap(), None);
    }

    #[test]
    fn test_missing_root() {
        assert!(matches!(
            SessionRoot::new(Path::new("/nonexistent/ferry/root")),
            Err(BrowserError::RootNotFound(_))
        ));
    }

    #[test]
    fn test_display_path() {
        let (_temp, root) = fixture();
        assert_eq!(root.display_path(root.path()), "/");
        assert_eq!(root.display_path(&root.path().join("sub").join("deep")), "/sub/deep");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_listed() {
        let (_temp, root) = fixture();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("escape")).unwrap();

        let listing = list_directory(&root, root.path()).unwrap();
        assert!(listing.dirs.iter().all(|d| d.name != "escape"));
        assert_eq!(find_child_directory(root.path(), "escape").unwrap(), None);
    }
}
