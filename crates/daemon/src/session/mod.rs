//! Per-connection session state.
//!
//! A session tracks where a connection is within the confined root and what
//! the dispatch loop is currently doing. Sessions are owned by exactly one
//! connection task and never shared.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::files::browser::{find_child_directory, BrowserError, SessionRoot};

/// Target that moves to the parent directory.
pub const PARENT_TARGET: &str = "..";

/// What the dispatch loop is doing with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the next command.
    Idle,
    /// Handling a command message.
    Dispatching,
    /// Streaming file bytes for a `get` or `put`.
    Transferring,
    /// Terminal: the connection has been closed.
    Closed,
}

/// Resolves a `cd` target from `current` without touching any session.
///
/// `..` succeeds only while `current` is strictly below the root, measured by
/// path length. Any other target must be the literal name of a real child
/// directory: separators, absolute paths and symlinks never match.
pub fn resolve_target(
    root: &SessionRoot,
    current: &Path,
    target: &str,
) -> Result<PathBuf, BrowserError> {
    let not_found = || BrowserError::DirectoryNotFound(target.to_string());

    let next = if target == PARENT_TARGET {
        if current.as_os_str().len() <= root.path().as_os_str().len() {
            return Err(not_found());
        }
        current.parent().ok_or_else(not_found)?.to_path_buf()
    } else {
        find_child_directory(current, target)
            .ok()
            .flatten()
            .ok_or_else(not_found)?
    };

    if next.as_os_str().len() < root.path().as_os_str().len() || !root.contains(&next) {
        return Err(not_found());
    }
    Ok(next)
}

/// State of one connection.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    root: Arc<SessionRoot>,
    current: PathBuf,
    phase: SessionPhase,
}

impl Session {
    /// Starts a session at the root.
    pub fn new(root: Arc<SessionRoot>) -> Self {
        let current = root.path().to_path_buf();
        Self {
            id: Uuid::new_v4(),
            root,
            current,
            phase: SessionPhase::Idle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Arc<SessionRoot> {
        &self.root
    }

    pub fn current_dir(&self) -> &Path {
        &self.current
    }

    /// Root-relative rendering of the current directory.
    pub fn display_dir(&self) -> String {
        self.root.display_path(&self.current)
    }

    pub fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            debug!(session = %self.id, from = ?self.phase, to = ?phase, "Session phase change");
            self.phase = phase;
        }
    }

    /// Moves to a directory already checked by [`resolve_target`].
    /// A failed `cd` never gets here, leaving the session unchanged.
    pub fn enter(&mut self, dir: PathBuf) {
        debug!(session = %self.id, dir = %self.root.display_path(&dir), "Changed directory");
        self.current = dir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::list_directory;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Session) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), [1u8; 10]).unwrap();
        fs::create_dir_all(temp.path().join("sub").join("deeper")).unwrap();
        fs::write(temp.path().join("sub").join("b.txt"), [2u8; 20]).unwrap();
        let root = Arc::new(SessionRoot::new(temp.path()).unwrap());
        (temp, Session::new(root))
    }

    /// Resolve then enter, as the router does.
    fn cd(session: &mut Session, target: &str) -> Result<(), BrowserError> {
        let next = resolve_target(session.root(), session.current_dir(), target)?;
        session.enter(next);
        Ok(())
    }

    #[test]
    fn test_new_session_starts_at_root() {
        let (_temp, session) = fixture();
        assert_eq!(session.current_dir(), session.root().path());
        assert_eq!(session.display_dir(), "/");
    }

    #[test]
    fn test_parent_at_root_fails_and_keeps_state() {
        let (_temp, mut session) = fixture();
        let err = cd(&mut session, "..").unwrap_err();

        assert_eq!(err.to_string(), "[..] directory does not exist.");
        assert_eq!(session.current_dir(), session.root().path());
    }

    #[test]
    fn test_child_then_parent_round_trips() {
        let (_temp, mut session) = fixture();
        let original = session.current_dir().to_path_buf();

        cd(&mut session, "sub").unwrap();
        assert_eq!(session.display_dir(), "/sub");
        cd(&mut session, "..").unwrap();
        assert_eq!(session.current_dir(), original);
    }

    #[test]
    fn test_parent_listing_matches_parent_contents() {
        let (_temp, mut session) = fixture();
        cd(&mut session, "sub").unwrap();
        cd(&mut session, "deeper").unwrap();
        cd(&mut session, "..").unwrap();

        let listing = list_directory(session.root(), session.current_dir()).unwrap();
        assert_eq!(listing.current_directory, "/sub");
        assert_eq!(listing.dirs[0].name, "deeper");
        assert_eq!(listing.files[0].name, "b.txt");
    }

    #[test]
    fn test_targets_must_be_literal_children() {
        let (_temp, mut session) = fixture();
        for target in ["missing", "a.txt", "sub/deeper", "/", ".", "", "SUB"] {
            let err = cd(&mut session, target).unwrap_err();
            assert_eq!(err.to_string(), format!("[{target}] directory does not exist."));
            assert_eq!(session.display_dir(), "/");
        }
    }

    #[test]
    fn test_invariant_holds_after_every_cd() {
        let (_temp, mut session) = fixture();
        let root_len = session.root().path().as_os_str().len();
        for target in ["..", "sub", "..", "..", "sub", "deeper", "..", "..", ".."] {
            let _ = cd(&mut session, target);
            assert!(session.current_dir().as_os_str().len() >= root_len);
        }
        assert_eq!(session.display_dir(), "/");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_child_is_not_entered() {
        let (_temp, mut session) = fixture();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), session.root().path().join("out")).unwrap();

        assert!(cd(&mut session, "out").is_err());
        assert_eq!(session.display_dir(), "/");
    }
}
