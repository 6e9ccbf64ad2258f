//! Filesystem access for knowledge base lifecycle operations
//!
//! Deleting a knowledge base races the vector engine, which may still hold file
//! handles (and on some platforms, locks) for a short while after its caches
//! are dropped. Removal therefore goes through [`force_remove_dir`], a bounded
//! retry loop over the [`FileSystem`] trait, so the same algorithm runs against
//! the real disk and against a simulated tree that injects failures.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// Retry budget for [`force_remove_dir`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    /// Fixed pause between two attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(200),
        }
    }
}

/// One entry yielded by [`FileSystem::walk_bottom_up`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// The filesystem operations the knowledge base store relies on.
///
/// None of these follow symbolic links: a link is treated as a plain file and
/// removing it never touches its target.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// Immediate children of a directory
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Relax permissions so the entry (and, for directories, its contents) can be deleted
    fn make_writable(&self, path: &Path) -> io::Result<()>;

    /// Every entry strictly below `path`, children before their parents
    fn walk_bottom_up(&self, path: &Path) -> Vec<WalkEntry>;

    fn sleep(&self, delay: Duration);
}

/// [`FileSystem`] backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl FileSystem for RealFs {
    fn exists(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path)
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn make_writable(&self, path: &Path) -> io::Result<()> {
        let meta = std::fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if meta.is_dir() { 0o777 } else { 0o666 };
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        }
        #[cfg(not(unix))]
        {
            let mut permissions = meta.permissions();
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            std::fs::set_permissions(path, permissions)
        }
    }

    fn walk_bottom_up(&self, path: &Path) -> Vec<WalkEntry> {
        WalkDir::new(path)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(Result::ok)
            .map(|entry| WalkEntry {
                is_dir: entry.file_type().is_dir(),
                path: entry.into_path(),
            })
            .collect()
    }

    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Remove a directory tree, retrying until it is gone or the budget runs out.
///
/// Each attempt tries a whole-tree delete. When that fails the tree is swept
/// bottom-up: permissions are relaxed and entries are deleted one by one,
/// ignoring individual failures, before the whole-tree delete is retried.
/// Returns whether the path is gone afterwards.
pub fn force_remove_dir(fs: &dyn FileSystem, path: &Path, policy: RetryPolicy) -> bool {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        if !fs.exists(path) {
            return true;
        }

        if let Err(e) = fs.remove_dir_all(path) {
            tracing::debug!(path = %path.display(), attempt, error = %e, "whole-tree delete failed, sweeping");
            sweep(fs, path);
            let _ = fs.make_writable(path);
            if let Err(e) = fs.remove_dir_all(path) {
                tracing::debug!(path = %path.display(), attempt, error = %e, "delete after sweep failed");
            }
        }

        if !fs.exists(path) {
            return true;
        }
        if attempt < attempts {
            fs.sleep(policy.delay);
        }
    }

    let gone = !fs.exists(path);
    if !gone {
        tracing::warn!(path = %path.display(), attempts, "directory survived every removal attempt");
    }
    gone
}

fn sweep(fs: &dyn FileSystem, path: &Path) {
    let _ = fs.make_writable(path);
    for entry in fs.walk_bottom_up(path) {
        let _ = fs.make_writable(&entry.path);
        let result = if entry.is_dir {
            fs.remove_dir_all(&entry.path)
        } else {
            fs.remove_file(&entry.path)
        };
        if let Err(e) = result {
            tracing::trace!(path = %entry.path.display(), error = %e, "sweep could not delete entry");
        }
    }
}

/// In-memory filesystem with injectable delete failures
#[cfg(test)]
pub(crate) mod sim {
    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;

    #[derive(Default)]
    struct SimState {
        dirs: BTreeSet<PathBuf>,
        files: BTreeSet<PathBuf>,
        // Remaining failures for whole-tree deletes that cover the key
        failures: HashMap<PathBuf, usize>,
        sleeps: usize,
    }

    #[derive(Default)]
    pub(crate) struct SimFs {
        state: Mutex<SimState>,
    }

    impl SimFs {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn add_dir(&self, path: impl Into<PathBuf>) {
            let path = path.into();
            let mut state = self.state.lock().unwrap();
            for ancestor in path.ancestors() {
                if ancestor.as_os_str().is_empty() {
                    continue;
                }
                state.dirs.insert(ancestor.to_path_buf());
            }
        }

        pub(crate) fn add_file(&self, path: impl Into<PathBuf>) {
            let path = path.into();
            if let Some(parent) = path.parent() {
                self.add_dir(parent.to_path_buf());
            }
            self.state.lock().unwrap().files.insert(path);
        }

        /// Make the next `count` whole-tree deletes covering `path` fail
        pub(crate) fn fail_deletes(&self, path: impl Into<PathBuf>, count: usize) {
            self.state.lock().unwrap().failures.insert(path.into(), count);
        }

        pub(crate) fn sleeps(&self) -> usize {
            self.state.lock().unwrap().sleeps
        }
    }

    impl FileSystem for SimFs {
        fn exists(&self, path: &Path) -> bool {
            let state = self.state.lock().unwrap();
            state.dirs.contains(path) || state.files.contains(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.state.lock().unwrap().dirs.contains(path)
        }

        fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
            let state = self.state.lock().unwrap();
            if !state.dirs.contains(path) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
            }
            Ok(state
                .dirs
                .iter()
                .chain(state.files.iter())
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect())
        }

        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            self.add_dir(path.to_path_buf());
            Ok(())
        }

        fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.dirs.contains(path) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
            }
            let blocker = state
                .failures
                .iter()
                .find(|(key, remaining)| key.starts_with(path) && **remaining > 0)
                .map(|(key, _)| key.clone());
            if let Some(key) = blocker {
                if let Some(remaining) = state.failures.get_mut(&key) {
                    *remaining = remaining.saturating_sub(1);
                }
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "simulated lock"));
            }
            state.dirs.retain(|p| !p.starts_with(path));
            state.files.retain(|p| !p.starts_with(path));
            Ok(())
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.files.remove(path) {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such file"))
            }
        }

        fn make_writable(&self, _path: &Path) -> io::Result<()> {
            Ok(())
        }

        fn walk_bottom_up(&self, path: &Path) -> Vec<WalkEntry> {
            let state = self.state.lock().unwrap();
            let mut entries: Vec<WalkEntry> = state
                .dirs
                .iter()
                .filter(|p| p.starts_with(path) && p.as_path() != path)
                .map(|p| WalkEntry { path: p.clone(), is_dir: true })
                .chain(
                    state
                        .files
                        .iter()
                        .filter(|p| p.starts_with(path))
                        .map(|p| WalkEntry { path: p.clone(), is_dir: false }),
                )
                .collect();
            // Deepest first puts children before their parents
            entries.sort_by_key(|e| std::cmp::Reverse(e.path.components().count()));
            entries
        }

        fn sleep(&self, _delay: Duration) {
            self.state.lock().unwrap().sleeps += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimFs;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_force_remove_real_tree() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("kb");
        std::fs::create_dir_all(target.join("vectorstore/nested")).unwrap();
        std::fs::write(target.join("vectorstore/nested/data.bin"), b"bytes").unwrap();

        assert!(force_remove_dir(&RealFs, &target, RetryPolicy::default()));
        assert!(!target.exists());
        assert!(temp_dir.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_force_remove_read_only_tree() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("kb");
        let locked = target.join("locked");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::write(locked.join("file.txt"), b"x").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        let policy = RetryPolicy { attempts: 2, delay: Duration::from_millis(1) };
        assert!(force_remove_dir(&RealFs, &target, policy));
        assert!(!target.exists());
    }

    #[test]
    fn test_missing_path_counts_as_removed() {
        let fs = SimFs::new();
        assert!(force_remove_dir(&fs, Path::new("/kb/none"), RetryPolicy::default()));
        assert_eq!(fs.sleeps(), 0);
    }

    #[test]
    fn test_transient_failure_recovers() {
        let fs = SimFs::new();
        fs.add_file("/kb/a/vectorstore/index.bin");
        // Initial delete and post-sweep delete of attempt one both fail
        fs.fail_deletes("/kb/a", 2);

        assert!(force_remove_dir(&fs, Path::new("/kb/a"), RetryPolicy::default()));
        assert!(!fs.exists(Path::new("/kb/a")));
        assert_eq!(fs.sleeps(), 1);
    }

    #[test]
    fn test_permanent_failure_exhausts_budget() {
        let fs = SimFs::new();
        fs.add_dir("/kb/stuck");
        fs.fail_deletes("/kb/stuck", usize::MAX);

        let policy = RetryPolicy { attempts: 5, delay: Duration::from_millis(200) };
        assert!(!force_remove_dir(&fs, Path::new("/kb/stuck"), policy));
        assert!(fs.exists(Path::new("/kb/stuck")));
        // No pause after the last attempt
        assert_eq!(fs.sleeps(), 4);
    }

    #[test]
    fn test_sweep_removes_unlocked_children() {
        let fs = SimFs::new();
        fs.add_file("/kb/a/one.txt");
        fs.add_file("/kb/a/sub/two.txt");
        fs.fail_deletes("/kb/a", usize::MAX);

        let policy = RetryPolicy { attempts: 1, delay: Duration::ZERO };
        assert!(!force_remove_dir(&fs, Path::new("/kb/a"), policy));
        assert!(!fs.exists(Path::new("/kb/a/one.txt")));
        assert!(!fs.exists(Path::new("/kb/a/sub")));
        assert!(fs.exists(Path::new("/kb/a")));
    }
}
