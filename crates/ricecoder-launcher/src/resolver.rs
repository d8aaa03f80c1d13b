//! PATH resolution with an explicit, shareable cache

use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ProcessError, Result};

/// Default number of cached program lookups
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Resolves bare program names against `PATH`
///
/// Owned by a launcher and shared by reference; there is no process-wide cache.
pub struct PathResolver {
    cache: Mutex<LruCache<(String, Option<PathBuf>), PathBuf>>,
    search_path: Option<OsString>,
}

impl PathResolver {
    /// Resolver searching the process `PATH`
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            search_path: None,
        }
    }

    /// Resolver searching an explicit `PATH`-style list
    pub fn with_search_path(capacity: usize, search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
            ..Self::new(capacity)
        }
    }

    /// Resolve `program` to an executable path
    ///
    /// Paths with more than one component are returned unchanged; the OS
    /// resolves them relative to the working directory. Misses are not cached.
    pub fn resolve(&self, program: &Path, cwd: Option<&Path>) -> Result<PathBuf> {
        if program.components().count() != 1 || program.is_absolute() {
            return Ok(program.to_path_buf());
        }

        let name = program.to_string_lossy().into_owned();
        let key = (name.clone(), cwd.map(Path::to_path_buf));
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(hit.clone());
        }

        let cwd = match cwd {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir()?,
        };
        let search_path = self
            .search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"));

        let resolved = which::which_in(&name, search_path, &cwd)
            .map_err(|_| ProcessError::NotFound { program: name })?;

        debug!(program = %program.display(), resolved = %resolved.display(), "Resolved program");
        self.cache.lock().put(key, resolved.clone());
        Ok(resolved)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_resolves_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let tool = executable(dir.path(), "launcher-probe");
        let resolver = PathResolver::with_search_path(4, dir.path().as_os_str());

        let resolved = resolver
            .resolve(Path::new("launcher-probe"), Some(dir.path()))
            .unwrap();
        assert_eq!(resolved, tool);
        assert_eq!(resolver.len(), 1);

        // Cached entry survives removal of the file.
        std::fs::remove_file(&tool).unwrap();
        let again = resolver
            .resolve(Path::new("launcher-probe"), Some(dir.path()))
            .unwrap();
        assert_eq!(again, tool);

        resolver.clear();
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_missing_program_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::with_search_path(4, dir.path().as_os_str());

        let err = resolver
            .resolve(Path::new("no-such-launcher-probe"), Some(dir.path()))
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { .. }));
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_paths_pass_through() {
        let resolver = PathResolver::default();
        let path = Path::new("./scripts/run.sh");
        assert_eq!(resolver.resolve(path, None).unwrap(), path);
        let abs = Path::new("/bin/sh");
        assert_eq!(resolver.resolve(abs, None).unwrap(), abs);
    }
}
