//! Host-side backing store for the persistent policy file (§6) and its
//! degraded fallback, implemented over the filesystem in place of the
//! resident target's real-mode file I/O.

use std::fs;
use std::path::{Path, PathBuf};

use isanic_policy::{Backoff, DegradedFallback, PolicyStore};

/// Writes the policy record to a path via temp-file-then-rename, matching
/// the atomicity [`PolicyStore::try_write`] documents.
pub struct FilePolicyStore {
    path: PathBuf,
}

impl FilePolicyStore {
    /// Targets `path` as the primary policy file.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl PolicyStore for FilePolicyStore {
    fn read(&mut self) -> Option<[u8; 16]> {
        let bytes = fs::read(&self.path).ok()?;
        bytes.try_into().ok()
    }

    fn try_write(&mut self, bytes: [u8; 16]) -> Result<(), ()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|_| ())?;
        fs::rename(&tmp, &self.path).map_err(|_| ())
    }
}

/// Degraded fallback backed by a second, separately named file — standing
/// in for the environment-variable stash the resident target uses, which a
/// freshly spawned host process cannot persist across invocations.
pub struct FileFallback {
    path: PathBuf,
}

impl FileFallback {
    /// Targets `path` as the fallback stash.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DegradedFallback for FileFallback {
    fn stash(&mut self, bytes: [u8; 16]) {
        let _ = fs::write(&self.path, bytes);
    }

    fn recall(&mut self) -> Option<[u8; 16]> {
        let bytes = fs::read(&self.path).ok()?;
        bytes.try_into().ok()
    }
}

/// No-op backoff: a host process has no TSR scheduler to spin a calibrated
/// busy loop on, and retrying a local filesystem write instantly is fine.
pub struct ImmediateBackoff;

impl Backoff for ImmediateBackoff {
    fn wait(&mut self, _attempt: u8) {}
}

/// Default location for the primary policy file, next to the loader
/// binary's working directory.
#[must_use]
pub fn default_policy_path() -> PathBuf {
    Path::new("isanic.policy").to_path_buf()
}

/// Default location for the degraded fallback stash.
#[must_use]
pub fn default_fallback_path() -> PathBuf {
    Path::new("isanic.policy.fallback").to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_a_temp_file() {
        let dir = std::env::temp_dir().join(format!("isanic-loader-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut store = FilePolicyStore::new(dir.join("policy.bin"));
        assert_eq!(store.read(), None);
        store.try_write([7u8; 16]).unwrap();
        assert_eq!(store.read(), Some([7u8; 16]));
        fs::remove_dir_all(&dir).ok();
    }
}
