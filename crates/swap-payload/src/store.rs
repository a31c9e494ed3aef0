//! Write-once, content-addressed payload storage
//!
//! [`PayloadStore`] places each payload at `dir/instruments-<fingerprint>.jar`.
//! Because the name is derived from the fingerprint, writing the same payload
//! twice is a no-op and two builds never collide on one path.
//!
//! # Publication
//!
//! Bytes are written to a temporary file in the target directory, synced, and
//! then linked into place without clobbering. A reader therefore never sees a
//! partially written file under the final name, and a failed write leaves
//! nothing behind but (at most) the temporary file, which is removed on drop.

use crate::payload::Payload;
use std::io::{self, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Owner read/write only
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Directory holding content-addressed payload files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadStore {
    dir: PathBuf,
}

impl PayloadStore {
    /// Create a store rooted at `dir`
    #[inline]
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Final path of `payload` inside this store
    #[must_use]
    pub fn artifact_path(&self, payload: &Payload) -> PathBuf {
        self.dir.join(payload.file_name())
    }

    /// Make sure `payload` exists on disk, writing it if absent
    ///
    /// An existing file is left untouched.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the directory cannot be created or the
    /// payload cannot be written and published.
    pub fn ensure_written(&self, payload: &Payload) -> Result<PathBuf, StoreError> {
        let target = self.artifact_path(payload);
        if target.is_file() {
            tracing::debug!(path = %target.display(), "payload already on disk");
            return Ok(target);
        }

        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let write_err = |source| StoreError::Write {
            path: target.clone(),
            source,
        };

        let mut staged = NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        restrict_permissions(staged.as_file()).map_err(write_err)?;
        staged.write_all(payload.bytes()).map_err(write_err)?;
        staged.as_file().sync_all().map_err(write_err)?;

        match staged.persist_noclobber(&target) {
            Ok(_) => {
                tracing::info!(
                    path = %target.display(),
                    bytes = payload.len(),
                    fingerprint = %payload.fingerprint().short(),
                    "payload written"
                );
                Ok(target)
            }
            // Another publisher got there first with identical content.
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(target),
            Err(e) => Err(StoreError::Publish {
                path: target,
                source: e.error,
            }),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &std::fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(FILE_MODE))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &std::fs::File) -> io::Result<()> {
    Ok(())
}

/// Errors that can occur while storing a payload
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Target directory could not be created
    #[error("cannot create payload directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    /// Payload bytes could not be staged
    #[error("cannot write payload {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    /// Staged payload could not be moved to its final name
    #[error("cannot publish payload {}: {source}", path.display())]
    Publish { path: PathBuf, source: io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        let payload = Payload::new(b"payload bytes".to_vec());

        let path = store.ensure_written(&payload).unwrap();
        assert_eq!(path, dir.path().join(payload.file_name()));
        assert_eq!(std::fs::read(&path).unwrap(), payload.bytes());
    }

    #[cfg(unix)]
    #[test]
    fn written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        let path = store.ensure_written(&Payload::new(b"p".to_vec())).unwrap();
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn existing_file_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        let payload = Payload::new(b"original".to_vec());
        let path = store.artifact_path(&payload);

        std::fs::write(&path, b"sentinel").unwrap();
        store.ensure_written(&payload).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"sentinel");
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("pkg").join(".studio");
        let store = PayloadStore::new(&nested);
        store.ensure_written(&Payload::new(b"x".to_vec())).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn no_staging_leftovers_after_publish() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::new(dir.path());
        store.ensure_written(&Payload::new(b"x".to_vec())).unwrap();
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn unwritable_directory_reports_create_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let store = PayloadStore::new(blocker.join("sub"));

        let err = store.ensure_written(&Payload::new(b"x".to_vec())).unwrap_err();
        assert!(matches!(err, StoreError::CreateDir { ref path, .. } if *path == blocker.join("sub")));
    }
}
