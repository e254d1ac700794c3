//! Directory-backed secure store
//!
//! One file per record, written atomically (temp file + rename) with
//! owner-only permissions on Unix. Stands in for a platform keystore on
//! desktop and in the CLI.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use zeroize::Zeroizing;

use super::{validate_name, SecureStore};
use crate::error::StorageError;

/// File extension for stored records
const RECORD_EXTENSION: &str = "rec";

/// [`SecureStore`] backed by a directory on disk
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `base_path`
    pub fn new(base_path: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&base_path).map_err(|e| {
            StorageError::Unavailable(format!("Cannot create {:?}: {}", base_path, e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&base_path, fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { base_path })
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}", name, RECORD_EXTENSION))
    }
}

impl SecureStore for FileStore {
    fn put(&self, name: &str, blob: &[u8]) -> Result<(), StorageError> {
        validate_name(name)?;
        let path = self.record_path(name);
        let temp_path = path.with_extension("tmp");

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        {
            let mut file = options.open(&temp_path)?;
            // A leftover temp file keeps its old mode
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(blob)?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &path)?;
        debug!("Wrote record {} ({} bytes)", name, blob.len());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        validate_name(name)?;
        match fs::read(self.record_path(name)) {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, name: &str) -> Result<bool, StorageError> {
        validate_name(name)?;
        if !self.base_path.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "Store directory {:?} is missing",
                self.base_path
            )));
        }
        Ok(self.record_path(name).is_file())
    }

    fn erase(&self, name: &str) -> Result<(), StorageError> {
        validate_name(name)?;
        match fs::remove_file(self.record_path(name)) {
            Ok(()) => {
                debug!("Erased record {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
