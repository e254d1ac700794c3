//! In-memory secure store for tests and ephemeral sessions

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use zeroize::Zeroizing;

use super::{validate_name, SecureStore};
use crate::error::StorageError;

/// Heap-backed [`SecureStore`] with fault injection.
///
/// Share one instance (behind an `Arc`) between two sessions to simulate a
/// process restart against the same device storage.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
    unavailable: AtomicBool,
    fail_erase: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StorageError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `erase` fail with `StorageError::IoFailure`
    pub fn set_fail_erase(&self, fail: bool) {
        self.fail_erase.store(fail, Ordering::SeqCst);
    }

    /// Raw access for corruption tests
    pub fn tamper<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut Vec<u8>),
    {
        match self.entries.lock() {
            Ok(mut entries) => match entries.get_mut(name) {
                Some(blob) => {
                    f(&mut **blob);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Zeroizing<Vec<u8>>>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".into()))
    }
}

impl SecureStore for MemoryStore {
    fn put(&self, name: &str, blob: &[u8]) -> Result<(), StorageError> {
        validate_name(name)?;
        self.check_available()?;
        self.entries()?
            .insert(name.to_string(), Zeroizing::new(blob.to_vec()));
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        validate_name(name)?;
        self.check_available()?;
        Ok(self.entries()?.get(name).cloned())
    }

    fn exists(&self, name: &str) -> Result<bool, StorageError> {
        validate_name(name)?;
        self.check_available()?;
        Ok(self.entries()?.contains_key(name))
    }

    fn erase(&self, name: &str) -> Result<(), StorageError> {
        validate_name(name)?;
        self.check_available()?;
        if self.fail_erase.load(Ordering::SeqCst) {
            return Err(StorageError::IoFailure("simulated erase failure".into()));
        }
        self.entries()?.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_erase() {
        let store = MemoryStore::new();
        assert!(!store.exists("a").unwrap());

        store.put("a", b"blob").unwrap();
        assert!(store.exists("a").unwrap());
        assert_eq!(store.get("a").unwrap().unwrap().as_slice(), b"blob");

        store.erase("a").unwrap();
        assert!(store.get("a").unwrap().is_none());

        // Idempotent
        store.erase("a").unwrap();
    }

    #[test]
    fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.put("a", b"x"), Err(StorageError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.put("a", b"x").is_ok());
    }

    #[test]
    fn test_fail_erase() {
        let store = MemoryStore::new();
        store.put("a", b"x").unwrap();
        store.set_fail_erase(true);
        assert!(matches!(store.erase("a"), Err(StorageError::IoFailure(_))));
        assert!(store.exists("a").unwrap());
    }

    #[test]
    fn test_tamper() {
        let store = MemoryStore::new();
        store.put("a", b"abc").unwrap();
        assert!(store.tamper("a", |blob| blob[0] = b'z'));
        assert_eq!(store.get("a").unwrap().unwrap().as_slice(), b"zbc");
        assert!(!store.tamper("missing", |_| {}));
    }
}
