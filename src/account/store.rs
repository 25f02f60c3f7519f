//! Credential cache keyed by owner
//!
//! A cached credential lets a restarted session skip straight from
//! `checking` to `complete`. Entries live until an explicit logout.

use alloy::primitives::Address;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::credentials::Credential;

/// Get/set/clear access to cached credentials
pub trait CredentialStore: Send + Sync {
    fn get(&self, owner: Address) -> Result<Option<Credential>>;
    fn set(&self, owner: Address, credential: &Credential) -> Result<()>;
    fn clear(&self, owner: Address) -> Result<()>;
}

/// Process-local credential cache
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: DashMap<Address, Credential>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, owner: Address) -> Result<Option<Credential>> {
        Ok(self.entries.get(&owner).map(|entry| entry.value().clone()))
    }

    fn set(&self, owner: Address, credential: &Credential) -> Result<()> {
        self.entries.insert(owner, credential.clone());
        Ok(())
    }

    fn clear(&self, owner: Address) -> Result<()> {
        self.entries.remove(&owner);
        Ok(())
    }
}

/// JSON file cache, one entry per owner, readable only by the current user
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key(owner: Address) -> String {
        format!("{:#x}", owner)
    }

    fn load(&self) -> Result<BTreeMap<String, Credential>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Persistence(format!("Failed to read {}: {}", self.path.display(), e)))?;

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&content)
            .map_err(|e| Error::Persistence(format!("Failed to parse {}: {}", self.path.display(), e)))
    }

    fn save(&self, entries: &BTreeMap<String, Credential>) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let content = serde_json::to_string_pretty(entries)?;
        let write_err =
            |e: std::io::Error| Error::Persistence(format!("Failed to write {}: {}", self.path.display(), e));

        // Replace the cache atomically; a crash mid-write leaves the old file
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(write_err)?;
        }
        temp.write_all(content.as_bytes()).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;
        temp.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!("Saved {} cached credential(s) to {:?}", entries.len(), self.path);
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| Error::Internal("credential store lock poisoned".to_string()))
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, owner: Address) -> Result<Option<Credential>> {
        let _guard = self.guard()?;
        Ok(self.load()?.remove(&Self::key(owner)))
    }

    fn set(&self, owner: Address, credential: &Credential) -> Result<()> {
        let _guard = self.guard()?;
        let mut entries = self.load()?;
        entries.insert(Self::key(owner), credential.clone());
        self.save(&entries)?;
        info!("Cached credential for {}", owner);
        Ok(())
    }

    fn clear(&self, owner: Address) -> Result<()> {
        let _guard = self.guard()?;
        let mut entries = self.load()?;
        if entries.remove(&Self::key(owner)).is_some() {
            self.save(&entries)?;
            info!("Cleared cached credential for {}", owner);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const OWNER: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
    const OTHER: Address = address!("0000000000000000000000000000000000000001");

    fn credential() -> Credential {
        Credential {
            api_key: "key".to_string(),
            secret: "secret".to_string(),
            passphrase: "pass".to_string(),
        }
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        assert!(store.get(OWNER).unwrap().is_none());

        store.set(OWNER, &credential()).unwrap();
        assert_eq!(store.get(OWNER).unwrap(), Some(credential()));
        assert!(store.get(OTHER).unwrap().is_none());

        store.clear(OWNER).unwrap();
        assert!(store.get(OWNER).unwrap().is_none());
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("creds.json");

        FileCredentialStore::new(&path).set(OWNER, &credential()).unwrap();

        let reopened = FileCredentialStore::new(&path);
        assert_eq!(reopened.get(OWNER).unwrap(), Some(credential()));
        assert!(reopened.get(OTHER).unwrap().is_none());

        reopened.clear(OWNER).unwrap();
        assert!(FileCredentialStore::new(&path).get(OWNER).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        FileCredentialStore::new(&path).set(OWNER, &credential()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_readable_cache_is_tightened() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        FileCredentialStore::new(&path).set(OWNER, &credential()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("creds.json")]);
    }

    #[test]
    fn test_corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileCredentialStore::new(&path).get(OWNER).unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }
}
