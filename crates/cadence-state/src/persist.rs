//! Scoped key-value persistence for the local ledger

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use cadence_core::{Address, CadenceError, CadenceResult, ChainId, GenesisHash};

/// String key-value storage
///
/// Writes are synchronous. Callers treat failures as non-fatal.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> CadenceResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> CadenceResult<()>;
}

/// Deployment a ledger belongs to
///
/// Keys include chain, genesis and contract so state never leaks across
/// chains, resets of a dev chain or redeployments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StorageScope {
    pub chain_id: ChainId,
    pub genesis_hash: GenesisHash,
    pub contract: Address,
}

impl StorageScope {
    pub fn new(chain_id: ChainId, genesis_hash: GenesisHash, contract: Address) -> Self {
        StorageScope {
            chain_id,
            genesis_hash,
            contract,
        }
    }

    /// Storage key of the state owned by `owner`
    pub fn key(&self, owner: &Address) -> String {
        format!(
            "__private__{}_{}_{}_{}",
            self.chain_id, self.genesis_hash, self.contract, owner
        )
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> CadenceResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> CadenceResult<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Directory-backed store, one file per key
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> CadenceResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            CadenceError::Persistence(format!("cannot create {}: {e}", dir.display()))
        })?;
        Ok(FileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> CadenceResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CadenceError::Persistence(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> CadenceResult<()> {
        let path = self.path_for(key);
        // Write then rename so a crash never leaves a truncated file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).map_err(|e| CadenceError::Persistence(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| CadenceError::Persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> StorageScope {
        StorageScope::new(
            ChainId(31337),
            GenesisHash::from_bytes([1; 32]),
            Address::from_bytes([2; 20]),
        )
    }

    #[test]
    fn test_key_is_scoped() {
        let owner = Address::from_bytes([3; 20]);
        let key = scope().key(&owner);
        assert!(key.starts_with("__private__31337_0x0101"));
        assert!(key.ends_with(&owner.to_hex()));

        let other_chain = StorageScope {
            chain_id: ChainId(1),
            ..scope()
        };
        assert_ne!(other_chain.key(&owner), key);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = scope().key(&Address::from_bytes([9; 20]));
        {
            let store = FileStore::open(dir.path().join("ledger")).unwrap();
            assert_eq!(store.get(&key).unwrap(), None);
            store.set(&key, r#"{"tutorialSeen":true}"#).unwrap();
        }
        let store = FileStore::open(dir.path().join("ledger")).unwrap();
        assert_eq!(store.get(&key).unwrap().as_deref(), Some(r#"{"tutorialSeen":true}"#));
    }
}
