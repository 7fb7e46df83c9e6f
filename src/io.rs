use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::err::{Error, Result};

/// Key-value blob persistence. Each key holds one complete JSON document.
pub trait Storage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, blob: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

pub type SharedStorage = Arc<dyn Storage>;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStorage {
        Arc::new(Self::new())
    }

    fn blobs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.blobs.lock().map_err(|_| Error::InternalError {
            kind: "StorageError",
            message: "memory storage lock poisoned".to_string(),
        })
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs()?.get(key).cloned())
    }

    fn write(&self, key: &str, blob: &str) -> Result<()> {
        self.blobs()?.insert(key.to_string(), blob.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.blobs()?.remove(key);
        Ok(())
    }
}

/// Stores every key as `<root>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn prepare<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::debug!("File storage ready at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(|c: char| c == '/' || c == '\\') || key.contains("..") {
            return Err(Error::invalid(format!("illegal storage key `{}`", key)));
        }
        Ok(self.root.join(format!("{}.json", key)))
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_of(key)?;
        match fs::read_to_string(&path) {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &str, blob: &str) -> Result<()> {
        let path = self.path_of(key)?;
        // rename over the target so readers never see a half-written blob
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(blob.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Reads a JSON array blob into typed records. A missing blob is an empty collection.
pub fn load_collection<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Vec<T>> {
    match storage.read(key)? {
        Some(blob) => serde_json::from_str(&blob).map_err(|err| Error::InternalError {
            kind: "CorruptCollection",
            message: format!("`{}`: {}", key, err),
        }),
        None => Ok(Vec::new()),
    }
}

pub fn save_collection<T: Serialize>(storage: &dyn Storage, key: &str, items: &[T]) -> Result<()> {
    let blob = serde_json::to_string(items)?;
    storage.write(key, &blob)
}

/// Monotonic id counter persisted next to a collection.
#[derive(Debug, Clone)]
pub struct Sequence {
    key: String,
}

impl Sequence {
    pub fn for_collection(collection: &str) -> Self {
        Self {
            key: format!("{}_seq", collection),
        }
    }

    /// Last id handed out: the stored counter or the largest numeric id among
    /// `existing`, whichever is higher.
    pub fn current<'a, I>(&self, storage: &dyn Storage, existing: I) -> Result<u64>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let stored = match storage.read(&self.key)? {
            Some(blob) => blob.trim().parse::<u64>().map_err(|err| Error::InternalError {
                kind: "CorruptSequence",
                message: format!("`{}`: {}", self.key, err),
            })?,
            None => 0,
        };
        let highest = existing
            .into_iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(stored.max(highest))
    }

    pub fn next<'a, I>(&self, storage: &dyn Storage, existing: I) -> Result<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let next = self.current(storage, existing)? + 1;
        storage.write(&self.key, &next.to_string())?;
        Ok(next.to_string())
    }

    /// Moves the counter forward to at least `floor`.
    pub fn advance_to<'a, I>(&self, storage: &dyn Storage, existing: I, floor: u64) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let current = self.current(storage, existing)?;
        if floor > current {
            storage.write(&self.key, &floor.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
    }

    #[test]
    fn memory_storage_reads_back_writes() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.read("k").unwrap(), None);
        storage.write("k", "[]").unwrap();
        assert_eq!(storage.read("k").unwrap().as_deref(), Some("[]"));
        storage.remove("k").unwrap();
        assert_eq!(storage.read("k").unwrap(), None);
    }

    #[test]
    fn file_storage_persists_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::prepare(dir.path().join("data")).unwrap();
        storage.write("students", "[1,2]").unwrap();
        assert!(dir.path().join("data/students.json").exists());

        let reopened = FileStorage::prepare(dir.path().join("data")).unwrap();
        assert_eq!(reopened.read("students").unwrap().as_deref(), Some("[1,2]"));

        reopened.remove("students").unwrap();
        reopened.remove("students").unwrap();
        assert_eq!(reopened.read("students").unwrap(), None);
    }

    #[test]
    fn file_storage_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::prepare(dir.path()).unwrap();
        assert!(matches!(
            storage.write("../escape", "x"),
            Err(Error::InvalidPayload { .. })
        ));
    }

    #[test]
    fn missing_collection_is_empty() {
        let storage = MemoryStorage::new();
        let rows: Vec<Row> = load_collection(&storage, "rows").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn corrupt_collection_is_reported() {
        let storage = MemoryStorage::new();
        storage.write("rows", "{not json").unwrap();
        let err = load_collection::<Row>(&storage, "rows").unwrap_err();
        assert!(matches!(err, Error::InternalError { kind: "CorruptCollection", .. }));
    }

    #[test]
    fn sequence_starts_from_legacy_max() {
        let storage = MemoryStorage::new();
        let seq = Sequence::for_collection("rows");
        let next = seq.next(&storage, ["3", "a1", "12"]).unwrap();
        assert_eq!(next, "13");
        // lower ids never move the counter back
        assert_eq!(seq.next(&storage, ["1"]).unwrap(), "14");
    }

    #[test]
    fn sequence_skips_ids_written_behind_its_back() {
        let storage = MemoryStorage::new();
        let seq = Sequence::for_collection("rows");
        assert_eq!(seq.next(&storage, ["0"]).unwrap(), "1");
        assert_eq!(seq.next(&storage, ["1", "2", "7"]).unwrap(), "8");
        assert_eq!(storage.read("rows_seq").unwrap(), Some("8".to_string()));
    }

    #[test]
    fn sequence_advance_never_moves_back() {
        let storage = MemoryStorage::new();
        let seq = Sequence::for_collection("rows");
        seq.advance_to(&storage, std::iter::empty::<&str>(), 5).unwrap();
        seq.advance_to(&storage, std::iter::empty::<&str>(), 2).unwrap();
        assert_eq!(seq.next(&storage, std::iter::empty::<&str>()).unwrap(), "6");
    }
}
