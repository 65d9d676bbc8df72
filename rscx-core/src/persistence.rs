//! Persistence contract.
//!
//! Runtime nodes serialize themselves into a [`Bucket`], a nested key/value view
//! that a [`StorageProvider`] persists as bytes. Every stored node carries a
//! [`TypeInfo`] tag and its document id so a snapshot can be matched against the
//! model it was taken from.

use crate::error::CoreError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Well-known bucket keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    TypeInfo,
    DocumentId,
    Id,
    Name,
    Checksum,
    Root,
    Children,
    Transitions,
    Invokes,
    Configuration,
    StatesToInvoke,
    History,
    InternalQueue,
    DataModel,
    Invocations,
    Done,
    Result,
    Index(usize),
    Named(String),
}

impl Key {
    pub fn as_string(&self) -> String {
        match self {
            Key::TypeInfo => "$type".to_string(),
            Key::DocumentId => "$doc".to_string(),
            Key::Id => "id".to_string(),
            Key::Name => "name".to_string(),
            Key::Checksum => "checksum".to_string(),
            Key::Root => "root".to_string(),
            Key::Children => "children".to_string(),
            Key::Transitions => "transitions".to_string(),
            Key::Invokes => "invokes".to_string(),
            Key::Configuration => "configuration".to_string(),
            Key::StatesToInvoke => "states_to_invoke".to_string(),
            Key::History => "history".to_string(),
            Key::InternalQueue => "internal_queue".to_string(),
            Key::DataModel => "data_model".to_string(),
            Key::Invocations => "invocations".to_string(),
            Key::Done => "done".to_string(),
            Key::Result => "result".to_string(),
            Key::Index(i) => i.to_string(),
            Key::Named(s) => s.clone(),
        }
    }
}

/// Type tag written under [`Key::TypeInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeInfo {
    Model,
    StateNode,
    ParallelNode,
    FinalNode,
    HistoryNode,
    TransitionNode,
    InvokeNode,
    RuntimeContext,
    Invocation,
}

impl From<TypeInfo> for JsonValue {
    fn from(t: TypeInfo) -> Self {
        serde_json::to_value(t).unwrap_or(JsonValue::Null)
    }
}

/// Implemented by nodes that can write themselves into a bucket.
pub trait StoreSupport {
    fn store(&self, bucket: &mut Bucket);
}

/// A nested key/value document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bucket {
    entries: Map<String, JsonValue>,
}

impl Bucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: Key, value: impl Into<JsonValue>) {
        self.entries.insert(key.as_string(), value.into());
    }

    pub fn set_nested(&mut self, key: Key, bucket: Bucket) {
        self.entries
            .insert(key.as_string(), JsonValue::Object(bucket.entries));
    }

    pub fn get(&self, key: &Key) -> Option<&JsonValue> {
        self.entries.get(&key.as_string())
    }

    pub fn get_str(&self, key: &Key) -> Option<&str> {
        self.get(key).and_then(JsonValue::as_str)
    }

    pub fn get_u64(&self, key: &Key) -> Option<u64> {
        self.get(key).and_then(JsonValue::as_u64)
    }

    pub fn get_type_info(&self) -> Option<TypeInfo> {
        self.get(&Key::TypeInfo)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_nested(&self, key: &Key) -> Option<Bucket> {
        match self.get(key) {
            Some(JsonValue::Object(map)) => Some(Bucket {
                entries: map.clone(),
            }),
            _ => None,
        }
    }

    /// Nested buckets stored under `0`, `1`, ... in index order.
    pub fn indexed(&self) -> Vec<Bucket> {
        let mut out = Vec::new();
        let mut i = 0;
        while let Some(b) = self.get_nested(&Key::Index(i)) {
            out.push(b);
            i += 1;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(Self {
            entries: serde_json::from_slice(bytes)?,
        })
    }
}

/// Byte storage keyed by session.
pub trait StorageProvider: Send + Sync {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), CoreError>;
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    fn remove(&self, key: &str) -> Result<(), CoreError>;

    fn save_bucket(&self, key: &str, bucket: &Bucket) -> Result<(), CoreError> {
        self.save(key, &bucket.to_bytes()?)
    }

    fn load_bucket(&self, key: &str) -> Result<Option<Bucket>, CoreError> {
        self.load(key)?
            .map(|bytes| Bucket::from_bytes(&bytes))
            .transpose()
    }
}

/// Process-local storage.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StorageProvider for InMemoryStorage {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), CoreError> {
        self.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    fn remove(&self, key: &str) -> Result<(), CoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One file per key, written atomically and guarded by a crc32c checksum.
///
/// File layout: 8 hex digits of checksum, a newline, then the payload.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Opens or creates a storage directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.snap", safe))
    }
}

impl StorageProvider for FileStorage {
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), CoreError> {
        let path = self.path(key);
        let tmp = path.with_extension("snap.tmp");
        let checksum = format!("{:08x}\n", crc32c::crc32c(bytes));

        let mut file = File::create(&tmp)?;
        file.write_all(checksum.as_bytes())?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        tracing::debug!("Saved snapshot {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)?;
        if data.len() < 9 || data[8] != b'\n' {
            return Err(CoreError::Storage {
                reason: format!("snapshot {} is truncated", key),
            });
        }
        let (header, payload) = data.split_at(9);
        let expected = std::str::from_utf8(&header[..8]).unwrap_or_default();
        let actual = format!("{:08x}", crc32c::crc32c(payload));
        if expected != actual {
            return Err(CoreError::Storage {
                reason: format!("snapshot {} checksum mismatch", key),
            });
        }

        Ok(Some(payload.to_vec()))
    }

    fn remove(&self, key: &str) -> Result<(), CoreError> {
        let path = self.path(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bucket_nesting() {
        let mut bucket = Bucket::new();
        bucket.add(Key::TypeInfo, TypeInfo::StateNode);
        bucket.add(Key::DocumentId, 3u32);

        let mut children = Bucket::new();
        for i in 0..2 {
            let mut child = Bucket::new();
            child.add(Key::DocumentId, 4u32 + i);
            children.set_nested(Key::Index(i as usize), child);
        }
        bucket.set_nested(Key::Children, children);

        assert_eq!(bucket.get_type_info(), Some(TypeInfo::StateNode));
        assert_eq!(bucket.get_u64(&Key::DocumentId), Some(3));
        let kids = bucket.get_nested(&Key::Children).unwrap().indexed();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[1].get_u64(&Key::DocumentId), Some(5));
    }

    #[test]
    fn test_in_memory_storage() {
        let storage = InMemoryStorage::new();
        let mut bucket = Bucket::new();
        bucket.add(Key::Name, "traffic");

        storage.save_bucket("s1", &bucket).unwrap();
        assert_eq!(storage.load_bucket("s1").unwrap(), Some(bucket));
        storage.remove("s1").unwrap();
        assert!(storage.load("s1").unwrap().is_none());
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();

        let mut bucket = Bucket::new();
        bucket.add(Key::Checksum, "abcd1234");
        storage.save_bucket("session/1", &bucket).unwrap();

        let reopened = FileStorage::open(dir.path()).unwrap();
        assert_eq!(reopened.load_bucket("session/1").unwrap(), Some(bucket));
        assert!(reopened.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_file_storage_detects_corruption() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.save("s", b"{\"a\":1}").unwrap();

        let path = dir.path().join("s.snap");
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 2;
        data[last] = b'2';
        fs::write(&path, data).unwrap();

        let err = storage.load("s").unwrap_err();
        assert!(matches!(err, CoreError::Storage { .. }));
    }
}
