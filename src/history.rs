//! Durable storage of the latest successful execution of every task.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::TaskIdentity;
use crate::error::StorageError;
use crate::snapshot::Snapshot;

/// Version of the on-disk record envelope written by this build.
pub const RECORD_VERSION: u32 = 1;

/// How the committed execution treated its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The task rebuilt everything.
    Full,
    /// The task only processed the reported input changes.
    Incremental,
}

/// The unit persisted in a [`HistoryStore`]: what a task saw and produced the
/// last time it completed successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub identity: TaskIdentity,
    pub inputs: Snapshot,
    pub outputs: Snapshot,
    pub outcome: Outcome,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
}

impl ExecutionRecord {
    pub fn new(identity: TaskIdentity, inputs: Snapshot, outputs: Snapshot, outcome: Outcome) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        Self {
            identity,
            inputs,
            outputs,
            outcome,
            timestamp,
        }
    }
}

/// Keyed storage for [`ExecutionRecord`]s, shared by every task of a build.
///
/// Implementations must make `commit` atomic with respect to `load`: a reader
/// observes either the previous record or the new one. Operations on distinct
/// identities must not block each other.
pub trait HistoryStore: Send + Sync {
    fn load(&self, identity: &TaskIdentity) -> Result<Option<Arc<ExecutionRecord>>, StorageError>;

    fn commit(&self, identity: &TaskIdentity, record: ExecutionRecord) -> Result<(), StorageError>;

    fn invalidate(&self, identity: &TaskIdentity) -> Result<(), StorageError>;
}

impl<T> HistoryStore for Arc<T>
where
    T: HistoryStore + ?Sized,
{
    fn load(&self, identity: &TaskIdentity) -> Result<Option<Arc<ExecutionRecord>>, StorageError> {
        (**self).load(identity)
    }

    fn commit(&self, identity: &TaskIdentity, record: ExecutionRecord) -> Result<(), StorageError> {
        (**self).commit(identity, record)
    }

    fn invalidate(&self, identity: &TaskIdentity) -> Result<(), StorageError> {
        (**self).invalidate(identity)
    }
}

/// One lock per identity. The outer map is only write-locked the first time
/// an identity is seen.
struct Slots<T> {
    map: RwLock<HashMap<TaskIdentity, Arc<RwLock<T>>>>,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Default> Slots<T> {
    fn get(&self, identity: &TaskIdentity) -> Option<Arc<RwLock<T>>> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        map.get(identity).cloned()
    }

    fn get_or_insert(&self, identity: &TaskIdentity) -> Arc<RwLock<T>> {
        if let Some(slot) = self.get(identity) {
            return slot;
        }

        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(identity.clone()).or_default().clone()
    }
}

/// In-process history, lost when the process exits.
#[derive(Default)]
pub struct MemoryHistory {
    slots: Slots<Option<Arc<ExecutionRecord>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistory {
    fn load(&self, identity: &TaskIdentity) -> Result<Option<Arc<ExecutionRecord>>, StorageError> {
        Ok(self.slots.get(identity).and_then(|slot| {
            let record = slot.read().unwrap_or_else(PoisonError::into_inner);
            record.clone()
        }))
    }

    fn commit(&self, identity: &TaskIdentity, record: ExecutionRecord) -> Result<(), StorageError> {
        let slot = self.slots.get_or_insert(identity);
        let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
        *current = Some(Arc::new(record));
        Ok(())
    }

    fn invalidate(&self, identity: &TaskIdentity) -> Result<(), StorageError> {
        if let Some(slot) = self.slots.get(identity) {
            let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
            *current = None;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    version: u32,
    record: &'a ExecutionRecord,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    version: u32,
    record: ciborium::Value,
}

/// History persisted as one CBOR file per task in a directory.
///
/// Commits write a temporary sibling file and rename it over the previous
/// record, so a crash mid-write leaves the previous record intact.
pub struct FileHistory {
    dir: Utf8PathBuf,
    locks: Slots<()>,
}

impl FileHistory {
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            locks: Slots::default(),
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Location of the record file for a task.
    pub fn path_for(&self, identity: &TaskIdentity) -> Utf8PathBuf {
        self.dir.join(format!("{}.cbor", identity.digest().to_hex()))
    }

    fn decode(&self, identity: &TaskIdentity, bytes: &[u8]) -> Result<Option<ExecutionRecord>, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt {
            key: identity.key(),
            reason,
        };

        let envelope: EnvelopeIn = ciborium::from_reader(bytes).map_err(|err| corrupt(err.to_string()))?;

        if envelope.version > RECORD_VERSION {
            tracing::warn!(
                task = %identity,
                version = envelope.version,
                "history record has an unknown version, invalidating"
            );
            return Ok(None);
        }

        let record: ExecutionRecord = envelope
            .record
            .deserialized()
            .map_err(|err| corrupt(err.to_string()))?;

        if &record.identity != identity {
            return Err(corrupt(format!("record belongs to '{}'", record.identity)));
        }

        Ok(Some(record))
    }

    fn write_atomic(&self, path: &Utf8Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|err| err.error)?;
        sync_dir(&self.dir)
    }
}

/// Makes a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Utf8Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_: &Utf8Path) -> std::io::Result<()> {
    Ok(())
}

impl HistoryStore for FileHistory {
    fn load(&self, identity: &TaskIdentity) -> Result<Option<Arc<ExecutionRecord>>, StorageError> {
        let slot = self.locks.get_or_insert(identity);
        let guard = slot.read().unwrap_or_else(PoisonError::into_inner);

        let path = self.path_for(identity);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if let Some(record) = self.decode(identity, &bytes)? {
            return Ok(Some(Arc::new(record)));
        }

        drop(guard);
        let _guard = slot.write().unwrap_or_else(PoisonError::into_inner);

        // A commit may have replaced the unreadable record in the meantime.
        if let Ok(bytes) = fs::read(&path)
            && matches!(self.decode(identity, &bytes), Ok(None))
        {
            fs::remove_file(&path)?;
        }

        Ok(None)
    }

    fn commit(&self, identity: &TaskIdentity, record: ExecutionRecord) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(
            &EnvelopeOut {
                version: RECORD_VERSION,
                record: &record,
            },
            &mut bytes,
        )
        .map_err(|err| StorageError::Encode {
            key: identity.key(),
            reason: err.to_string(),
        })?;

        let slot = self.locks.get_or_insert(identity);
        let _guard = slot.write().unwrap_or_else(PoisonError::into_inner);

        let path = self.path_for(identity);
        self.write_atomic(&path, &bytes)?;
        tracing::debug!(task = %identity, %path, size = bytes.len(), "committed history record");

        Ok(())
    }

    fn invalidate(&self, identity: &TaskIdentity) -> Result<(), StorageError> {
        let slot = self.locks.get_or_insert(identity);
        let _guard = slot.write().unwrap_or_else(PoisonError::into_inner);

        match fs::remove_file(self.path_for(identity)) {
            Ok(()) => {
                tracing::debug!(task = %identity, "invalidated history record");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Hash32;
    use crate::snapshot::{Entry, EntryKind, PropertySnapshot};

    fn snapshot(items: &[(&str, &str)]) -> Snapshot {
        let mut property = PropertySnapshot::new();
        for (path, content) in items {
            property.insert(
                *path,
                Entry {
                    kind: EntryKind::File,
                    fingerprint: Hash32::hash(content),
                    size: content.len() as u64,
                    modified: Some(1),
                },
            );
        }

        let mut snapshot = Snapshot::new();
        snapshot.insert("files", property);
        snapshot
    }

    fn record(identity: &TaskIdentity, content: &str) -> ExecutionRecord {
        ExecutionRecord::new(
            identity.clone(),
            snapshot(&[("/in/a.txt", content)]),
            snapshot(&[("/out/a.o", content)]),
            Outcome::Full,
        )
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_memory_roundtrip_and_replace() {
        let store = MemoryHistory::new();
        let id = TaskIdentity::new(":app", "compile");

        assert!(store.load(&id).unwrap().is_none());

        let first = record(&id, "v1");
        store.commit(&id, first.clone()).unwrap();
        assert_eq!(*store.load(&id).unwrap().unwrap(), first);

        store.commit(&id, record(&id, "v2")).unwrap();
        let loaded = store.load(&id).unwrap().unwrap();
        assert_eq!(loaded.inputs, snapshot(&[("/in/a.txt", "v2")]));

        store.invalidate(&id).unwrap();
        assert!(store.load(&id).unwrap().is_none());
    }

    #[test]
    fn test_file_history_survives_reopen() {
        let (_dir, root) = scratch();
        let id = TaskIdentity::new(":app", "compile");
        let committed = record(&id, "v1");

        {
            let store = FileHistory::open(root.join("history")).unwrap();
            store.commit(&id, committed.clone()).unwrap();
        }

        let store = FileHistory::open(root.join("history")).unwrap();
        let loaded = store.load(&id).unwrap().unwrap();
        assert_eq!(*loaded, committed);
        assert_eq!(fs::read_dir(root.join("history")).unwrap().count(), 1);

        store.invalidate(&id).unwrap();
        assert!(store.load(&id).unwrap().is_none());
        store.invalidate(&id).unwrap();
    }

    #[test]
    fn test_file_history_unknown_version_is_invalidated() {
        let (_dir, root) = scratch();
        let store = FileHistory::open(&root).unwrap();
        let id = TaskIdentity::new(":app", "compile");

        let mut bytes = Vec::new();
        ciborium::into_writer(
            &EnvelopeOut {
                version: RECORD_VERSION + 1,
                record: &record(&id, "future"),
            },
            &mut bytes,
        )
        .unwrap();
        fs::write(store.path_for(&id), bytes).unwrap();

        assert!(store.load(&id).unwrap().is_none());
        assert!(!store.path_for(&id).exists());
    }

    #[test]
    fn test_file_history_corrupt_record() {
        let (_dir, root) = scratch();
        let store = FileHistory::open(&root).unwrap();
        let id = TaskIdentity::new(":app", "compile");

        fs::write(store.path_for(&id), b"definitely not cbor").unwrap();

        let err = store.load(&id).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { ref key, .. } if key == ":app:compile"));
    }

    #[test]
    fn test_file_history_rejects_foreign_record() {
        let (_dir, root) = scratch();
        let store = FileHistory::open(&root).unwrap();
        let id = TaskIdentity::new(":app", "compile");
        let other = TaskIdentity::new(":lib", "compile");

        store.commit(&other, record(&other, "v1")).unwrap();
        fs::rename(store.path_for(&other), store.path_for(&id)).unwrap();

        assert!(matches!(store.load(&id), Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn test_concurrent_commits_distinct_keys() {
        let (_dir, root) = scratch();
        let stores: Vec<Box<dyn HistoryStore>> = vec![
            Box::new(MemoryHistory::new()),
            Box::new(FileHistory::open(&root).unwrap()),
        ];

        for store in &stores {
            let ids: Vec<TaskIdentity> = (0..8)
                .map(|i| TaskIdentity::new(":app", format!("task{i}")))
                .collect();

            std::thread::scope(|scope| {
                for id in &ids {
                    let store = store.as_ref();
                    scope.spawn(move || {
                        for round in 0..10 {
                            let content = format!("{}-{round}", id.name());
                            store.commit(id, record(id, &content)).unwrap();
                        }
                    });
                }
            });

            for id in &ids {
                let loaded = store.load(id).unwrap().unwrap();
                assert_eq!(&loaded.identity, id);
                let content = format!("{}-9", id.name());
                assert_eq!(loaded.inputs, snapshot(&[("/in/a.txt", content.as_str())]));
                assert_eq!(loaded.outputs, snapshot(&[("/out/a.o", content.as_str())]));
            }
        }
    }

    #[test]
    fn test_two_stores_sharing_a_directory() {
        let (_dir, root) = scratch();
        let first = FileHistory::open(&root).unwrap();
        let second = FileHistory::open(&root).unwrap();
        let id = TaskIdentity::new(":app", "compile");

        std::thread::scope(|scope| {
            for store in [&first, &second] {
                let id = &id;
                scope.spawn(move || {
                    for round in 0..25 {
                        store.commit(id, record(id, &format!("v{round}"))).unwrap();
                    }
                });
            }
        });

        let loaded = first.load(&id).unwrap().unwrap();
        assert_eq!(loaded.identity, id);
        assert_eq!(*second.load(&id).unwrap().unwrap(), *loaded);
        assert_eq!(fs::read_dir(&root).unwrap().count(), 1);
    }

    #[test]
    fn test_readers_never_see_partial_records() {
        let (_dir, root) = scratch();
        let store = FileHistory::open(&root).unwrap();
        let id = TaskIdentity::new(":app", "compile");
        store.commit(&id, record(&id, "v0")).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 1..50 {
                    store.commit(&id, record(&id, &format!("v{round}"))).unwrap();
                }
            });

            scope.spawn(|| {
                for _ in 0..50 {
                    // inputs and outputs of one record are always written together
                    let loaded = store.load(&id).unwrap().unwrap();
                    let input = loaded.inputs.get("files").unwrap().get("/in/a.txt").unwrap();
                    let output = loaded.outputs.get("files").unwrap().get("/out/a.o").unwrap();
                    assert_eq!(input.fingerprint, output.fingerprint);
                }
            });
        });
    }
}
