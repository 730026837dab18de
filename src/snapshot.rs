//! Fingerprinted captures of task properties.
//!
//! A [`Snapshot`] holds one [`PropertySnapshot`] per declared property, and
//! each property snapshot is an ordered map from a normalized absolute path to
//! an [`Entry`]. Because both levels are `BTreeMap`s, two snapshots of the same
//! file-system state compare equal no matter in which order the file system
//! was traversed.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::SnapshotError;

const TAG_FILE: &[u8] = b"file\0";
const TAG_DIRECTORY: &[u8] = b"directory\0";
const TAG_MISSING: &[u8] = b"missing\0";
const TAG_VALUE: &[u8] = b"value\0";

/// What a snapshot entry was when it was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Missing,
    /// A scalar property. Scalar properties have a single entry with an empty
    /// path.
    Value,
}

/// One fingerprinted path (or scalar value) of a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub kind: EntryKind,
    pub fingerprint: Hash32,
    #[serde(default)]
    pub size: u64,
    /// Last modification time in nanoseconds since the Unix epoch.
    #[serde(default)]
    pub modified: Option<u64>,
}

impl Entry {
    fn directory(path: &Utf8Path) -> Self {
        Self {
            kind: EntryKind::Directory,
            fingerprint: Hash32::hash_tagged(TAG_DIRECTORY, path.as_str()),
            size: 0,
            modified: None,
        }
    }

    fn missing(path: &Utf8Path) -> Self {
        Self {
            kind: EntryKind::Missing,
            fingerprint: Hash32::hash_tagged(TAG_MISSING, path.as_str()),
            size: 0,
            modified: None,
        }
    }

    fn value(bytes: &[u8]) -> Self {
        Self {
            kind: EntryKind::Value,
            fingerprint: Hash32::hash_tagged(TAG_VALUE, bytes),
            size: bytes.len() as u64,
            modified: None,
        }
    }

    /// Whether this entry may carry over its fingerprint to a file with the
    /// given metadata, without rehashing the content.
    fn reusable_for(&self, size: u64, modified: Option<u64>) -> bool {
        self.kind == EntryKind::File
            && self.size == size
            && modified.is_some()
            && self.modified == modified
    }
}

/// Fingerprints of all entries of a single declared property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    entries: BTreeMap<Utf8PathBuf, Entry>,
}

impl PropertySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<Utf8PathBuf>, entry: Entry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&Entry> {
        self.entries.get(path.as_ref())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Utf8Path, &Entry)> {
        self.entries.iter().map(|(path, entry)| (path.as_path(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Combined fingerprint over every `(path, fingerprint)` pair in path order.
    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        for (path, entry) in &self.entries {
            hasher.update(path.as_str().as_bytes());
            hasher.update(&[0]);
            hasher.update(entry.fingerprint.as_bytes());
        }
        hasher.finalize().into()
    }
}

/// Snapshots of every property on one side (inputs or outputs) of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    properties: BTreeMap<String, PropertySnapshot>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, property: impl Into<String>, snapshot: PropertySnapshot) {
        self.properties.insert(property.into(), snapshot);
    }

    pub fn get(&self, property: &str) -> Option<&PropertySnapshot> {
        self.properties.get(property)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertySnapshot)> {
        self.properties.iter().map(|(name, snapshot)| (name.as_str(), snapshot))
    }

    /// Every entry of every property, ordered by property name and then path.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Utf8Path, &Entry)> {
        self.properties.iter().flat_map(|(name, snapshot)| {
            snapshot
                .entries()
                .map(move |(path, entry)| (name.as_str(), path, entry))
        })
    }

    /// Paths of all entries that existed on disk as files when captured.
    pub fn files(&self) -> impl Iterator<Item = &Utf8Path> {
        self.entries()
            .filter(|(_, _, entry)| entry.kind == EntryKind::File)
            .map(|(_, path, _)| path)
    }

    pub fn is_empty(&self) -> bool {
        self.properties.values().all(PropertySnapshot::is_empty)
    }

    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        for (name, snapshot) in &self.properties {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(snapshot.fingerprint().as_bytes());
        }
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Paths(Vec<Utf8PathBuf>),
    Glob(String),
    Value(Vec<u8>),
}

/// A declared input or output property of a task.
///
/// # Example
///
/// ```rust
/// use uptodate::Property;
///
/// let inputs = vec![
///     Property::files("sources", ["src/main.rs", "src/lib.rs"]),
///     Property::glob("assets", "assets/**/*.png").optional(),
///     Property::value("profile", "release"),
/// ];
/// # let _ = inputs;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    name: String,
    source: Source,
    required: bool,
}

impl Property {
    /// Files or directory trees. Directories are walked recursively.
    pub fn files<I, P>(name: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            name: name.into(),
            source: Source::Paths(paths.into_iter().map(Into::into).collect()),
            required: true,
        }
    }

    /// Everything matched by a glob pattern, relative to the snapshot root.
    pub fn glob(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: Source::Glob(pattern.into()),
            required: true,
        }
    }

    /// A scalar property such as a compiler flag.
    pub fn value(name: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        Self {
            name: name.into(),
            source: Source::Value(value.as_ref().to_vec()),
            required: true,
        }
    }

    /// Missing paths are recorded as [`EntryKind::Missing`] instead of
    /// failing the snapshot.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

/// Counters describing how much work the snapshotter has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    /// Number of snapshots taken.
    pub walks: u64,
    /// Number of files whose content was hashed.
    pub hashed: u64,
    /// Number of files whose fingerprint was carried over from a previous
    /// snapshot.
    pub reused: u64,
}

#[derive(Debug, Default)]
struct Counters {
    walks: AtomicU64,
    hashed: AtomicU64,
    reused: AtomicU64,
}

/// A file found while walking a property, waiting to be fingerprinted.
struct Pending {
    path: Utf8PathBuf,
    size: u64,
    modified: Option<u64>,
}

/// Captures [`Snapshot`]s of declared properties relative to a root directory.
#[derive(Debug)]
pub struct Snapshotter {
    root: Utf8PathBuf,
    reuse: bool,
    counters: Counters,
}

impl Snapshotter {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            reuse: true,
            counters: Counters::default(),
        }
    }

    /// Toggles carrying over fingerprints of files whose size and modification
    /// time did not change.
    pub fn reuse_fingerprints(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            walks: self.counters.walks.load(Ordering::Relaxed),
            hashed: self.counters.hashed.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
        }
    }

    /// Resolves a declared path against the root and removes `.` and `..`
    /// components.
    pub fn normalize(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        normalize(&self.root, path.as_ref())
    }

    /// Snapshots the given properties as they are on disk right now.
    ///
    /// Fingerprints from `previous` are reused for files whose size and
    /// modification time are unchanged.
    pub fn snapshot(
        &self,
        properties: &[Property],
        previous: Option<&Snapshot>,
    ) -> Result<Snapshot, SnapshotError> {
        self.counters.walks.fetch_add(1, Ordering::Relaxed);

        let mut snapshot = Snapshot::new();
        for property in properties {
            let previous = previous.and_then(|snapshot| snapshot.get(&property.name));
            let captured = self.snapshot_property(property, previous)?;
            snapshot.insert(property.name.clone(), captured);
        }

        Ok(snapshot)
    }

    /// Same as [`snapshot`](Self::snapshot), but every property is treated as
    /// optional. Outputs legitimately do not exist before the first run.
    pub fn snapshot_outputs(
        &self,
        properties: &[Property],
        previous: Option<&Snapshot>,
    ) -> Result<Snapshot, SnapshotError> {
        let properties: Vec<Property> = properties.iter().cloned().map(Property::optional).collect();
        self.snapshot(&properties, previous)
    }

    fn snapshot_property(
        &self,
        property: &Property,
        previous: Option<&PropertySnapshot>,
    ) -> Result<PropertySnapshot, SnapshotError> {
        let mut snapshot = PropertySnapshot::new();
        let mut pending = Vec::new();

        match &property.source {
            Source::Value(bytes) => {
                snapshot.insert(Utf8PathBuf::new(), Entry::value(bytes));
            }
            Source::Paths(paths) => {
                for path in paths {
                    let path = self.normalize(path);
                    self.visit(property, path, &mut Vec::new(), &mut snapshot, &mut pending)?;
                }
            }
            Source::Glob(pattern) => {
                let pattern = if Utf8Path::new(pattern).is_absolute() {
                    pattern.clone()
                } else {
                    let root = glob::Pattern::escape(self.root.as_str());
                    format!("{}/{}", root.trim_end_matches('/'), pattern)
                };
                let paths = glob::glob(&pattern).map_err(|source| SnapshotError::Pattern {
                    property: property.name.clone(),
                    source,
                })?;

                for path in paths {
                    let path = path.map_err(|source| SnapshotError::Glob {
                        property: property.name.clone(),
                        source,
                    })?;
                    let path = Utf8PathBuf::try_from(path).map_err(|source| {
                        SnapshotError::NonUtf8Path {
                            property: property.name.clone(),
                            source,
                        }
                    })?;
                    let path = self.normalize(path);
                    let metadata = fs::metadata(&path).map_err(|source| SnapshotError::Io {
                        property: property.name.clone(),
                        path: path.clone(),
                        source,
                    })?;

                    if metadata.is_dir() {
                        snapshot.insert(path.clone(), Entry::directory(&path));
                    } else {
                        pending.push(pending_file(path, &metadata));
                    }
                }
            }
        }

        let hashed = pending
            .into_par_iter()
            .map(|file| self.fingerprint_file(property, file, previous))
            .collect::<Result<Vec<_>, _>>()?;

        for (path, entry) in hashed {
            snapshot.insert(path, entry);
        }

        Ok(snapshot)
    }

    /// Records `path` and, for directories, everything below it. `ancestors`
    /// holds the canonical paths of the directories being walked, so a
    /// symlink pointing back up the tree is recorded but not descended into.
    fn visit(
        &self,
        property: &Property,
        path: Utf8PathBuf,
        ancestors: &mut Vec<PathBuf>,
        snapshot: &mut PropertySnapshot,
        pending: &mut Vec<Pending>,
    ) -> Result<(), SnapshotError> {
        let io_error = |path: &Utf8Path, source| SnapshotError::Io {
            property: property.name.clone(),
            path: path.to_owned(),
            source,
        };

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if property.required {
                    return Err(SnapshotError::Missing {
                        property: property.name.clone(),
                        path,
                    });
                }
                snapshot.insert(path.clone(), Entry::missing(&path));
                return Ok(());
            }
            Err(err) => return Err(io_error(&path, err)),
        };

        if !metadata.is_dir() {
            pending.push(pending_file(path, &metadata));
            return Ok(());
        }

        snapshot.insert(path.clone(), Entry::directory(&path));

        let canonical = fs::canonicalize(&path).map_err(|err| io_error(&path, err))?;
        if ancestors.contains(&canonical) {
            tracing::debug!(%path, "directory loops back to an ancestor, not descending");
            return Ok(());
        }
        ancestors.push(canonical);

        for entry in fs::read_dir(&path).map_err(|err| io_error(&path, err))? {
            let entry = entry.map_err(|err| io_error(&path, err))?;
            let child = Utf8PathBuf::try_from(entry.path()).map_err(|source| {
                SnapshotError::NonUtf8Path {
                    property: property.name.clone(),
                    source,
                }
            })?;
            self.visit(property, child, ancestors, snapshot, pending)?;
        }

        ancestors.pop();
        Ok(())
    }

    fn fingerprint_file(
        &self,
        property: &Property,
        file: Pending,
        previous: Option<&PropertySnapshot>,
    ) -> Result<(Utf8PathBuf, Entry), SnapshotError> {
        if self.reuse
            && let Some(entry) = previous.and_then(|previous| previous.get(&file.path))
            && entry.reusable_for(file.size, file.modified)
        {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Ok((file.path, entry.clone()));
        }

        let fingerprint =
            Hash32::hash_file_tagged(TAG_FILE, &file.path, file.size).map_err(|source| SnapshotError::Io {
                property: property.name.clone(),
                path: file.path.clone(),
                source,
            })?;
        self.counters.hashed.fetch_add(1, Ordering::Relaxed);

        let entry = Entry {
            kind: EntryKind::File,
            fingerprint,
            size: file.size,
            modified: file.modified,
        };

        Ok((file.path, entry))
    }
}

fn pending_file(path: Utf8PathBuf, metadata: &fs::Metadata) -> Pending {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .and_then(|duration| u64::try_from(duration.as_nanos()).ok());

    Pending {
        path,
        size: metadata.len(),
        modified,
    }
}

fn normalize(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    let joined = if path.is_absolute() {
        path.to_owned()
    } else {
        root.join(path)
    };

    let mut normalized = Utf8PathBuf::new();
    for component in joined.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_str()),
        }
    }

    normalized
}
