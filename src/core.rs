use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Below this size multithreaded hashing is slower than a single thread.
const PARALLEL_HASH_MIN: u64 = 128 * 1024;

/// A 32-byte BLAKE3 hash used as a content fingerprint.
///
/// Two snapshot entries are considered equal if and only if their fingerprints
/// are equal. Timestamps and sizes are only ever used to decide whether an
/// existing fingerprint can be reused, never to decide equality.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes a tag followed by a payload, so that equal payloads of different
    /// kinds never collide.
    pub(crate) fn hash_tagged(tag: &[u8], payload: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(tag)
            .update(payload.as_ref())
            .finalize()
            .into()
    }

    /// Hashes a tag followed by the contents of a file. Files of at least
    /// [`PARALLEL_HASH_MIN`] bytes are hashed on the rayon pool.
    pub(crate) fn hash_file_tagged(
        tag: &[u8],
        path: impl AsRef<std::path::Path>,
        size: u64,
    ) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(tag);
        if size >= PARALLEL_HASH_MIN {
            hasher.update_mmap_rayon(path)?;
        } else {
            hasher.update_mmap(path)?;
        }
        Ok(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(char::from(HEX[(byte >> 4) as usize]));
            acc.push(char::from(HEX[(byte & 0xF) as usize]));
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Stable identity of a task within a build, made of the owning context (for
/// example a project path) and the task name.
///
/// The identity is the key under which execution history is stored, so it must
/// stay the same across build invocations.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    owner: Arc<str>,
    name: Arc<str>,
}

impl TaskIdentity {
    pub fn new(owner: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self {
            owner: Arc::from(owner.as_ref()),
            name: Arc::from(name.as_ref()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stable string form, `owner:name`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.owner, self.name)
    }

    /// Fingerprint of the key, used to derive file names for persisted history.
    pub(crate) fn digest(&self) -> Hash32 {
        blake3::Hasher::new()
            .update(self.owner.as_bytes())
            .update(&[0])
            .update(self.name.as_bytes())
            .finalize()
            .into()
    }
}

impl fmt::Debug for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskIdentity({}:{})", self.owner, self.name)
    }
}

impl fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.name)
    }
}
