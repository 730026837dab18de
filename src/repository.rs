use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::TaskIdentity;
use crate::error::StorageError;
use crate::history::{FileHistory, HistoryStore, MemoryHistory};
use crate::snapshot::Snapshotter;
use crate::state::{TaskArtifactState, TaskProperties};

/// Where history is kept when no other directory is configured, relative to
/// the root.
const DIR_HISTORY: &str = ".uptodate/history";

/// Configuration of a [`Repository`].
///
/// # Example
///
/// ```rust,no_run
/// use uptodate::{Repository, Settings};
///
/// let settings = Settings::default()
///     .root("/work/project")
///     .history_dir("/var/cache/project-history")
///     .reuse_fingerprints(true);
///
/// let repository = Repository::open(settings)?;
/// # Ok::<(), uptodate::StorageError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    root: Utf8PathBuf,
    history: Option<Utf8PathBuf>,
    reuse_fingerprints: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            history: Some(Utf8PathBuf::from(DIR_HISTORY)),
            reuse_fingerprints: true,
        }
    }
}

impl Settings {
    /// Directory declared paths are resolved against.
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Directory for persisted history. Relative paths are resolved against
    /// the root.
    pub fn history_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.history = Some(dir.into());
        self
    }

    /// Keep history in memory only. Nothing survives the process.
    pub fn in_memory(mut self) -> Self {
        self.history = None;
        self
    }

    pub fn reuse_fingerprints(mut self, reuse: bool) -> Self {
        self.reuse_fingerprints = reuse;
        self
    }
}

/// Build-wide entry point: owns the snapshotter and the shared history store
/// and hands out one [`TaskArtifactState`] per task evaluation.
pub struct Repository {
    snapshotter: Snapshotter,
    store: Arc<dyn HistoryStore>,
}

impl Repository {
    pub fn open(settings: Settings) -> Result<Self, StorageError> {
        let root = settings.root.canonicalize_utf8()?;

        let store: Arc<dyn HistoryStore> = match &settings.history {
            Some(dir) => {
                let dir = root.join(dir);
                tracing::debug!(%dir, "opening history store");
                Arc::new(FileHistory::open(dir)?)
            }
            None => Arc::new(MemoryHistory::new()),
        };

        Ok(Self::assemble(root, &settings, store))
    }

    /// Uses a caller-provided store, for example a shared or instrumented one.
    /// The history directory of `settings` is ignored.
    pub fn with_store(settings: Settings, store: Arc<dyn HistoryStore>) -> Result<Self, StorageError> {
        let root = settings.root.canonicalize_utf8()?;
        Ok(Self::assemble(root, &settings, store))
    }

    fn assemble(root: Utf8PathBuf, settings: &Settings, store: Arc<dyn HistoryStore>) -> Self {
        let snapshotter = Snapshotter::new(root).reuse_fingerprints(settings.reuse_fingerprints);
        Self { snapshotter, store }
    }

    /// Creates the handle for one evaluation of a task.
    pub fn state_for(&self, identity: TaskIdentity, properties: TaskProperties) -> TaskArtifactState<'_> {
        TaskArtifactState::new(identity, properties, &self.snapshotter, self.store.as_ref())
    }

    /// Forgets the history of a task, so its next evaluation runs it in full.
    pub fn invalidate(&self, identity: &TaskIdentity) -> Result<(), StorageError> {
        self.store.invalidate(identity)
    }

    pub fn root(&self) -> &Utf8Path {
        self.snapshotter.root()
    }

    pub fn snapshotter(&self) -> &Snapshotter {
        &self.snapshotter
    }

    pub fn store(&self) -> &dyn HistoryStore {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::snapshot::Property;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn run(repository: &Repository, identity: &TaskIdentity, properties: &TaskProperties) -> bool {
        let mut state = repository.state_for(identity.clone(), properties.clone());
        let up_to_date = state.is_up_to_date().unwrap();
        if !up_to_date {
            state.before_task().unwrap();
            state.after_task().unwrap();
        }
        state.finished();
        up_to_date
    }

    #[test]
    fn test_history_survives_restart() {
        let (_dir, root) = scratch();
        fs::write(root.join("input.txt"), "hello").unwrap();

        let identity = TaskIdentity::new(":app", "copy");
        let properties = TaskProperties::new().input(Property::files("input", ["input.txt"]));
        let settings = Settings::default().root(&root);

        {
            let repository = Repository::open(settings.clone()).unwrap();
            assert!(!run(&repository, &identity, &properties));
            assert!(run(&repository, &identity, &properties));
        }

        let repository = Repository::open(settings).unwrap();
        assert!(run(&repository, &identity, &properties));
        assert!(root.join(DIR_HISTORY).is_dir());

        repository.invalidate(&identity).unwrap();
        assert!(!run(&repository, &identity, &properties));
    }

    #[test]
    fn test_in_memory_settings() {
        let (_dir, root) = scratch();
        fs::write(root.join("input.txt"), "hello").unwrap();

        let identity = TaskIdentity::new(":app", "copy");
        let properties = TaskProperties::new().input(Property::files("input", ["input.txt"]));
        let settings = Settings::default().root(&root).in_memory();

        {
            let repository = Repository::open(settings.clone()).unwrap();
            assert!(!run(&repository, &identity, &properties));
            assert!(run(&repository, &identity, &properties));
        }

        let repository = Repository::open(settings).unwrap();
        assert!(!run(&repository, &identity, &properties));
        assert!(!root.join(DIR_HISTORY).exists());
    }

    #[test]
    fn test_with_store_resolves_root_and_settings() {
        let (_dir, root) = scratch();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("input.txt"), "hello").unwrap();

        let store = Arc::new(MemoryHistory::new());
        let settings = Settings::default()
            .root(root.join("nested/.."))
            .reuse_fingerprints(false);
        let repository = Repository::with_store(settings, store.clone()).unwrap();

        assert!(repository.root().is_absolute());
        assert!(!repository.root().as_str().contains(".."));
        assert!(!root.join(DIR_HISTORY).exists());

        let identity = TaskIdentity::new(":app", "copy");
        let properties = TaskProperties::new().input(Property::files("input", ["input.txt"]));
        assert!(!run(&repository, &identity, &properties));
        assert!(run(&repository, &identity, &properties));
        assert!(store.load(&identity).unwrap().is_some());

        // reuse is off, so every check hashes the input again
        assert_eq!(repository.snapshotter().stats().reused, 0);
        assert_eq!(repository.snapshotter().stats().hashed, 2);

        let missing = Settings::default().root(root.join("does-not-exist"));
        assert!(Repository::with_store(missing, store).is_err());
    }

    #[test]
    fn test_paths_are_absolute() {
        let (_dir, root) = scratch();
        let repository = Repository::open(Settings::default().root(&root).in_memory()).unwrap();

        assert!(repository.root().is_absolute());
        assert!(repository.snapshotter().normalize("a/../b.txt").ends_with("b.txt"));
        assert!(repository.snapshotter().normalize("a/../b.txt").is_absolute());
    }
}
