#![forbid(unsafe_code)]
//! Up-to-date checks for build tasks.
//!
//! Every task declares input and output [`Property`]s. Before the task runs,
//! its [`TaskArtifactState`] snapshots those properties, compares them with the
//! [`ExecutionRecord`] stored by the last successful run, and decides whether
//! the work can be skipped. When the task has to run it receives an
//! [`InputChangeSet`] describing exactly which inputs were added, removed or
//! modified, so it can do incremental work. A new record is committed only
//! after the task reports success.
//!
//! ```rust,no_run
//! use uptodate::{Property, Repository, Settings, TaskIdentity, TaskProperties};
//!
//! let repository = Repository::open(Settings::default().root("."))?;
//!
//! let properties = TaskProperties::new()
//!     .input(Property::glob("sources", "src/**/*.rs"))
//!     .input(Property::value("profile", "release"))
//!     .output(Property::files("binary", ["target/app"]));
//!
//! let mut state = repository.state_for(TaskIdentity::new(":app", "build"), properties);
//!
//! if !state.is_up_to_date()? {
//!     state.before_task()?;
//!     for change in state.input_changes()?.changes() {
//!         println!("{:?} {}", change.kind, change.path);
//!     }
//!     // ... run the task ...
//!     state.after_task()?;
//! }
//!
//! state.finished();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod core;
mod detect;
mod error;
mod history;
mod repository;
pub mod runner;
mod snapshot;
mod state;

pub use crate::core::{Hash32, TaskIdentity};
pub use crate::detect::{Change, ChangeKind, Detection, InputChangeSet, RebuildReason, detect};
pub use crate::error::*;
pub use crate::history::{
    ExecutionRecord, FileHistory, HistoryStore, MemoryHistory, Outcome, RECORD_VERSION,
};
pub use crate::repository::{Repository, Settings};
pub use crate::snapshot::{
    Entry, EntryKind, Property, PropertySnapshot, Snapshot, SnapshotStats, Snapshotter,
};
pub use crate::state::{ExecutionHistory, Phase, TaskArtifactState, TaskProperties};

/// Installs a `tracing` subscriber that prints to stderr, filtered by the
/// `RUST_LOG` environment variable (default `info`).
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
