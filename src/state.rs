use std::sync::Arc;

use camino::Utf8Path;

use crate::core::TaskIdentity;
use crate::detect::{InputChangeSet, RebuildReason, detect};
use crate::error::{IllegalStateError, TaskStateError};
use crate::history::{ExecutionRecord, HistoryStore, Outcome};
use crate::snapshot::{Property, Snapshot, Snapshotter};

/// Lifecycle phase of a [`TaskArtifactState`].
///
/// ```text
/// Unchecked -> UpToDate | OutOfDate -> Executing -> Committed | Failed -> Finished
/// ```
///
/// `Finished` can be reached from every phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Unchecked,
    UpToDate,
    OutOfDate,
    Executing,
    Committed,
    Failed,
    Finished,
}

/// Declared input and output properties of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskProperties {
    pub inputs: Vec<Property>,
    pub outputs: Vec<Property>,
}

impl TaskProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, property: Property) -> Self {
        self.inputs.push(property);
        self
    }

    pub fn output(mut self, property: Property) -> Self {
        self.outputs.push(property);
        self
    }
}

/// Read-only view of the last successful execution of a task.
#[derive(Debug, Clone, Default)]
pub struct ExecutionHistory {
    record: Option<Arc<ExecutionRecord>>,
}

impl ExecutionHistory {
    pub fn previous(&self) -> Option<&ExecutionRecord> {
        self.record.as_deref()
    }

    /// Files produced by the last successful execution. Collaborators use
    /// these to remove stale outputs before a full rebuild.
    pub fn output_files(&self) -> Vec<&Utf8Path> {
        match &self.record {
            Some(record) => record.outputs.files().collect(),
            None => Vec::new(),
        }
    }
}

/// Snapshots and diff held between the up-to-date check and the commit.
struct Working {
    inputs: Option<Snapshot>,
    changes: InputChangeSet,
}

/// Encapsulates the state of a task when its outputs were last generated.
///
/// A handle is created for one evaluation of one task and is driven by a
/// single worker. The scheduler calls [`is_up_to_date`](Self::is_up_to_date);
/// if the task is out of date it brackets the task's work with
/// [`before_task`](Self::before_task) and, on success,
/// [`after_task`](Self::after_task). [`finished`](Self::finished) is called in
/// every case, including failure and cancellation. History is only written by
/// `after_task`.
pub struct TaskArtifactState<'a> {
    identity: TaskIdentity,
    properties: TaskProperties,
    snapshotter: &'a Snapshotter,
    store: &'a dyn HistoryStore,
    phase: Phase,
    verdict: Option<bool>,
    history: Option<Option<Arc<ExecutionRecord>>>,
    working: Option<Working>,
}

impl<'a> TaskArtifactState<'a> {
    pub fn new(
        identity: TaskIdentity,
        properties: TaskProperties,
        snapshotter: &'a Snapshotter,
        store: &'a dyn HistoryStore,
    ) -> Self {
        Self {
            identity,
            properties,
            snapshotter,
            store,
            phase: Phase::Unchecked,
            verdict: None,
            history: None,
            working: None,
        }
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns true if the task outputs were generated using the current task
    /// inputs and are still intact on disk.
    ///
    /// The first call captures snapshots and runs change detection; later
    /// calls return the memoized verdict without touching the file system.
    ///
    /// If the inputs cannot be captured the error is returned and the task is
    /// left out of date, so later calls report `false`.
    pub fn is_up_to_date(&mut self) -> Result<bool, TaskStateError> {
        self.ensure_live("is_up_to_date")?;

        if let Some(verdict) = self.verdict {
            return Ok(verdict);
        }

        let history = self.load_history();
        let previous_inputs = history.as_deref().map(|record| &record.inputs);
        let previous_outputs = history.as_deref().map(|record| &record.outputs);

        let snapshots = self
            .snapshotter
            .snapshot(&self.properties.inputs, previous_inputs)
            .and_then(|inputs| {
                let outputs = self
                    .snapshotter
                    .snapshot_outputs(&self.properties.outputs, previous_outputs)?;
                Ok((inputs, outputs))
            });

        let (inputs, outputs) = match snapshots {
            Ok(snapshots) => snapshots,
            Err(err) => {
                tracing::warn!(task = %self.identity, "couldn't snapshot task, treating as out of date: {err}");
                self.verdict = Some(false);
                self.phase = Phase::OutOfDate;
                self.working = Some(Working {
                    inputs: None,
                    changes: InputChangeSet::rebuild(RebuildReason::SnapshotFailed),
                });
                return Err(err.into());
            }
        };

        let detection = detect(history.as_deref(), &inputs, &outputs);

        match detection.changes.rebuild_reason() {
            Some(reason) => tracing::info!(task = %self.identity, ?reason, "task is out of date"),
            None if detection.up_to_date => tracing::debug!(task = %self.identity, "task is up to date"),
            None => tracing::info!(
                task = %self.identity,
                added = detection.changes.added().len(),
                removed = detection.changes.removed().len(),
                modified = detection.changes.modified().len(),
                "task inputs changed"
            ),
        }

        self.verdict = Some(detection.up_to_date);
        self.phase = if detection.up_to_date {
            Phase::UpToDate
        } else {
            Phase::OutOfDate
        };
        self.working = Some(Working {
            inputs: Some(inputs),
            changes: detection.changes,
        });

        Ok(detection.up_to_date)
    }

    /// Changes since the last successful execution. Only available once
    /// [`is_up_to_date`](Self::is_up_to_date) has run.
    pub fn input_changes(&self) -> Result<&InputChangeSet, IllegalStateError> {
        self.ensure_live("input_changes")?;

        match &self.working {
            Some(working) => Ok(&working.changes),
            None => Err(self.illegal("input_changes")),
        }
    }

    /// Called before the task is executed.
    pub fn before_task(&mut self) -> Result<(), IllegalStateError> {
        if self.phase != Phase::OutOfDate {
            return Err(self.illegal("before_task"));
        }

        tracing::debug!(task = %self.identity, "executing task");
        self.phase = Phase::Executing;
        Ok(())
    }

    /// Called on successful completion of task execution. Captures the
    /// produced outputs and commits a new execution record.
    ///
    /// If the up-to-date check failed to snapshot the inputs, no record is
    /// written and the stored history is invalidated instead.
    ///
    /// A failed commit is not retried; the task moves to [`Phase::Failed`] and
    /// the previous record stays authoritative.
    pub fn after_task(&mut self) -> Result<(), TaskStateError> {
        if self.phase != Phase::Executing {
            return Err(self.illegal("after_task").into());
        }

        match self.commit() {
            Ok(()) => {
                self.phase = Phase::Committed;
                Ok(())
            }
            Err(err) => {
                tracing::error!(task = %self.identity, "couldn't record task execution: {err}");
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    /// Called when this state is finished with. Releases held snapshots.
    pub fn finished(&mut self) {
        if self.phase == Phase::Executing {
            tracing::debug!(task = %self.identity, "task did not complete, history left untouched");
        }

        self.working = None;
        self.history = None;
        self.phase = Phase::Finished;
    }

    /// The last successful execution of this task, if any.
    pub fn execution_history(&mut self) -> Result<ExecutionHistory, IllegalStateError> {
        self.ensure_live("execution_history")?;

        Ok(ExecutionHistory {
            record: self.load_history(),
        })
    }

    fn commit(&mut self) -> Result<(), TaskStateError> {
        let history = self.load_history();
        let (inputs, incremental) = match self.working.as_mut() {
            Some(working) => (working.inputs.take(), working.changes.is_incremental()),
            None => (None, false),
        };

        // inputs were never captured, the next evaluation has to run the task
        let Some(inputs) = inputs else {
            self.store.invalidate(&self.identity)?;
            tracing::debug!(task = %self.identity, "inputs were not captured, history invalidated");
            return Ok(());
        };

        let outputs = self.snapshotter.snapshot_outputs(
            &self.properties.outputs,
            history.as_deref().map(|record| &record.outputs),
        )?;

        let outcome = if incremental {
            Outcome::Incremental
        } else {
            Outcome::Full
        };

        let record = ExecutionRecord::new(self.identity.clone(), inputs, outputs, outcome);
        self.store.commit(&self.identity, record)?;
        tracing::debug!(task = %self.identity, ?outcome, "recorded task execution");

        Ok(())
    }

    /// Loads the stored record once. A read failure is treated as missing
    /// history, which forces the task to run.
    fn load_history(&mut self) -> Option<Arc<ExecutionRecord>> {
        if let Some(history) = &self.history {
            return history.clone();
        }

        let history = match self.store.load(&self.identity) {
            Ok(history) => history,
            Err(err) => {
                tracing::warn!(task = %self.identity, "couldn't read task history, ignoring it: {err}");
                None
            }
        };

        self.history = Some(history.clone());
        history
    }

    fn ensure_live(&self, operation: &'static str) -> Result<(), IllegalStateError> {
        match self.phase {
            Phase::Finished => Err(self.illegal(operation)),
            _ => Ok(()),
        }
    }

    fn illegal(&self, operation: &'static str) -> IllegalStateError {
        IllegalStateError {
            operation,
            phase: self.phase,
        }
    }
}
