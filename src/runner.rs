//! Helpers that drive a task through the whole lifecycle.
//!
//! These do not decide in which order tasks run. [`run_independent`] expects
//! the caller to pass only tasks that do not depend on each other.

use std::time::{Duration, Instant};

use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::core::TaskIdentity;
use crate::detect::InputChangeSet;
use crate::error::{RunError, TaskStateError};
use crate::history::Outcome;
use crate::repository::Repository;
use crate::state::{TaskArtifactState, TaskProperties};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The work was skipped.
    UpToDate,
    /// The work ran and its execution was recorded.
    Executed(Outcome),
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub identity: TaskIdentity,
    pub status: TaskStatus,
    pub duration: Duration,
}

type Work<'a> = Box<dyn FnOnce(&InputChangeSet) -> anyhow::Result<()> + Send + 'a>;

/// A task to be evaluated by [`run_independent`].
pub struct Job<'a> {
    pub identity: TaskIdentity,
    pub properties: TaskProperties,
    pub work: Work<'a>,
}

impl<'a> Job<'a> {
    pub fn new<F>(identity: TaskIdentity, properties: TaskProperties, work: F) -> Self
    where
        F: FnOnce(&InputChangeSet) -> anyhow::Result<()> + Send + 'a,
    {
        Self {
            identity,
            properties,
            work: Box::new(work),
        }
    }
}

/// Evaluates one task: skips it when up to date, otherwise runs `work` with
/// the input changes and records the execution if `work` succeeds.
///
/// [`TaskArtifactState::finished`] is always called. If `work` fails nothing
/// is recorded and the previous history stays in place.
pub fn run_task<F>(mut state: TaskArtifactState<'_>, work: F) -> Result<TaskReport, RunError>
where
    F: FnOnce(&InputChangeSet) -> anyhow::Result<()>,
{
    let span = tracing::info_span!("task", name = %state.identity());
    let _enter = span.enter();

    let start = Instant::now();
    let result = drive(&mut state, work);
    state.finished();

    let status = result?;
    Ok(TaskReport {
        identity: state.identity().clone(),
        status,
        duration: start.elapsed(),
    })
}

fn drive<F>(state: &mut TaskArtifactState<'_>, work: F) -> Result<TaskStatus, RunError>
where
    F: FnOnce(&InputChangeSet) -> anyhow::Result<()>,
{
    let up_to_date = match state.is_up_to_date() {
        Ok(up_to_date) => up_to_date,
        // the handle already logged it and is out of date now
        Err(TaskStateError::Snapshot(_)) => false,
        Err(err) => return Err(err.into()),
    };

    if up_to_date {
        tracing::info!("up to date, skipping");
        return Ok(TaskStatus::UpToDate);
    }

    state.before_task().map_err(TaskStateError::from)?;

    let changes = state.input_changes().map_err(TaskStateError::from)?;
    let outcome = if changes.is_incremental() {
        Outcome::Incremental
    } else {
        Outcome::Full
    };

    work(changes).map_err(|err| RunError::Task(state.identity().to_string(), err))?;

    state.after_task()?;
    Ok(TaskStatus::Executed(outcome))
}

/// Evaluates tasks that do not depend on each other on the rayon thread pool.
/// Reports are returned in the order of `jobs`.
pub fn run_independent(repository: &Repository, jobs: Vec<Job<'_>>) -> Vec<Result<TaskReport, RunError>> {
    jobs.into_par_iter()
        .map(|job| run_task(repository.state_for(job.identity, job.properties), job.work))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8PathBuf;

    use super::*;
    use crate::repository::Settings;
    use crate::snapshot::Property;

    fn scratch() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("out")).unwrap();
        let repository = Repository::open(Settings::default().root(&root)).unwrap();
        (dir, repository)
    }

    fn properties() -> TaskProperties {
        TaskProperties::new()
            .input(Property::glob("sources", "src/*"))
            .output(Property::files("out", ["out"]))
    }

    #[test]
    fn test_run_skips_up_to_date_work() {
        let (_dir, repository) = scratch();
        fs::write(repository.root().join("src/a.txt"), "a").unwrap();
        let identity = TaskIdentity::new(":app", "copy");
        let runs = AtomicUsize::new(0);

        let work = |changes: &InputChangeSet| -> anyhow::Result<()> {
            runs.fetch_add(1, Ordering::SeqCst);
            for change in changes.changes() {
                let name = change.path.file_name().unwrap_or_default();
                fs::copy(&change.path, repository.root().join("out").join(name))?;
            }
            Ok(())
        };

        let first = run_task(repository.state_for(identity.clone(), properties()), work).unwrap();
        assert_eq!(first.status, TaskStatus::Executed(Outcome::Full));

        let second = run_task(repository.state_for(identity.clone(), properties()), work).unwrap();
        assert_eq!(second.status, TaskStatus::UpToDate);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        fs::write(repository.root().join("src/b.txt"), "b").unwrap();
        let third = run_task(repository.state_for(identity, properties()), |changes| {
            assert_eq!(changes.added().len(), 1);
            assert!(changes.modified().is_empty());
            Ok(())
        })
        .unwrap();
        assert_eq!(third.status, TaskStatus::Executed(Outcome::Incremental));
    }

    #[test]
    fn test_failed_work_is_not_recorded() {
        let (_dir, repository) = scratch();
        fs::write(repository.root().join("src/a.txt"), "a").unwrap();
        let identity = TaskIdentity::new(":app", "broken");

        let err = run_task(repository.state_for(identity.clone(), properties()), |_| {
            anyhow::bail!("compiler crashed")
        })
        .unwrap_err();

        assert!(matches!(err, RunError::Task(ref name, _) if name == ":app:broken"));
        assert!(repository.store().load(&identity).unwrap().is_none());

        let retry = run_task(repository.state_for(identity, properties()), |_| Ok(())).unwrap();
        assert_eq!(retry.status, TaskStatus::Executed(Outcome::Full));
    }

    #[test]
    fn test_run_independent() {
        let (_dir, repository) = scratch();
        fs::write(repository.root().join("src/a.txt"), "a").unwrap();

        let jobs = (0..4)
            .map(|i| {
                let identity = TaskIdentity::new(":app", format!("task{i}"));
                let properties = TaskProperties::new().input(Property::value("index", i.to_string()));
                Job::new(identity, properties, |_| Ok(()))
            })
            .collect();

        let reports = run_independent(&repository, jobs);
        assert_eq!(reports.len(), 4);
        for (i, report) in reports.into_iter().enumerate() {
            let report = report.unwrap();
            assert_eq!(report.identity.name(), format!("task{i}"));
            assert_eq!(report.status, TaskStatus::Executed(Outcome::Full));
        }

        for i in 0..4 {
            let identity = TaskIdentity::new(":app", format!("task{i}"));
            let record = repository.store().load(&identity).unwrap().unwrap();
            assert_eq!(record.identity, identity);
        }
    }
}
