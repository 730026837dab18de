//! Comparison of a stored execution against the current state of a task.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::history::ExecutionRecord;
use crate::snapshot::{Entry, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Unchanged,
    Added,
    Removed,
    Modified,
}

/// A single entry of a property, with its fingerprint before and after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub property: String,
    pub path: Utf8PathBuf,
    pub kind: ChangeKind,
    pub old: Option<Hash32>,
    pub new: Option<Hash32>,
}

/// Why incremental work is not possible for this execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebuildReason {
    /// The task has never completed successfully.
    NoHistory,
    /// Outputs on disk no longer match what the last execution produced.
    OutputsModified,
    /// Inputs could not be captured.
    SnapshotFailed,
}

/// Input changes since the last successful execution, partitioned by kind.
///
/// Tasks that can work incrementally consult [`is_incremental`] first, and if
/// it holds, only process [`added`], [`modified`] and [`removed`] entries.
///
/// [`is_incremental`]: Self::is_incremental
/// [`added`]: Self::added
/// [`modified`]: Self::modified
/// [`removed`]: Self::removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputChangeSet {
    unchanged: Vec<Change>,
    added: Vec<Change>,
    removed: Vec<Change>,
    modified: Vec<Change>,
    outputs: Vec<Change>,
    rebuild: Option<RebuildReason>,
}

impl InputChangeSet {
    pub(crate) fn rebuild(reason: RebuildReason) -> Self {
        Self {
            rebuild: Some(reason),
            ..Self::default()
        }
    }

    pub fn unchanged(&self) -> &[Change] {
        &self.unchanged
    }

    pub fn added(&self) -> &[Change] {
        &self.added
    }

    pub fn removed(&self) -> &[Change] {
        &self.removed
    }

    pub fn modified(&self) -> &[Change] {
        &self.modified
    }

    /// Output entries that were changed outside of the build since the last
    /// execution.
    pub fn outputs(&self) -> &[Change] {
        &self.outputs
    }

    pub fn rebuild_reason(&self) -> Option<RebuildReason> {
        self.rebuild
    }

    /// Whether the task may limit itself to the reported changes.
    pub fn is_incremental(&self) -> bool {
        self.rebuild.is_none()
    }

    /// Whether any input was added, removed or modified.
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty())
    }

    /// Every added, modified and removed entry.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
    }

    fn push(&mut self, change: Change) {
        match change.kind {
            ChangeKind::Unchanged => self.unchanged.push(change),
            ChangeKind::Added => self.added.push(change),
            ChangeKind::Removed => self.removed.push(change),
            ChangeKind::Modified => self.modified.push(change),
        }
    }
}

/// Verdict and diff produced by [`detect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub up_to_date: bool,
    pub changes: InputChangeSet,
}

/// Decides whether a task is up to date.
///
/// The task is out of date when it has no history, when its outputs on disk
/// differ from the outputs recorded by its last execution, or when any input
/// entry was added, removed or modified. Entries are matched by property name
/// and exact normalized path, and compared by fingerprint only.
pub fn detect(stored: Option<&ExecutionRecord>, inputs: &Snapshot, outputs: &Snapshot) -> Detection {
    let Some(stored) = stored else {
        let mut changes = InputChangeSet::rebuild(RebuildReason::NoHistory);
        for (property, path, entry) in inputs.entries() {
            changes.push(change(property, path, ChangeKind::Added, None, Some(entry)));
        }

        return Detection {
            up_to_date: false,
            changes,
        };
    };

    let mut changes = diff(&stored.inputs, inputs);

    let tampered = diff(&stored.outputs, outputs);
    if tampered.has_changes() {
        changes.outputs = tampered
            .unchanged
            .into_iter()
            .chain(tampered.added)
            .chain(tampered.modified)
            .chain(tampered.removed)
            .map(|change| Change {
                kind: ChangeKind::Modified,
                ..change
            })
            .collect();
        changes.outputs.sort_by(|a, b| (&a.property, &a.path).cmp(&(&b.property, &b.path)));
        changes.rebuild = Some(RebuildReason::OutputsModified);
    }

    Detection {
        up_to_date: changes.is_incremental() && !changes.has_changes(),
        changes,
    }
}

/// Partitions the entries of two snapshots by (property, path).
fn diff(old: &Snapshot, new: &Snapshot) -> InputChangeSet {
    let mut changes = InputChangeSet::default();

    let properties: BTreeSet<&str> = old
        .properties()
        .chain(new.properties())
        .map(|(name, _)| name)
        .collect();

    for property in properties {
        let old = old.get(property);
        let new = new.get(property);

        let paths: BTreeSet<&Utf8Path> = old
            .into_iter()
            .chain(new)
            .flat_map(|snapshot| snapshot.entries().map(|(path, _)| path))
            .collect();

        for path in paths {
            let before = old.and_then(|snapshot| snapshot.get(path));
            let after = new.and_then(|snapshot| snapshot.get(path));

            let kind = match (before, after) {
                (Some(before), Some(after)) if before.fingerprint == after.fingerprint => {
                    ChangeKind::Unchanged
                }
                (Some(_), Some(_)) => ChangeKind::Modified,
                (None, Some(_)) => ChangeKind::Added,
                (Some(_), None) => ChangeKind::Removed,
                (None, None) => continue,
            };

            changes.push(change(property, path, kind, before, after));
        }
    }

    changes
}

fn change(
    property: &str,
    path: &Utf8Path,
    kind: ChangeKind,
    before: Option<&Entry>,
    after: Option<&Entry>,
) -> Change {
    Change {
        property: property.to_owned(),
        path: path.to_owned(),
        kind,
        old: before.map(|entry| entry.fingerprint),
        new: after.map(|entry| entry.fingerprint),
    }
}
