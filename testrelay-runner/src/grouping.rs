// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test groups and dependency-aware status aggregation.
//!
//! A test group is the set of tests declared in one definition file, and is tracked as a single
//! result. A group's status is derived from a [`StatusSnapshot`] over its tests and all of their
//! ancestors, so a group that only owns leaf tests still reflects failures further up the
//! dependency graph.

use crate::{
    errors::{RegistryError, TrackerError},
    protocol::{ExecStatus, FailureCategory},
    registry::{TestNode, TestRegistry},
    tracker::{ExecId, ResultReport, ResultUpdate, TrackerSync},
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
};
use tracing::debug;

/// The delimiter placed between successive pieces of content in a tracker comment.
pub const COMMENT_SEPARATOR: &str = "\n\n----------------------------------------\n\n";

/// The aggregate status of a test group, as reported to the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusLabel {
    /// Some test in the closure hasn't finished.
    InProgress,

    /// Some test in the closure was skipped.
    Blocked,

    /// Some test in the closure failed because of its own logic.
    Irrelevant,

    /// Some test in the closure failed for another reason.
    Fail,

    /// Everything passed or was up to date.
    Pass,
}

impl StatusLabel {
    /// Returns the label as reported to the tracker.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "In Progress",
            Self::Blocked => "Blocked",
            Self::Irrelevant => "Irrelevant",
            Self::Fail => "Fail",
            Self::Pass => "Pass",
        }
    }
}

impl fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StatusLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// The classification of every test reachable from a set of roots.
///
/// Each reachable test is in exactly one of the six sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Tests that haven't started, or started and haven't finished.
    pub in_progress: BTreeSet<String>,

    /// Tests that were skipped.
    pub skipped: BTreeSet<String>,

    /// Tests that failed with [`FailureCategory::LogicError`].
    pub failed_with_logic_error: BTreeSet<String>,

    /// Tests that failed for any other reason.
    pub failed_with_other_error: BTreeSet<String>,

    /// Tests that passed.
    pub passed: BTreeSet<String>,

    /// Cached tests whose previous result is still valid.
    pub up_to_date: BTreeSet<String>,
}

impl StatusSnapshot {
    /// Classifies `roots` and all of their ancestors.
    ///
    /// A test reachable along several paths is classified once, and cycles in the parent graph
    /// terminate. Any unregistered name on the way is an error.
    pub fn compute<'a>(
        registry: &TestRegistry,
        roots: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, RegistryError> {
        let mut snapshot = Self::default();
        let mut visited = HashSet::new();
        // Dependency chains can be arbitrarily deep, so walk them with an explicit stack.
        let mut pending: Vec<&str> = roots.into_iter().collect();
        while let Some(name) = pending.pop() {
            let node = registry.get(name)?;
            if !visited.insert(node.name()) {
                continue;
            }
            snapshot.classify(node);
            pending.extend(node.parents().iter().map(String::as_str));
        }
        Ok(snapshot)
    }

    fn classify(&mut self, node: &TestNode) {
        let set = if node.is_cached() {
            &mut self.up_to_date
        } else {
            match node.last_run() {
                None => &mut self.in_progress,
                Some(run) => match run.exec_status {
                    ExecStatus::Unknown => &mut self.in_progress,
                    ExecStatus::Passed => &mut self.passed,
                    ExecStatus::Skipped => &mut self.skipped,
                    ExecStatus::Failed => match run.failure_category {
                        Some(FailureCategory::LogicError) => &mut self.failed_with_logic_error,
                        _ => &mut self.failed_with_other_error,
                    },
                },
            }
        };
        set.insert(node.name().to_owned());
    }

    /// Returns the number of classified tests.
    pub fn len(&self) -> usize {
        self.in_progress.len()
            + self.skipped.len()
            + self.failed_with_logic_error.len()
            + self.failed_with_other_error.len()
            + self.passed.len()
            + self.up_to_date.len()
    }

    /// Returns true if no tests were classified.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the aggregate label: the first non-empty set wins, in priority order.
    pub fn label(&self) -> StatusLabel {
        if !self.in_progress.is_empty() {
            StatusLabel::InProgress
        } else if !self.skipped.is_empty() {
            StatusLabel::Blocked
        } else if !self.failed_with_logic_error.is_empty() {
            StatusLabel::Irrelevant
        } else if !self.failed_with_other_error.is_empty() {
            StatusLabel::Fail
        } else {
            StatusLabel::Pass
        }
    }
}

/// The tests declared in one definition file, tracked as one result.
#[derive(Clone, Debug)]
pub struct TestGroup {
    source_file: Utf8PathBuf,
    tests: Vec<String>,
    exec_id: Option<ExecId>,
    comment: Option<String>,
    screenshots: usize,
}

impl TestGroup {
    /// Creates an empty group for a definition file.
    pub fn new(source_file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source_file: source_file.into(),
            tests: Vec::new(),
            exec_id: None,
            comment: None,
            screenshots: 0,
        }
    }

    /// The definition file identifying this group.
    pub fn source_file(&self) -> &Utf8Path {
        &self.source_file
    }

    /// The names of the tests owned by this group, in declaration order.
    pub fn tests(&self) -> &[String] {
        &self.tests
    }

    /// The tracker id of this group's result, once it has been created.
    pub fn exec_id(&self) -> Option<&ExecId> {
        self.exec_id.as_ref()
    }

    /// The comment accumulated on the tracker result so far.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Computes the snapshot over this group's tests and their ancestors.
    pub fn snapshot(&self, registry: &TestRegistry) -> Result<StatusSnapshot, RegistryError> {
        StatusSnapshot::compute(registry, self.tests.iter().map(String::as_str))
    }

    /// Computes this group's aggregate status.
    pub fn status(&self, registry: &TestRegistry) -> Result<StatusLabel, RegistryError> {
        Ok(self.snapshot(registry)?.label())
    }

    /// Returns a file name for the next screenshot attached for `test_name`.
    ///
    /// Names are unique within the group: `<test_name>_<n>.png`, with `n` counting from 1.
    pub fn next_screenshot_name(&mut self, test_name: &str) -> String {
        self.screenshots += 1;
        format!("{test_name}_{}.png", self.screenshots)
    }

    /// Pushes `status` to the tracker.
    ///
    /// The first sync creates the group's result, and every later sync updates it in place. A
    /// non-empty `content` is appended to the existing comment after [`COMMENT_SEPARATOR`]; with
    /// no content, only the status is sent.
    pub async fn sync<T: TrackerSync>(
        &mut self,
        tracker: &mut T,
        status: StatusLabel,
        content: Option<&str>,
    ) -> Result<&ExecId, TrackerError> {
        let comment = match content {
            Some(content) if !content.is_empty() => {
                let comment = match &self.comment {
                    Some(previous) => format!("{previous}{COMMENT_SEPARATOR}{content}"),
                    None => content.to_owned(),
                };
                Some(comment)
            }
            _ => None,
        };

        let id = match &self.exec_id {
            None => {
                let report = ResultReport {
                    source_file: self.source_file.clone(),
                    status,
                    comment: comment.clone(),
                };
                tracker.create_result(&report).await?
            }
            Some(id) => {
                let update = ResultUpdate {
                    status,
                    comment: comment.clone(),
                };
                tracker.update_result(id, &update).await?
            }
        };
        debug!("synced {} as {status} (result {id})", self.source_file);

        if comment.is_some() {
            self.comment = comment;
        }
        let id: &ExecId = self.exec_id.insert(id);
        Ok(id)
    }
}

/// All test groups for a launch, keyed by definition file.
#[derive(Clone, Debug, Default)]
pub struct TestGrouping {
    groups: IndexMap<Utf8PathBuf, TestGroup>,
    group_of: HashMap<String, Utf8PathBuf>,
}

impl TestGrouping {
    /// Creates one empty group per definition file.
    pub fn new(files: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        let groups = files
            .into_iter()
            .map(|file| (file.clone(), TestGroup::new(file)))
            .collect();
        Self {
            groups,
            group_of: HashMap::new(),
        }
    }

    /// Attaches every registered test to the group of its definition file.
    ///
    /// Tests whose file isn't one of the groups stay ungrouped: they still count towards the
    /// status of groups that depend on them, but aren't tracked themselves. Returns the number of
    /// tests attached.
    pub fn attach(&mut self, registry: &TestRegistry) -> usize {
        let mut attached = 0;
        for node in registry.iter() {
            let Some(key) = self.group_key(node.source_file()) else {
                debug!(
                    "test {} from {} is not part of any group",
                    node.name(),
                    node.source_file()
                );
                continue;
            };
            if let Some(group) = self.groups.get_mut(&key) {
                group.tests.push(node.name().to_owned());
                self.group_of.insert(node.name().to_owned(), key);
                attached += 1;
            }
        }
        attached
    }

    fn group_key(&self, source_file: &Utf8Path) -> Option<Utf8PathBuf> {
        if self.groups.contains_key(source_file) {
            return Some(source_file.to_owned());
        }
        // The process may report the file through a different but equivalent path.
        let canonical = source_file.canonicalize_utf8().ok()?;
        self.groups
            .contains_key(&canonical)
            .then_some(canonical)
    }

    /// Returns the group a test belongs to, if any.
    pub fn group_for_test(&self, name: &str) -> Option<&TestGroup> {
        self.group_of
            .get(name)
            .and_then(|file| self.groups.get(file))
    }

    /// Returns the group a test belongs to, if any.
    pub fn group_for_test_mut(&mut self, name: &str) -> Option<&mut TestGroup> {
        self.group_of
            .get(name)
            .and_then(|file| self.groups.get_mut(file))
    }

    /// Returns the group for a definition file.
    pub fn get(&self, source_file: &Utf8Path) -> Option<&TestGroup> {
        self.groups.get(source_file)
    }

    /// Iterates over groups in the order their files were provided.
    pub fn iter(&self) -> impl Iterator<Item = &TestGroup> + '_ {
        self.groups.values()
    }

    /// The number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if there are no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
