// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-launch event dispatcher.
//!
//! The dispatcher owns all state for one launch: the registry of declared tests, the test groups,
//! and the tracker. It reads one frame at a time, applies the event, and acknowledges it before
//! reading the next, so events are never processed concurrently.

use crate::{
    errors::{DispatchError, ProtocolViolation, RegistryError},
    grouping::{StatusLabel, TestGrouping},
    protocol::{Event, ExecStatus, FrameTransport, RunInfo, TestDescriptor, confirmation},
    registry::TestRegistry,
    tracker::{ExecId, TrackerSync},
};
use bytes::Bytes;
use camino::Utf8PathBuf;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// The log target for the process's own report text, which is printed without a heading.
pub const NO_HEADING_TARGET: &str = "testrelay::no_heading";

/// The state of an [`EventDispatcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting for `launch_begin`.
    AwaitingLaunchBegin,

    /// Tests are running.
    Running,

    /// `launch_end` was received.
    Done,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingLaunchBegin => f.write_str("awaiting launch_begin"),
            Self::Running => f.write_str("running"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Applies launch events to the registry and groups, and syncs changes to the tracker.
#[derive(Debug)]
pub struct EventDispatcher<T> {
    state: DispatchState,
    registry: TestRegistry,
    grouping: TestGrouping,
    tracker: T,
}

impl<T: TrackerSync> EventDispatcher<T> {
    /// Creates a dispatcher for a new launch.
    pub fn new(grouping: TestGrouping, tracker: T) -> Self {
        Self {
            state: DispatchState::AwaitingLaunchBegin,
            registry: TestRegistry::new(),
            grouping,
            tracker,
        }
    }

    /// The current state.
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// The tests declared so far.
    pub fn registry(&self) -> &TestRegistry {
        &self.registry
    }

    /// The test groups.
    pub fn grouping(&self) -> &TestGrouping {
        &self.grouping
    }

    /// The tracker.
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Consumes the dispatcher, returning its registry, groups and tracker.
    pub fn into_parts(self) -> (TestRegistry, TestGrouping, T) {
        (self.registry, self.grouping, self.tracker)
    }

    /// Reads, applies and acknowledges events until `launch_end`.
    pub async fn serve<S>(&mut self, transport: &mut FrameTransport<S>) -> Result<(), DispatchError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while self.state != DispatchState::Done {
            let value = transport.read_frame().await?;
            let event = Event::from_value(&value)?;
            debug!(kind = %event.kind(), state = %self.state, "dispatching event");

            self.handle_event(event).await?;
            transport.write(&confirmation()).await?;
        }
        Ok(())
    }

    /// Applies a single event.
    pub async fn handle_event(&mut self, event: Event) -> Result<(), DispatchError> {
        use DispatchState::*;

        match (self.state, event) {
            (AwaitingLaunchBegin, Event::LaunchBegin { tests }) => {
                self.launch_begin(tests)?;
                self.state = Running;
            }
            // Text produced outside any test boundary.
            (AwaitingLaunchBegin | Running, Event::Report { run: None, .. }) => {}
            (AwaitingLaunchBegin | Running, Event::ReportScreenshot { run: None, .. }) => {}
            (Running, Event::TestSkipBegin { run }) => {
                self.registry.mark_begin(&run)?;
                self.touch(&run.test_name).await?;
            }
            (Running, Event::TestSkipEnd { run }) => {
                self.registry.mark_end(&run)?;
                self.full_update(&run.test_name).await?;
            }
            (Running, Event::TestBegin { run }) => {
                self.registry.mark_begin(&run)?;
                info!("{}: started", run.test_name);
                self.touch(&run.test_name).await?;
            }
            (Running, Event::Report {
                run: Some(run),
                text,
            }) => {
                self.registry.append_output(&run.test_name, &text)?;
                info!(target: NO_HEADING_TARGET, "{}", text.trim_end());
            }
            (Running, Event::ReportScreenshot {
                run: Some(run),
                image,
            }) => {
                self.screenshot(&run, image).await?;
            }
            (Running, Event::TestEnd { run }) => {
                self.registry.mark_end(&run)?;
                info!("{}: {}", run.test_name, describe_run(&run));
                if let Some(id) = self.full_update(&run.test_name).await? {
                    self.attach_output(&run.test_name, &id).await?;
                }
            }
            (Running, Event::LaunchEnd) => {
                debug!("launch ended");
                self.state = Done;
            }
            (state, event) => {
                return Err(ProtocolViolation::UnexpectedEvent {
                    kind: event.kind(),
                    state,
                }
                .into());
            }
        }
        Ok(())
    }

    fn launch_begin(&mut self, tests: Vec<TestDescriptor>) -> Result<(), DispatchError> {
        let declared = tests.len();
        self.registry.register_all(tests)?;
        let attached = self.grouping.attach(&self.registry);
        info!(
            "launch started: {declared} tests declared, {attached} in {} groups",
            self.grouping.len()
        );

        for group in self.grouping.iter() {
            if group.tests().is_empty() {
                warn!("no tests from {} are part of this launch", group.source_file());
                continue;
            }
            let status = group.status(&self.registry)?;
            if status != StatusLabel::InProgress {
                info!("{}: {status}, nothing to run", group.source_file());
            }
        }
        Ok(())
    }

    // Status-only update, without content.
    async fn touch(&mut self, test_name: &str) -> Result<(), DispatchError> {
        let Some(group) = self.grouping.group_for_test_mut(test_name) else {
            return Ok(());
        };
        let status = group.status(&self.registry)?;
        if let Err(err) = group.sync(&mut self.tracker, status, None).await {
            return Err(DispatchError::Tracker {
                source_file: group.source_file().to_owned(),
                err,
            });
        }
        Ok(())
    }

    // Status plus the test's accumulated output. Returns the group's result id if the test is
    // grouped.
    async fn full_update(&mut self, test_name: &str) -> Result<Option<ExecId>, DispatchError> {
        let Some(group) = self.grouping.group_for_test_mut(test_name) else {
            return Ok(None);
        };
        let status = group.status(&self.registry)?;
        let output = self.registry.get(test_name)?.output();
        match group.sync(&mut self.tracker, status, Some(output)).await {
            Ok(id) => Ok(Some(id.clone())),
            Err(err) => Err(DispatchError::Tracker {
                source_file: group.source_file().to_owned(),
                err,
            }),
        }
    }

    async fn attach_output(&mut self, test_name: &str, id: &ExecId) -> Result<(), DispatchError> {
        let node = self.registry.get(test_name)?;
        let filename = format!("{test_name}.txt");
        self.tracker
            .attach_text(id, &filename, node.output().as_bytes())
            .await
            .map_err(|err| DispatchError::Tracker {
                source_file: node.source_file().to_owned(),
                err,
            })
    }

    async fn screenshot(&mut self, run: &RunInfo, image: Bytes) -> Result<(), DispatchError> {
        // Validate the name even if the test turns out to be ungrouped.
        self.registry.get(&run.test_name)?;
        let Some(group) = self.grouping.group_for_test_mut(&run.test_name) else {
            return Ok(());
        };

        // Attachments need a result to attach to.
        let id = match group.exec_id() {
            Some(id) => id.clone(),
            None => {
                let status = group.status(&self.registry)?;
                match group.sync(&mut self.tracker, status, None).await {
                    Ok(id) => id.clone(),
                    Err(err) => {
                        return Err(DispatchError::Tracker {
                            source_file: group.source_file().to_owned(),
                            err,
                        });
                    }
                }
            }
        };

        let filename = group.next_screenshot_name(&run.test_name);
        let source_file = group.source_file().to_owned();
        debug!("attaching screenshot {filename} ({} bytes)", image.len());
        self.tracker
            .attach_image(&id, &filename, &image)
            .await
            .map_err(|err| DispatchError::Tracker { source_file, err })
    }

    /// Summarizes the status of every group.
    pub fn summary(&self) -> Result<LaunchSummary, RegistryError> {
        let groups = self
            .grouping
            .iter()
            .map(|group| {
                Ok(GroupSummary {
                    source_file: group.source_file().to_owned(),
                    status: group.status(&self.registry)?,
                    exec_id: group.exec_id().cloned(),
                })
            })
            .collect::<Result<_, RegistryError>>()?;
        Ok(LaunchSummary { groups })
    }
}

fn describe_run(run: &RunInfo) -> &'static str {
    match run.exec_status {
        ExecStatus::Unknown => "finished with unknown status",
        ExecStatus::Passed => "passed",
        ExecStatus::Skipped => "skipped",
        ExecStatus::Failed => match run.failure_category {
            Some(crate::protocol::FailureCategory::LogicError) => "failed (logic error)",
            _ => "failed",
        },
    }
}

/// The outcome of a launch, per group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSummary {
    /// One entry per group, in the order the groups were created.
    pub groups: Vec<GroupSummary>,
}

/// The outcome of a launch for one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSummary {
    /// The definition file identifying the group.
    pub source_file: Utf8PathBuf,

    /// The group's final status.
    pub status: StatusLabel,

    /// The tracker result id, if the group was ever synced.
    pub exec_id: Option<ExecId>,
}
