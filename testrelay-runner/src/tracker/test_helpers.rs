// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A [`TrackerSync`] test double that records calls in memory.

use super::{ExecId, ResultReport, ResultUpdate, TrackerOperation, TrackerSync};
use crate::errors::TrackerError;
use std::sync::{Arc, Mutex};

/// A call made to a [`RecordingTracker`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerCall {
    /// `create_result`.
    Create(ResultReport),

    /// `update_result`.
    Update(ExecId, ResultUpdate),

    /// `attach_text`.
    AttachText(ExecId, String, Vec<u8>),

    /// `attach_image`.
    AttachImage(ExecId, String, Vec<u8>),
}

/// A tracker that records every successful call, for use in tests.
///
/// Clones share the same call log, so a clone can be handed to the code under test while the
/// original is used for assertions. Created results get ids `result-1`, `result-2` and so on.
#[derive(Clone, Debug, Default)]
pub struct RecordingTracker {
    state: Arc<Mutex<RecordingState>>,
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Vec<TrackerCall>,
    created: usize,
    fail_next: usize,
}

impl RecordingTracker {
    /// Creates a new tracker with an empty call log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls fail with [`TrackerError::NotFoundYet`].
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Returns the calls made so far.
    pub fn calls(&self) -> Vec<TrackerCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().expect("recording tracker lock is not poisoned")
    }

    fn record(
        &self,
        operation: TrackerOperation,
        id: Option<&ExecId>,
        call: TrackerCall,
    ) -> Result<RecordingOutcome, TrackerError> {
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TrackerError::NotFoundYet {
                operation,
                message: "injected failure".to_owned(),
            });
        }

        if let Some(id) = id {
            let known = id
                .as_str()
                .strip_prefix("result-")
                .and_then(|n| n.parse::<usize>().ok())
                .is_some_and(|n| n >= 1 && n <= state.created);
            if !known {
                return Err(TrackerError::UnknownExecId {
                    operation,
                    id: id.to_string(),
                });
            }
        }

        state.calls.push(call);
        if operation == TrackerOperation::CreateResult {
            state.created += 1;
            Ok(RecordingOutcome::Created(ExecId::new(format!(
                "result-{}",
                state.created
            ))))
        } else {
            Ok(RecordingOutcome::Recorded)
        }
    }
}

enum RecordingOutcome {
    Created(ExecId),
    Recorded,
}

impl TrackerSync for RecordingTracker {
    async fn create_result(&mut self, report: &ResultReport) -> Result<ExecId, TrackerError> {
        match self.record(
            TrackerOperation::CreateResult,
            None,
            TrackerCall::Create(report.clone()),
        )? {
            RecordingOutcome::Created(id) => Ok(id),
            RecordingOutcome::Recorded => unreachable!("create always returns an id"),
        }
    }

    async fn update_result(
        &mut self,
        id: &ExecId,
        update: &ResultUpdate,
    ) -> Result<ExecId, TrackerError> {
        self.record(
            TrackerOperation::UpdateResult,
            Some(id),
            TrackerCall::Update(id.clone(), update.clone()),
        )?;
        Ok(id.clone())
    }

    async fn attach_text(
        &mut self,
        id: &ExecId,
        filename: &str,
        contents: &[u8],
    ) -> Result<(), TrackerError> {
        self.record(
            TrackerOperation::AttachText,
            Some(id),
            TrackerCall::AttachText(id.clone(), filename.to_owned(), contents.to_vec()),
        )?;
        Ok(())
    }

    async fn attach_image(
        &mut self,
        id: &ExecId,
        filename: &str,
        contents: &[u8],
    ) -> Result<(), TrackerError> {
        self.record(
            TrackerOperation::AttachImage,
            Some(id),
            TrackerCall::AttachImage(id.clone(), filename.to_owned(), contents.to_vec()),
        )?;
        Ok(())
    }
}
