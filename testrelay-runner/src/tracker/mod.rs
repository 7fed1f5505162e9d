// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Syncing test group results to an external tracker.
//!
//! The dispatcher talks to the tracker through [`TrackerSync`]. Tracker-specific clients
//! implement it; [`JournalTracker`] is a tracker-neutral implementation that records every call
//! to disk, and [`RetryingTracker`] wraps any implementation to retry transient failures.

mod journal;
mod retry;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use journal::*;
pub use retry::*;

use crate::{errors::TrackerError, grouping::StatusLabel};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future};

/// The tracker-assigned handle for a result, used to target later updates at it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecId(String);

impl ExecId {
    /// Creates a new id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A new result for a test group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResultReport {
    /// The definition file identifying the group.
    pub source_file: Utf8PathBuf,

    /// The group's aggregate status.
    pub status: StatusLabel,

    /// The comment to record, if any.
    pub comment: Option<String>,
}

/// An in-place update of a previously created result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResultUpdate {
    /// The group's aggregate status.
    pub status: StatusLabel,

    /// The full comment to record. `None` leaves the existing comment untouched.
    pub comment: Option<String>,
}

/// An operation on a [`TrackerSync`], used in errors and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerOperation {
    /// [`TrackerSync::create_result`].
    CreateResult,
    /// [`TrackerSync::update_result`].
    UpdateResult,
    /// [`TrackerSync::attach_text`].
    AttachText,
    /// [`TrackerSync::attach_image`].
    AttachImage,
}

impl fmt::Display for TrackerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateResult => f.write_str("create result"),
            Self::UpdateResult => f.write_str("update result"),
            Self::AttachText => f.write_str("attach text"),
            Self::AttachImage => f.write_str("attach image"),
        }
    }
}

/// The operations testrelay needs from an external tracker.
///
/// Every operation may be retried after a transient [`TrackerError::NotFoundYet`]. Creating a
/// result is not idempotent, though: calling `create_result` twice for one group produces two
/// results, so callers must create once and update afterwards.
pub trait TrackerSync {
    /// Creates a new result and returns its id.
    fn create_result(
        &mut self,
        report: &ResultReport,
    ) -> impl Future<Output = Result<ExecId, TrackerError>> + Send;

    /// Updates an existing result in place.
    ///
    /// Returns the id of the result, which trackers may reassign on update.
    fn update_result(
        &mut self,
        id: &ExecId,
        update: &ResultUpdate,
    ) -> impl Future<Output = Result<ExecId, TrackerError>> + Send;

    /// Attaches a text file to a result.
    fn attach_text(
        &mut self,
        id: &ExecId,
        filename: &str,
        contents: &[u8],
    ) -> impl Future<Output = Result<(), TrackerError>> + Send;

    /// Attaches an image to a result.
    fn attach_image(
        &mut self,
        id: &ExecId,
        filename: &str,
        contents: &[u8],
    ) -> impl Future<Output = Result<(), TrackerError>> + Send;
}
