// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ExecId, ResultReport, ResultUpdate, TrackerOperation, TrackerSync};
use crate::{config::RetryPolicy, errors::TrackerError};
use tracing::warn;

/// Wraps a [`TrackerSync`] and retries operations that fail transiently.
///
/// Only [`TrackerError::NotFoundYet`] is retried. Once the policy's retry budget is spent, the last
/// error is returned wrapped in [`TrackerError::RetriesExhausted`].
#[derive(Debug)]
pub struct RetryingTracker<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> RetryingTracker<T> {
    /// Creates a new retrying wrapper.
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Returns the wrapped tracker.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Returns the wrapped tracker, consuming self.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

// Runs `$call` against the inner tracker. While it reports `NotFoundYet`, waits as the policy
// says and calls again, up to the policy's retry count.
macro_rules! with_retries {
    ($self:ident, $operation:expr, |$inner:ident| $call:expr) => {{
        let max_retries = $self.policy.count();
        let mut retry = 0;
        loop {
            let $inner = &mut $self.inner;
            let err = match $call.await {
                Ok(value) => break Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => break Err(err),
            };
            if retry == max_retries {
                break Err(TrackerError::RetriesExhausted {
                    operation: $operation,
                    attempts: retry + 1,
                    last: Box::new(err),
                });
            }

            retry += 1;
            let delay = $self.policy.delay_before_retry(retry);
            warn!(
                "{err}; retrying {} in {delay:?} (retry {retry} of {max_retries})",
                $operation
            );
            tokio::time::sleep(delay).await;
        }
    }};
}

impl<T: TrackerSync + Send> TrackerSync for RetryingTracker<T> {
    async fn create_result(&mut self, report: &ResultReport) -> Result<ExecId, TrackerError> {
        with_retries!(self, TrackerOperation::CreateResult, |inner| inner
            .create_result(report))
    }

    async fn update_result(
        &mut self,
        id: &ExecId,
        update: &ResultUpdate,
    ) -> Result<ExecId, TrackerError> {
        with_retries!(self, TrackerOperation::UpdateResult, |inner| inner
            .update_result(id, update))
    }

    async fn attach_text(
        &mut self,
        id: &ExecId,
        filename: &str,
        contents: &[u8],
    ) -> Result<(), TrackerError> {
        with_retries!(self, TrackerOperation::AttachText, |inner| inner
            .attach_text(id, filename, contents))
    }

    async fn attach_image(
        &mut self,
        id: &ExecId,
        filename: &str,
        contents: &[u8],
    ) -> Result<(), TrackerError> {
        with_retries!(self, TrackerOperation::AttachImage, |inner| inner
            .attach_image(id, filename, contents))
    }
}
