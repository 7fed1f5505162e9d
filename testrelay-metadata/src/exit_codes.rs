// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `testrelay` failures.
///
/// A launch may fail for a variety of reasons. This structure documents the exit codes that may
/// occur in case of expected failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum RelayExitCode {}

impl RelayExitCode {
    /// No errors occurred and the launch was fully reported.
    pub const OK: i32 = 0;

    /// A user issue happened while setting up a launch: bad configuration, an unreadable source
    /// directory, or a report server that could not be bound.
    pub const SETUP_ERROR: i32 = 96;

    /// The external process could not be spawned, or exited with a code outside the configured
    /// set of success codes.
    pub const PROCESS_FAILED: i32 = 97;

    /// The external process violated the reporting protocol: a malformed frame, an unknown
    /// message type, or a reference to a test it never declared.
    pub const PROTOCOL_ERROR: i32 = 98;

    /// The reporting connection closed before the launch ended, or was never opened.
    pub const CONNECTION_CLOSED: i32 = 99;

    /// Syncing a result to the tracker failed, including after all retries were spent.
    pub const TRACKER_SYNC_FAILED: i32 = 100;
}
