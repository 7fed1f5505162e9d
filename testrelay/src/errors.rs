// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::StderrStyles;
use camino::{FromPathBufError, Utf8PathBuf};
use owo_colors::OwoColorize;
use std::error::Error;
use testrelay_metadata::RelayExitCode;
use testrelay_runner::{
    dispatcher::NO_HEADING_TARGET,
    errors::{
        ConfigParseError, DiscoveryError, DispatchError, LaunchError, TrackerError,
        TransportError,
    },
};
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method, which colorizes errors.

/// An error that testrelay knows how to report.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not determine current directory")]
    GetCurrentDirFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("current directory is not valid UTF-8")]
    CurrentDirInvalidUtf8 {
        #[source]
        err: FromPathBufError,
    },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("test discovery error")]
    DiscoveryError {
        #[from]
        err: DiscoveryError,
    },
    #[error("failed to create journal")]
    JournalCreateError {
        journal_dir: Utf8PathBuf,
        #[source]
        err: TrackerError,
    },
    #[error("launch failed")]
    LaunchError {
        #[from]
        err: LaunchError,
    },
    #[error("error writing output")]
    WriteOutputError {
        #[source]
        err: std::io::Error,
    },
}

impl ExpectedError {
    pub(crate) fn journal_create_error(journal_dir: Utf8PathBuf, err: TrackerError) -> Self {
        Self::JournalCreateError { journal_dir, err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::GetCurrentDirFailed { .. }
            | Self::CurrentDirInvalidUtf8 { .. }
            | Self::ConfigParseError { .. }
            | Self::DiscoveryError { .. }
            | Self::JournalCreateError { .. }
            | Self::WriteOutputError { .. } => RelayExitCode::SETUP_ERROR,
            Self::LaunchError { err } => launch_exit_code(err),
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::GetCurrentDirFailed { err } => {
                error!("could not determine current directory");
                Some(err as &dyn Error)
            }
            Self::CurrentDirInvalidUtf8 { err } => {
                error!("current directory is not valid UTF-8");
                Some(err as &dyn Error)
            }
            Self::ConfigParseError { err } => {
                error!(
                    "failed to parse testrelay config at `{}`",
                    err.config_file().style(styles.bold)
                );
                err.source()
            }
            Self::DiscoveryError { err } => {
                error!("failed to discover test definition files");
                Some(err as &dyn Error)
            }
            Self::JournalCreateError { journal_dir, err } => {
                error!(
                    "failed to create journal at `{}`",
                    journal_dir.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::LaunchError { err } => {
                error!("{err}");
                if let LaunchError::ProcessFailed { stderr, .. } = err {
                    if !stderr.is_empty() {
                        error!(
                            target: NO_HEADING_TARGET,
                            "{}\n{}",
                            "--- stderr (last lines) ---".style(styles.warning_text),
                            stderr.trim_end()
                        );
                    }
                }
                err.source()
            }
            Self::WriteOutputError { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

fn launch_exit_code(err: &LaunchError) -> i32 {
    match err {
        LaunchError::TokioRuntimeCreate(_) | LaunchError::Bind { .. } => {
            RelayExitCode::SETUP_ERROR
        }
        LaunchError::Accept(_) | LaunchError::AcceptTimedOut { .. } => {
            RelayExitCode::CONNECTION_CLOSED
        }
        LaunchError::Spawn { .. }
        | LaunchError::ProcessWait { .. }
        | LaunchError::ProcessFailed { .. } => RelayExitCode::PROCESS_FAILED,
        LaunchError::Dispatch(err) => dispatch_exit_code(err),
        _ => 1,
    }
}

fn dispatch_exit_code(err: &DispatchError) -> i32 {
    match err {
        DispatchError::Transport(
            TransportError::ConnectionClosed { .. } | TransportError::Io(_),
        ) => RelayExitCode::CONNECTION_CLOSED,
        DispatchError::Transport(_)
        | DispatchError::Decode(_)
        | DispatchError::Protocol(_)
        | DispatchError::Registry(_) => RelayExitCode::PROTOCOL_ERROR,
        DispatchError::Tracker { .. } => RelayExitCode::TRACKER_SYNC_FAILED,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_case::test_case;
    use testrelay_runner::{
        errors::{ProtocolViolation, RegistryError},
        tracker::TrackerOperation,
    };

    fn io_error() -> std::io::Error {
        std::io::Error::other("boom")
    }

    #[test_case(
        LaunchError::Bind { host: "localhost".to_owned(), err: io_error() },
        RelayExitCode::SETUP_ERROR
        ; "bind")]
    #[test_case(
        LaunchError::AcceptTimedOut { timeout: Duration::from_secs(60) },
        RelayExitCode::CONNECTION_CLOSED
        ; "accept timed out")]
    #[test_case(
        LaunchError::Spawn { program: "testo".to_owned(), err: io_error() },
        RelayExitCode::PROCESS_FAILED
        ; "spawn")]
    #[test_case(
        LaunchError::Dispatch(TransportError::ConnectionClosed { buffered: 3 }.into()),
        RelayExitCode::CONNECTION_CLOSED
        ; "connection closed")]
    #[test_case(
        LaunchError::Dispatch(
            TransportError::Protocol(ProtocolViolation::FrameTooLarge { declared: 10, max: 1 }).into()
        ),
        RelayExitCode::PROTOCOL_ERROR
        ; "frame too large")]
    #[test_case(
        LaunchError::Dispatch(RegistryError::UnknownTest { name: "ghost".to_owned() }.into()),
        RelayExitCode::PROTOCOL_ERROR
        ; "unknown test")]
    #[test_case(
        LaunchError::Dispatch(DispatchError::Tracker {
            source_file: "a.testo".into(),
            err: TrackerError::UnknownExecId {
                operation: TrackerOperation::UpdateResult,
                id: "result-9".to_owned(),
            },
        }),
        RelayExitCode::TRACKER_SYNC_FAILED
        ; "tracker")]
    fn launch_error_exit_codes(err: LaunchError, expected: i32) {
        assert_eq!(ExpectedError::from(err).process_exit_code(), expected);
    }
}
