// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testrelay.

use crate::{dispatcher::DispatchState, protocol::EventKind, tracker::TrackerOperation};
use camino::{FromPathBufError, Utf8PathBuf};
use config::ConfigError;
use std::{process::ExitStatus, time::Duration};
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse testrelay config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
///
/// Returned by [`ConfigParseError::kind`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// An error that occurred while looking for test definition files.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The source location could not be canonicalized.
    #[error("test source `{root}` could not be canonicalized")]
    Canonicalize {
        /// The source location provided.
        root: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Walking the source directory failed.
    #[error("error walking test source `{root}`")]
    Walk {
        /// The source location provided.
        root: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: walkdir::Error,
    },

    /// A definition file path isn't valid UTF-8.
    #[error("test definition file path is not valid UTF-8")]
    NonUtf8Path {
        /// The underlying error.
        #[source]
        err: FromPathBufError,
    },
}

/// A violation of the reporting protocol by the remote side, or a misuse of the transport.
///
/// Protocol violations indicate a collaborator or version mismatch, and are never retried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolViolation {
    /// A frame read was requested while a previous one was still outstanding.
    #[error("a frame read is already pending on this connection")]
    ReadAlreadyPending,

    /// A frame declared a length larger than the configured maximum.
    #[error("frame declares {declared} bytes, which exceeds the maximum of {max} bytes")]
    FrameTooLarge {
        /// The length declared by the frame prefix.
        declared: u64,

        /// The maximum allowed length.
        max: u64,
    },

    /// A frame payload could not be decoded as CBOR.
    #[error("frame payload is not valid CBOR")]
    MalformedPayload {
        /// The underlying error.
        #[source]
        err: ciborium::de::Error<std::io::Error>,
    },

    /// A message did not carry a textual `type` field.
    #[error("message is not a map with a textual `type` field")]
    MissingType,

    /// A message of a known type had missing or ill-typed fields.
    #[error("malformed `{kind}` message")]
    MalformedEvent {
        /// The message type.
        kind: EventKind,

        /// The underlying error.
        #[source]
        err: ciborium::value::Error,
    },

    /// A message arrived in a dispatcher state where it isn't allowed.
    #[error("unexpected `{kind}` message while {state}")]
    UnexpectedEvent {
        /// The message type.
        kind: EventKind,

        /// The state the dispatcher was in.
        state: DispatchState,
    },
}

/// An error that occurred on the framed report connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The protocol was violated.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// The remote side closed the connection.
    #[error("report connection was closed by the remote side")]
    ConnectionClosed {
        /// The number of bytes of an incomplete frame that were buffered at the time.
        buffered: usize,
    },

    /// An I/O error occurred on the underlying stream.
    #[error("I/O error on report connection")]
    Io(#[source] std::io::Error),

    /// A payload could not be encoded.
    #[error("failed to encode frame payload")]
    Encode(#[source] ciborium::ser::Error<std::io::Error>),
}

/// An error that occurred while turning a decoded payload into an [`Event`](crate::protocol::Event).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventDecodeError {
    /// The payload violated the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// The `type` field named a message type that isn't known.
    #[error("invalid message type `{kind}`")]
    InvalidMessageType {
        /// The type tag that was received.
        kind: String,
    },
}

/// An invariant of the test registry was violated.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// A test name was declared more than once.
    #[error("test `{name}` was declared more than once")]
    DuplicateTest {
        /// The name of the test.
        name: String,
    },

    /// A test name was referenced without having been declared.
    #[error("test `{name}` was referenced but never declared")]
    UnknownTest {
        /// The name of the test.
        name: String,
    },
}

/// An error returned by a [`TrackerSync`](crate::tracker::TrackerSync) implementation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrackerError {
    /// The tracker does not know about the target yet. This is transient, and is retried.
    #[error("{operation}: target not found yet ({message})")]
    NotFoundYet {
        /// The operation that failed.
        operation: TrackerOperation,

        /// A description of what was missing.
        message: String,
    },

    /// An update or attachment targeted a result the tracker never created.
    #[error("{operation}: unknown result id `{id}`")]
    UnknownExecId {
        /// The operation that failed.
        operation: TrackerOperation,

        /// The result id that was targeted.
        id: String,
    },

    /// Writing to the tracker journal failed.
    #[error("failed to write tracker journal at `{path}`")]
    Journal {
        /// The path that was being written.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// A journal record could not be serialized.
    #[error("failed to serialize tracker journal record")]
    Serialize(#[source] serde_json::Error),

    /// A transient error persisted through every retry.
    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        /// The operation that failed.
        operation: TrackerOperation,

        /// The number of attempts made.
        attempts: u32,

        /// The last error seen.
        #[source]
        last: Box<TrackerError>,
    },
}

impl TrackerError {
    /// Returns true if this error is transient and the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotFoundYet { .. })
    }
}

/// A fatal error that stopped event dispatch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// Reading or acknowledging a frame failed.
    #[error("report transport failed")]
    Transport(#[from] TransportError),

    /// A frame could not be turned into an event.
    #[error("failed to decode report event")]
    Decode(#[from] EventDecodeError),

    /// An event arrived out of order.
    #[error("report protocol violated")]
    Protocol(#[from] ProtocolViolation),

    /// An event broke a registry invariant.
    #[error("test registry invariant violated")]
    Registry(#[from] RegistryError),

    /// Syncing a test group to the tracker failed.
    #[error("failed to sync `{source_file}` to the tracker")]
    Tracker {
        /// The definition file of the group being synced.
        source_file: Utf8PathBuf,

        /// The underlying error.
        #[source]
        err: TrackerError,
    },
}

/// A fatal error that ended a launch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LaunchError {
    /// Creating the Tokio runtime failed.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// The report server could not be bound.
    #[error("failed to bind report server on `{host}`")]
    Bind {
        /// The host that was requested.
        host: String,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Accepting the report connection failed.
    #[error("failed to accept report connection")]
    Accept(#[source] std::io::Error),

    /// The process exited and no report connection arrived within the accept timeout.
    #[error("process exited without connecting to the report server (waited {timeout:?})")]
    AcceptTimedOut {
        /// The configured accept timeout.
        timeout: Duration,
    },

    /// The process could not be spawned.
    #[error("failed to spawn `{program}`")]
    Spawn {
        /// The program that was spawned.
        program: String,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// Waiting for the process failed.
    #[error("failed to wait for `{program}`")]
    ProcessWait {
        /// The program that was spawned.
        program: String,

        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The process exited with a status outside the configured success codes.
    #[error("`{program}` failed with {exit_status}")]
    ProcessFailed {
        /// The program that was spawned.
        program: String,

        /// The exit status of the process.
        exit_status: ExitStatus,

        /// The tail of the process's standard error, lossily decoded.
        stderr: String,
    },

    /// Event dispatch failed.
    #[error("launch event dispatch failed")]
    Dispatch(#[from] DispatchError),
}
