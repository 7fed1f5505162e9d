// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Spawning the external process and draining its output while it runs.

use bytes::{Buf, Bytes, BytesMut};
use std::{
    io,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child as TokioChild, ChildStderr, ChildStdout},
};
use tracing::{debug, warn};

/// The size of each buffered reader's buffer.
const CHUNK_SIZE: usize = 4 * 1024;

/// How much of each output stream is kept for diagnostics.
pub(crate) const OUTPUT_TAIL_SIZE: usize = 4 * 1024;

/// How long to keep reading output after the process exits. Grandchildren may hold the pipes open
/// indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// A spawned child process along with its output pipes.
pub(crate) struct Child {
    pub(crate) child: TokioChild,
    pub(crate) fds: ChildFds,
}

/// Spawns `cmd` with stdin closed and stdout and stderr piped.
///
/// The child is not killed if the returned handle is dropped.
pub(crate) fn spawn(mut cmd: std::process::Command) -> io::Result<Child> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut cmd: tokio::process::Command = cmd.into();
    let mut child = cmd.spawn()?;
    let fds = ChildFds::new(child.stdout.take(), child.stderr.take());
    Ok(Child { child, fds })
}

/// A `BufReader` over an `AsyncRead` that tracks whether it has hit EOF or an error.
pub(crate) struct FusedBufReader<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FusedBufReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            done: false,
        }
    }

    pub(crate) async fn fill_buf(&mut self, acc: &mut BytesMut) -> Result<(), io::Error> {
        if self.done {
            return Ok(());
        }

        match self.reader.fill_buf().await {
            Ok(buf) => {
                acc.extend_from_slice(buf);
                if buf.is_empty() {
                    self.done = true;
                }
                let len = buf.len();
                self.reader.consume(len);
                Ok(())
            }
            Err(error) => {
                self.done = true;
                Err(error)
            }
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }
}

async fn fill_buf_opt<R: AsyncRead + Unpin>(
    reader: Option<&mut FusedBufReader<R>>,
    acc: &mut BytesMut,
) -> Result<(), io::Error> {
    match reader {
        Some(reader) => reader.fill_buf(acc).await,
        None => Ok(()),
    }
}

fn is_done_opt<R: AsyncRead + Unpin>(reader: &Option<FusedBufReader<R>>) -> bool {
    reader.as_ref().is_none_or(|r| r.is_done())
}

/// The stdout and stderr pipes of a child process.
pub(crate) struct ChildFds {
    stdout: Option<FusedBufReader<ChildStdout>>,
    stderr: Option<FusedBufReader<ChildStderr>>,
}

impl ChildFds {
    pub(crate) fn new(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> Self {
        Self {
            stdout: stdout.map(FusedBufReader::new),
            stderr: stderr.map(FusedBufReader::new),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        is_done_opt(&self.stdout) && is_done_opt(&self.stderr)
    }
}

/// Output accumulator for a child process, keeping the tail of each stream.
///
/// Reading is cancel-safe, since the underlying [`AsyncBufReadExt::fill_buf`] is, so a read can
/// race against the child exiting.
pub(crate) struct ChildAccumulator {
    fds: ChildFds,
    stdout: BytesMut,
    stderr: BytesMut,
}

impl ChildAccumulator {
    pub(crate) fn new(fds: ChildFds) -> Self {
        Self {
            fds,
            stdout: BytesMut::with_capacity(CHUNK_SIZE),
            stderr: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.fds.is_done()
    }

    /// Reads whatever is available from either stream.
    pub(crate) async fn fill_buf(&mut self) {
        let Self {
            fds,
            stdout,
            stderr,
        } = self;
        tokio::select! {
            res = fill_buf_opt(fds.stdout.as_mut(), stdout), if !is_done_opt(&fds.stdout) => {
                if let Err(error) = res {
                    warn!("error reading process stdout: {error}");
                }
            }
            res = fill_buf_opt(fds.stderr.as_mut(), stderr), if !is_done_opt(&fds.stderr) => {
                if let Err(error) = res {
                    warn!("error reading process stderr: {error}");
                }
            }
            else => {}
        }
        keep_tail(stdout);
        keep_tail(stderr);
    }

    pub(crate) fn freeze(self) -> ChildOutputTail {
        ChildOutputTail {
            stdout: self.stdout.freeze(),
            stderr: self.stderr.freeze(),
        }
    }
}

fn keep_tail(acc: &mut BytesMut) {
    if acc.len() > OUTPUT_TAIL_SIZE {
        acc.advance(acc.len() - OUTPUT_TAIL_SIZE);
    }
}

/// The last [`OUTPUT_TAIL_SIZE`] bytes of each output stream.
#[derive(Clone, Debug, Default)]
pub(crate) struct ChildOutputTail {
    pub(crate) stdout: Bytes,
    pub(crate) stderr: Bytes,
}

/// Waits for the child to exit, draining its output meanwhile.
pub(crate) async fn wait_draining(
    child: Child,
) -> (io::Result<ExitStatus>, ChildOutputTail) {
    let Child { mut child, fds } = child;
    let mut acc = ChildAccumulator::new(fds);

    let res = loop {
        tokio::select! {
            () = acc.fill_buf(), if !acc.is_done() => {}
            res = child.wait() => break res,
        }
    };

    // Pick up whatever was written just before exit.
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while !acc.is_done() {
            acc.fill_buf().await;
        }
    })
    .await;
    if drained.is_err() {
        debug!("process exited but its output pipes are still open");
    }

    (res, acc.freeze())
}
