// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running the external process and dispatching its report stream.
//!
//! A launch binds the [`ReportServer`], spawns the process with the server's address on its
//! command line, and then drives two things concurrently: waiting for the process to exit, and
//! accepting its report connection and dispatching events until `launch_end`. The first error
//! from either side ends the launch.

use crate::{
    config::{ProcessConfig, RelayConfig},
    dispatcher::{EventDispatcher, LaunchSummary},
    errors::{DispatchError, LaunchError},
    grouping::TestGrouping,
    process::{self, Child},
    protocol::FrameTransport,
    server::ReportServer,
    tracker::TrackerSync,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{process::ExitStatus, time::Duration};
use tokio::{net::TcpStream, runtime::Runtime, sync::oneshot};
use tracing::{debug, info};

/// How the external process is invoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessSpec {
    program: String,
    args: Vec<String>,
    passthrough: Vec<String>,
    success_exit_codes: Vec<i32>,
}

impl ProcessSpec {
    /// Creates a spec for `program` with no arguments, treating exit code 0 as success.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            passthrough: Vec::new(),
            success_exit_codes: vec![0],
        }
    }

    /// Creates a spec from the `[process]` section of the config.
    pub fn from_config(config: &ProcessConfig) -> Self {
        Self {
            program: config.program().to_owned(),
            args: config.args().to_vec(),
            passthrough: Vec::new(),
            success_exit_codes: config.success_exit_codes().to_vec(),
        }
    }

    /// Sets the argument templates.
    ///
    /// Each argument may contain the placeholders `{host}`, `{port}` and `{source}`.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Appends arguments that are passed through verbatim, after the templated ones.
    pub fn with_passthrough(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.passthrough.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the exit codes that count as success.
    pub fn with_success_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.success_exit_codes = codes.into_iter().collect();
        self
    }

    /// The program to run.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the arguments with placeholders substituted, followed by the pass-through
    /// arguments.
    pub fn resolved_args(&self, host: &str, port: u16, source: &Utf8Path) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{host}", host)
                    .replace("{port}", &port)
                    .replace("{source}", source.as_str())
            })
            .chain(self.passthrough.iter().cloned())
            .collect()
    }

    /// Builds the command for a launch reporting to `host:port`.
    pub fn command(&self, host: &str, port: u16, source: &Utf8Path) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(self.resolved_args(host, port, source));
        cmd
    }

    /// Returns true if `status` is one of the success exit codes. Death by signal never is.
    pub fn is_success(&self, status: ExitStatus) -> bool {
        status
            .code()
            .is_some_and(|code| self.success_exit_codes.contains(&code))
    }
}

/// Launch runner builder.
#[derive(Debug)]
pub struct LaunchRunnerBuilder {
    host: String,
    accept_timeout: Duration,
    max_frame_size: u64,
}

impl Default for LaunchRunnerBuilder {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            accept_timeout: Duration::from_secs(60),
            max_frame_size: 64 * 1024 * 1024,
        }
    }
}

impl LaunchRunnerBuilder {
    /// Creates a builder with the `[server]` settings from the config.
    pub fn from_config(config: &RelayConfig) -> Self {
        let server = config.server();
        Self {
            host: server.host().to_owned(),
            accept_timeout: server.accept_timeout(),
            max_frame_size: server.max_frame_size(),
        }
    }

    /// Sets the host to bind the report server on.
    pub fn set_host(&mut self, host: impl Into<String>) -> &mut Self {
        self.host = host.into();
        self
    }

    /// Sets how long to wait for the process to connect.
    pub fn set_accept_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.accept_timeout = timeout;
        self
    }

    /// Sets the maximum frame size accepted from the process.
    pub fn set_max_frame_size(&mut self, size: u64) -> &mut Self {
        self.max_frame_size = size;
        self
    }

    /// Creates a new launch runner for `source`.
    pub fn build(
        self,
        spec: ProcessSpec,
        source: impl Into<Utf8PathBuf>,
    ) -> Result<LaunchRunner, LaunchError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("testrelay-worker")
            .build()
            .map_err(LaunchError::TokioRuntimeCreate)?;

        Ok(LaunchRunner {
            inner: LaunchRunnerInner {
                spec,
                source: source.into(),
                host: self.host,
                accept_timeout: self.accept_timeout,
                max_frame_size: self.max_frame_size,
            },
            runtime,
        })
    }
}

/// Runs one launch of the external process.
#[derive(Debug)]
pub struct LaunchRunner {
    inner: LaunchRunnerInner,
    runtime: Runtime,
}

impl LaunchRunner {
    /// Runs the launch to completion, syncing `grouping` to `tracker`.
    pub fn execute<T: TrackerSync>(
        self,
        grouping: TestGrouping,
        tracker: T,
    ) -> Result<LaunchOutcome<T>, LaunchError> {
        let Self { inner, runtime } = self;
        let outcome = runtime.block_on(inner.run(grouping, tracker));

        // An abandoned process may still hold a report connection; don't wait on it.
        runtime.shutdown_background();
        outcome
    }
}

/// The result of a successful launch.
#[derive(Debug)]
pub struct LaunchOutcome<T> {
    /// The final status of every group.
    pub summary: LaunchSummary,

    /// The tracker, after every sync.
    pub tracker: T,
}

#[derive(Debug)]
struct LaunchRunnerInner {
    spec: ProcessSpec,
    source: Utf8PathBuf,
    host: String,
    accept_timeout: Duration,
    max_frame_size: u64,
}

impl LaunchRunnerInner {
    async fn run<T: TrackerSync>(
        &self,
        grouping: TestGrouping,
        tracker: T,
    ) -> Result<LaunchOutcome<T>, LaunchError> {
        let server = ReportServer::bind(&self.host, self.max_frame_size).await?;
        let cmd = self
            .spec
            .command(server.host(), server.port(), &self.source);
        debug!("spawning {cmd:?}");
        let child = process::spawn(cmd).map_err(|err| LaunchError::Spawn {
            program: self.spec.program().to_owned(),
            err,
        })?;
        info!(
            "started {} (reporting to {})",
            self.spec.program(),
            server.local_addr()
        );

        let (exited_tx, exited_rx) = oneshot::channel();
        let mut dispatcher = EventDispatcher::new(grouping, tracker);
        let dispatch = async {
            let mut transport = self.accept_connection(&server, exited_rx).await?;
            dispatcher.serve(&mut transport).await?;
            Ok::<_, LaunchError>(())
        };
        tokio::try_join!(self.supervise(child, exited_tx), dispatch)?;

        let summary = dispatcher.summary().map_err(DispatchError::from)?;
        let (_, _, tracker) = dispatcher.into_parts();
        Ok(LaunchOutcome { summary, tracker })
    }

    /// Waits for the report connection.
    ///
    /// The process may take as long as it likes to connect while it runs. Once it has exited, a
    /// connection it made may still be waiting in the backlog, so accepting gets
    /// `accept_timeout` more before the launch fails.
    async fn accept_connection(
        &self,
        server: &ReportServer,
        exited: oneshot::Receiver<()>,
    ) -> Result<FrameTransport<TcpStream>, LaunchError> {
        let accept = server.accept();
        tokio::pin!(accept);

        tokio::select! {
            res = &mut accept => res,
            // A dropped sender also means supervision is over.
            _ = exited => {
                debug!(
                    "process exited before connecting, waiting up to {:?} for the connection",
                    self.accept_timeout
                );
                tokio::time::timeout(self.accept_timeout, accept)
                    .await
                    .map_err(|_| LaunchError::AcceptTimedOut {
                        timeout: self.accept_timeout,
                    })?
            }
        }
    }

    async fn supervise(
        &self,
        child: Child,
        exited: oneshot::Sender<()>,
    ) -> Result<(), LaunchError> {
        let program = self.spec.program();
        let (res, output) = process::wait_draining(child).await;
        // The dispatch side may already be done with the connection.
        let _ = exited.send(());
        let exit_status = res.map_err(|err| LaunchError::ProcessWait {
            program: program.to_owned(),
            err,
        })?;

        if !output.stdout.is_empty() {
            debug!(
                "{program} stdout (tail):\n{}",
                String::from_utf8_lossy(&output.stdout)
            );
        }
        if self.spec.is_success(exit_status) {
            debug!("{program} exited with {exit_status}");
            Ok(())
        } else {
            Err(LaunchError::ProcessFailed {
                program: program.to_owned(),
                exit_status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}
