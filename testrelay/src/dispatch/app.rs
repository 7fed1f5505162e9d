// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-level application and command routing.

use super::{list_groups::ListGroupsOpts, run::RunOpts};
use crate::{
    ExpectedError, Result,
    output::{OutputContext, OutputOpts},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Subcommand};
use std::io::Write;
use testrelay_runner::config::RelayConfig;

/// Runs a test execution process and relays its live progress to a result tracker.
#[derive(Debug, clap::Parser)]
#[command(version, max_term_width = 100)]
pub struct TestRelayApp {
    #[clap(flatten)]
    common: CommonOpts,

    #[clap(subcommand)]
    command: Command,
}

impl TestRelayApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.common.output.init()
    }

    /// Executes the app.
    ///
    /// Command output goes to `stdout`; logs and errors go to stderr. Returns the exit code.
    pub fn exec(self, output: OutputContext, stdout: &mut dyn Write) -> Result<i32> {
        let base = BaseApp::new(output, self.common.config_file.as_deref())?;
        match self.command {
            Command::Run(opts) => opts.exec(&base, stdout),
            Command::ListGroups(opts) => opts.exec(&base, stdout),
        }
    }
}

#[derive(Debug, Args)]
struct CommonOpts {
    #[clap(flatten)]
    output: OutputOpts,

    /// Config file [default: .config/testrelay.toml in the current directory]
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "TESTRELAY_CONFIG_FILE"
    )]
    config_file: Option<Utf8PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch the test process and sync its progress to the tracker
    Run(RunOpts),

    /// List the definition files that would form test groups
    ListGroups(ListGroupsOpts),
}

/// State shared by every command: the output context and the loaded config.
#[derive(Debug)]
pub(super) struct BaseApp {
    pub(super) output: OutputContext,
    pub(super) config: RelayConfig,
}

impl BaseApp {
    fn new(output: OutputContext, config_file: Option<&Utf8Path>) -> Result<Self> {
        let current_dir = std::env::current_dir()
            .map_err(|err| ExpectedError::GetCurrentDirFailed { err })?;
        let project_root = Utf8PathBuf::try_from(current_dir)
            .map_err(|err| ExpectedError::CurrentDirInvalidUtf8 { err })?;
        let config = RelayConfig::from_sources(project_root, config_file)?;

        Ok(Self { output, config })
    }
}
