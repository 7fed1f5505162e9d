// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::app::BaseApp;
use crate::{ExpectedError, Result};
use camino::Utf8PathBuf;
use clap::Args;
use std::io::Write;
use testrelay_metadata::RelayExitCode;
use testrelay_runner::discovery::discover_definition_files;
use tracing::warn;

#[derive(Debug, Args)]
pub(super) struct ListGroupsOpts {
    /// Test definition directory, or a single definition file
    #[arg(long, value_name = "PATH")]
    source: Utf8PathBuf,
}

impl ListGroupsOpts {
    pub(super) fn exec(self, base: &BaseApp, stdout: &mut dyn Write) -> Result<i32> {
        let extensions = base.config.discovery().extensions();
        let files = discover_definition_files(&self.source, extensions)?;
        if files.is_empty() {
            warn!(
                "no test definition files found under `{}` (extensions: {})",
                self.source,
                extensions.join(", ")
            );
        }

        let project_root = base.config.project_root();
        let res: std::io::Result<()> = files.iter().try_for_each(|file| {
            let file = file.strip_prefix(project_root).unwrap_or(file);
            writeln!(stdout, "{file}")
        });
        res.and_then(|()| stdout.flush())
            .map_err(|err| ExpectedError::WriteOutputError { err })?;

        Ok(RelayExitCode::OK)
    }
}
