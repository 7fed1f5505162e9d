// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::app::BaseApp;
use crate::{
    ExpectedError, Result,
    output::SummaryStyles,
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use owo_colors::OwoColorize;
use std::io::Write;
use testrelay_metadata::RelayExitCode;
use testrelay_runner::{
    discovery::discover_definition_files,
    dispatcher::LaunchSummary,
    grouping::{StatusLabel, TestGrouping},
    launch::{LaunchRunnerBuilder, ProcessSpec},
    tracker::{JournalTracker, RetryingTracker},
};
use tracing::{info, warn};

#[derive(Debug, Args)]
pub(super) struct RunOpts {
    /// Tracker launch that results are reported under
    #[arg(long, value_name = "ID", env = "TESTRELAY_TARGET")]
    target: String,

    /// Test definition directory, or a single definition file
    #[arg(long, value_name = "PATH")]
    source: Utf8PathBuf,

    /// Directory to write the result journal to [default: tracker.journal-dir from config]
    #[arg(long, value_name = "DIR")]
    journal_dir: Option<Utf8PathBuf>,

    /// Arguments passed through to the test process unchanged
    #[arg(last = true, value_name = "PASSTHROUGH")]
    passthrough: Vec<String>,
}

impl RunOpts {
    pub(super) fn exec(self, base: &BaseApp, stdout: &mut dyn Write) -> Result<i32> {
        let config = &base.config;
        let files = discover_definition_files(&self.source, config.discovery().extensions())?;
        if files.is_empty() {
            warn!(
                "no test definition files found under `{}` (extensions: {})",
                self.source,
                config.discovery().extensions().join(", ")
            );
        }

        let journal_dir = self
            .journal_dir
            .unwrap_or_else(|| config.journal_dir());
        let journal = JournalTracker::create(journal_dir.clone(), self.target)
            .map_err(|err| ExpectedError::journal_create_error(journal_dir, err))?;
        let tracker = RetryingTracker::new(journal, config.tracker().retries());

        let spec = ProcessSpec::from_config(config.process()).with_passthrough(self.passthrough);
        let runner = LaunchRunnerBuilder::from_config(config).build(spec, self.source)?;
        let outcome = runner.execute(TestGrouping::new(files), tracker)?;

        write_summary(
            &outcome.summary,
            config.project_root(),
            base.output.verbose,
            &base.output.stdout_styles(),
            stdout,
        )
        .and_then(|()| stdout.flush())
        .map_err(|err| ExpectedError::WriteOutputError { err })?;

        info!(
            "results journal written to {}",
            outcome.tracker.into_inner().journal_path()
        );
        Ok(RelayExitCode::OK)
    }

    #[cfg(test)]
    pub(super) fn passthrough(&self) -> &[String] {
        &self.passthrough
    }
}

fn write_summary(
    summary: &LaunchSummary,
    project_root: &Utf8Path,
    verbose: bool,
    styles: &SummaryStyles,
    writer: &mut dyn Write,
) -> std::io::Result<()> {
    let mut passed = 0;
    let mut failed = 0;
    let mut other = 0;

    for group in &summary.groups {
        let style = match group.status {
            StatusLabel::Pass => {
                passed += 1;
                styles.pass
            }
            StatusLabel::Fail | StatusLabel::Irrelevant => {
                failed += 1;
                styles.fail
            }
            StatusLabel::Blocked | StatusLabel::InProgress => {
                other += 1;
                styles.skip
            }
        };

        let path = group
            .source_file
            .strip_prefix(project_root)
            .unwrap_or(&group.source_file);
        let label = format!("{:>12}", group.status.as_str());
        write!(writer, "{} {path}", label.style(style))?;
        if verbose {
            match &group.exec_id {
                Some(id) => write!(writer, " [{id}]")?,
                None => write!(writer, " [not synced]")?,
            }
        }
        writeln!(writer)?;
    }

    writeln!(
        writer,
        "{} {} run: {} passed, {} failed, {} not completed",
        summary.groups.len().style(styles.count),
        if summary.groups.len() == 1 { "group" } else { "groups" },
        passed.style(styles.count),
        failed.style(styles.count),
        other.style(styles.count),
    )
}
