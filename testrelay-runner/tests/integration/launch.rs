// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::SourceDir;
use color_eyre::eyre::{Result, bail};
use pretty_assertions::assert_eq;
use std::time::Duration;
use testrelay_runner::{
    config::RetryPolicy,
    errors::{DispatchError, LaunchError, TransportError},
    grouping::{COMMENT_SEPARATOR, StatusLabel},
    launch::{LaunchRunnerBuilder, ProcessSpec},
    tracker::{JournalTracker, RetryingTracker, test_helpers::RecordingTracker},
};

const FAKE_PROCESS: &str = env!("CARGO_BIN_EXE_testrelay-fake-process");

fn fake_process(scenario: &str) -> ProcessSpec {
    ProcessSpec::new(FAKE_PROCESS).with_args([scenario, "{host}:{port}", "{source}"])
}

fn read_journal(tracker: &JournalTracker) -> Result<Vec<serde_json::Value>> {
    let contents = fs_err::read_to_string(tracker.journal_path())?;
    let mut records = Vec::new();
    for line in contents.lines() {
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}

#[test]
fn successful_launch_is_journaled() -> Result<()> {
    let source = SourceDir::new(&["os.testo"])?;
    let journal_dir = source.dir.path().join("journal");
    let tracker = RetryingTracker::new(
        JournalTracker::create(&journal_dir, "CYCLE-7")?,
        RetryPolicy::immediate(0),
    );

    let runner =
        LaunchRunnerBuilder::default().build(fake_process("pass"), source.files[0].clone())?;
    let outcome = runner.execute(source.grouping(), tracker)?;

    assert_eq!(outcome.summary.groups.len(), 1);
    assert_eq!(outcome.summary.groups[0].status, StatusLabel::Pass);
    assert!(outcome.summary.groups[0].exec_id.is_some());

    let journal = outcome.tracker.into_inner();
    let records = read_journal(&journal)?;
    let kinds: Vec<_> = records
        .iter()
        .map(|record| record["record"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(
        kinds,
        [
            // install_os: begin, screenshot, end + output
            "create",
            "attachment",
            "update",
            "attachment",
            // check_network: begin, screenshot, end + output
            "update",
            "attachment",
            "update",
            "attachment",
        ]
    );

    let last_update = &records[6];
    assert_eq!(last_update["status"], "Pass");
    assert_eq!(
        last_update["comment"],
        format!("installing\n{COMMENT_SEPARATOR}pinging\n")
    );
    // Screenshots are numbered per group.
    assert!(
        records[5]["path"]
            .as_str()
            .is_some_and(|path| path.ends_with("check_network_2.png")),
        "unexpected screenshot record {}",
        records[5]
    );
    Ok(())
}

#[test]
fn skipped_dependents_block_the_group() -> Result<()> {
    let source = SourceDir::new(&["os.testo"])?;
    let tracker = RecordingTracker::new();

    let runner = LaunchRunnerBuilder::default()
        .build(fake_process("logic-error"), source.files[0].clone())?;
    let outcome = runner.execute(source.grouping(), tracker)?;

    assert_eq!(outcome.summary.groups[0].status, StatusLabel::Blocked);
    Ok(())
}

#[test]
fn connection_closed_before_launch_end() -> Result<()> {
    let source = SourceDir::new(&["os.testo"])?;
    let tracker = RecordingTracker::new();

    let runner = LaunchRunnerBuilder::default()
        .build(fake_process("close-early"), source.files[0].clone())?;
    match runner.execute(source.grouping(), tracker.clone()) {
        Err(LaunchError::Dispatch(DispatchError::Transport(
            TransportError::ConnectionClosed { .. },
        ))) => {}
        other => bail!("expected ConnectionClosed, found {other:?}"),
    }
    // The touch from test_begin stays on the tracker.
    assert_eq!(tracker.calls().len(), 1);
    Ok(())
}

#[cfg(unix)]
#[test]
fn failing_process_is_reported() -> Result<()> {
    let source = SourceDir::new(&["os.testo"])?;
    let spec = ProcessSpec::new("sh").with_args(["-c", "echo 'no such suite' >&2; exit 3"]);

    let runner = LaunchRunnerBuilder::default().build(spec, source.files[0].clone())?;
    match runner.execute(source.grouping(), RecordingTracker::new()) {
        Err(LaunchError::ProcessFailed {
            program,
            exit_status,
            stderr,
        }) => {
            assert_eq!(program, "sh");
            assert_eq!(exit_status.code(), Some(3));
            assert_eq!(stderr, "no such suite\n");
        }
        other => bail!("expected ProcessFailed, found {other:?}"),
    }
    Ok(())
}

#[cfg(unix)]
#[test]
fn configured_exit_codes_count_as_success() -> Result<()> {
    let source = SourceDir::new(&["os.testo"])?;
    // The process exits "successfully" without ever connecting, so the accept timeout that starts
    // at exit ends the launch.
    let spec = ProcessSpec::new("sh")
        .with_args(["-c", "exit 1"])
        .with_success_exit_codes([0, 1]);

    let mut builder = LaunchRunnerBuilder::default();
    builder.set_accept_timeout(Duration::from_millis(500));
    let runner = builder.build(spec, source.files[0].clone())?;
    match runner.execute(source.grouping(), RecordingTracker::new()) {
        Err(LaunchError::AcceptTimedOut { timeout }) => {
            assert_eq!(timeout, Duration::from_millis(500));
        }
        other => bail!("expected AcceptTimedOut, found {other:?}"),
    }
    Ok(())
}

#[test]
fn slow_connection_is_not_timed_out_while_process_runs() -> Result<()> {
    let source = SourceDir::new(&["os.testo"])?;
    // The process takes longer to connect than the accept timeout, but it is still running.
    let spec = ProcessSpec::new("sh").with_args([
        "-c",
        r#"sleep 1 && exec "$0" pass "$1" "$2""#,
        FAKE_PROCESS,
        "{host}:{port}",
        "{source}",
    ]);

    let mut builder = LaunchRunnerBuilder::default();
    builder.set_accept_timeout(Duration::from_millis(200));
    let runner = builder.build(spec, source.files[0].clone())?;
    let outcome = runner.execute(source.grouping(), RecordingTracker::new())?;

    assert_eq!(outcome.summary.groups.len(), 1);
    assert_eq!(outcome.summary.groups[0].status, StatusLabel::Pass);
    Ok(())
}

#[test]
fn missing_program_fails_to_spawn() -> Result<()> {
    let source = SourceDir::new(&["os.testo"])?;
    let spec = ProcessSpec::new("/nonexistent/testrelay-missing-program");

    let runner = LaunchRunnerBuilder::default().build(spec, source.files[0].clone())?;
    match runner.execute(source.grouping(), RecordingTracker::new()) {
        Err(LaunchError::Spawn { program, .. }) => {
            assert_eq!(program, "/nonexistent/testrelay-missing-program");
        }
        other => bail!("expected Spawn, found {other:?}"),
    }
    Ok(())
}
