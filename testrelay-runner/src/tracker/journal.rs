// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ExecId, ResultReport, ResultUpdate, TrackerOperation, TrackerSync};
use crate::{errors::TrackerError, grouping::StatusLabel};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset, Local};
use serde::Serialize;
use std::{collections::HashSet, io::Write};
use tracing::debug;

/// The name of the journal file within the journal directory.
pub const JOURNAL_FILE_NAME: &str = "results.jsonl";

/// The name of the attachments directory within the journal directory.
pub const ATTACHMENTS_DIR_NAME: &str = "attachments";

/// A [`TrackerSync`] that records every call in a JSON-lines journal.
///
/// Each call appends one record to `results.jsonl`. Attachments are written to
/// `attachments/<result id>/<file name>`. Result ids are assigned locally, so no call ever fails
/// transiently.
#[derive(Debug)]
pub struct JournalTracker {
    dir: Utf8PathBuf,
    target: String,
    run_stamp: String,
    known: HashSet<ExecId>,
    next_id: usize,
}

impl JournalTracker {
    /// Creates the journal directory if necessary, and returns a tracker that records results for
    /// `target` into it.
    pub fn create(dir: impl Into<Utf8PathBuf>, target: impl Into<String>) -> Result<Self, TrackerError> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir).map_err(|err| TrackerError::Journal {
            path: dir.clone(),
            err,
        })?;

        Ok(Self {
            dir,
            target: target.into(),
            run_stamp: Local::now().format("%Y%m%dT%H%M%S").to_string(),
            known: HashSet::new(),
            next_id: 1,
        })
    }

    /// Returns the journal directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Returns the path to the journal file.
    pub fn journal_path(&self) -> Utf8PathBuf {
        self.dir.join(JOURNAL_FILE_NAME)
    }

    fn append(&self, record: &JournalRecord<'_>) -> Result<(), TrackerError> {
        let mut line = serde_json::to_vec(record).map_err(TrackerError::Serialize)?;
        line.push(b'\n');

        let path = self.journal_path();
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| TrackerError::Journal {
                path: path.clone(),
                err,
            })?;
        file.write_all(&line)
            .map_err(|err| TrackerError::Journal { path, err })
    }

    fn check_known(&self, operation: TrackerOperation, id: &ExecId) -> Result<(), TrackerError> {
        if self.known.contains(id) {
            Ok(())
        } else {
            Err(TrackerError::UnknownExecId {
                operation,
                id: id.to_string(),
            })
        }
    }

    fn write_attachment(
        &self,
        operation: TrackerOperation,
        id: &ExecId,
        filename: &str,
        contents: &[u8],
    ) -> Result<(), TrackerError> {
        self.check_known(operation, id)?;

        let dir = self
            .dir
            .join(ATTACHMENTS_DIR_NAME)
            .join(sanitize_file_name(id.as_str()));
        fs_err::create_dir_all(&dir).map_err(|err| TrackerError::Journal {
            path: dir.clone(),
            err,
        })?;

        let path = dir.join(sanitize_file_name(filename));
        fs_err::write(&path, contents).map_err(|err| TrackerError::Journal {
            path: path.clone(),
            err,
        })?;
        debug!("wrote attachment {path} for result {id}");

        self.append(&JournalRecord {
            timestamp: now(),
            kind: RecordKind::Attachment {
                id,
                operation: match operation {
                    TrackerOperation::AttachImage => AttachmentKind::Image,
                    _ => AttachmentKind::Text,
                },
                path: &path,
                size: contents.len(),
            },
        })
    }
}

impl TrackerSync for JournalTracker {
    async fn create_result(&mut self, report: &ResultReport) -> Result<ExecId, TrackerError> {
        let id = ExecId::new(format!(
            "{}-{}-{}",
            self.target, self.run_stamp, self.next_id
        ));
        self.append(&JournalRecord {
            timestamp: now(),
            kind: RecordKind::Create {
                id: &id,
                target: &self.target,
                source_file: &report.source_file,
                status: report.status,
                comment: report.comment.as_deref(),
            },
        })?;

        self.next_id += 1;
        self.known.insert(id.clone());
        debug!("created result {id} for {}", report.source_file);
        Ok(id)
    }

    async fn update_result(
        &mut self,
        id: &ExecId,
        update: &ResultUpdate,
    ) -> Result<ExecId, TrackerError> {
        self.check_known(TrackerOperation::UpdateResult, id)?;
        self.append(&JournalRecord {
            timestamp: now(),
            kind: RecordKind::Update {
                id,
                status: update.status,
                comment: update.comment.as_deref(),
            },
        })?;
        Ok(id.clone())
    }

    async fn attach_text(
        &mut self,
        id: &ExecId,
        filename: &str,
        contents: &[u8],
    ) -> Result<(), TrackerError> {
        self.write_attachment(TrackerOperation::AttachText, id, filename, contents)
    }

    async fn attach_image(
        &mut self,
        id: &ExecId,
        filename: &str,
        contents: &[u8],
    ) -> Result<(), TrackerError> {
        self.write_attachment(TrackerOperation::AttachImage, id, filename, contents)
    }
}

#[derive(Serialize)]
struct JournalRecord<'a> {
    timestamp: DateTime<FixedOffset>,
    #[serde(flatten)]
    kind: RecordKind<'a>,
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
enum RecordKind<'a> {
    Create {
        id: &'a ExecId,
        target: &'a str,
        source_file: &'a Utf8Path,
        status: StatusLabel,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<&'a str>,
    },
    Update {
        id: &'a ExecId,
        status: StatusLabel,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<&'a str>,
    },
    Attachment {
        id: &'a ExecId,
        #[serde(rename = "kind")]
        operation: AttachmentKind,
        path: &'a Utf8Path,
        size: usize,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
enum AttachmentKind {
    Text,
    Image,
}

fn now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

// Test names can contain path separators and other characters that aren't valid in file names.
fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match sanitized.as_str() {
        "" | "." | ".." => format!("_{sanitized}"),
        _ => sanitized,
    }
}
