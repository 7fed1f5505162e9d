// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Finding test definition files under a source location.
//!
//! Each definition file forms one test group.

use crate::errors::DiscoveryError;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Returns the canonical paths of all definition files under `root`, sorted by path.
///
/// If `root` is itself a file, it is returned as the only definition file regardless of its
/// extension. Otherwise, files whose extension is one of `extensions` are collected recursively.
pub fn discover_definition_files(
    root: &Utf8Path,
    extensions: &[String],
) -> Result<Vec<Utf8PathBuf>, DiscoveryError> {
    let canonical = root
        .canonicalize_utf8()
        .map_err(|err| DiscoveryError::Canonicalize {
            root: root.to_owned(),
            err,
        })?;

    if canonical.is_file() {
        debug!("source {canonical} is a single definition file");
        return Ok(vec![canonical]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&canonical).sort_by_file_name() {
        let entry = entry.map_err(|err| DiscoveryError::Walk {
            root: root.to_owned(),
            err,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = Utf8PathBuf::try_from(entry.into_path())
            .map_err(|err| DiscoveryError::NonUtf8Path { err })?;
        let matches = path
            .extension()
            .is_some_and(|ext| extensions.iter().any(|wanted| wanted == ext));
        if matches {
            files.push(path);
        }
    }

    debug!(
        "discovered {} definition files under {canonical}",
        files.len()
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use pretty_assertions::assert_eq;

    fn touch(path: &Utf8Path) {
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent).unwrap();
        }
        fs_err::write(path, "").unwrap();
    }

    #[test]
    fn finds_definition_files_recursively() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize_utf8().unwrap();
        touch(&root.join("b.testo"));
        touch(&root.join("a.testo"));
        touch(&root.join("nested/deep/c.testo"));
        touch(&root.join("nested/readme.md"));
        touch(&root.join("notes.testo.bak"));

        let files = discover_definition_files(&root, &["testo".to_owned()])
            .expect("discovery succeeds");
        assert_eq!(
            files,
            vec![
                root.join("a.testo"),
                root.join("b.testo"),
                root.join("nested/deep/c.testo"),
            ]
        );
    }

    #[test]
    fn single_file_is_its_own_group() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize_utf8().unwrap();
        let file = root.join("only.txt");
        touch(&file);

        let files =
            discover_definition_files(&file, &["testo".to_owned()]).expect("discovery succeeds");
        assert_eq!(files, vec![file]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");

        let err = discover_definition_files(&missing, &["testo".to_owned()])
            .expect_err("missing source is an error");
        assert!(
            matches!(err, DiscoveryError::Canonicalize { ref root, .. } if root == &missing),
            "unexpected error: {err:?}"
        );
    }
}
