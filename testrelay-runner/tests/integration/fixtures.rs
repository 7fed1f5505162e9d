// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::Result;
use testrelay_runner::{discovery::discover_definition_files, grouping::TestGrouping};

/// A source directory containing definition files.
pub(crate) struct SourceDir {
    pub(crate) dir: Utf8TempDir,
    pub(crate) files: Vec<Utf8PathBuf>,
}

impl SourceDir {
    /// Creates a source directory with one empty definition file per name, and discovers them.
    pub(crate) fn new(names: &[&str]) -> Result<Self> {
        let dir = camino_tempfile::tempdir()?;
        for name in names {
            fs_err::write(dir.path().join(name), "")?;
        }
        let files = discover_definition_files(dir.path(), &["testo".to_owned()])?;
        Ok(Self { dir, files })
    }

    pub(crate) fn grouping(&self) -> TestGrouping {
        TestGrouping::new(self.files.iter().cloned())
    }
}
