// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test helpers for configuration.

use crate::config::RelayConfig;
use camino_tempfile::Utf8TempDir;

/// Writes `config_contents` to the default config location under `project_dir`.
pub(in crate::config) fn write_config(project_dir: &Utf8TempDir, config_contents: &str) {
    let config_path = project_dir.path().join(RelayConfig::CONFIG_PATH);
    let parent = config_path.parent().expect("config path has a parent");
    fs_err::create_dir_all(parent).expect("error creating config directory");
    fs_err::write(&config_path, config_contents).expect("error writing config file");
}
