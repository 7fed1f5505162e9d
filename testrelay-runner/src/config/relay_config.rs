// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::RetryPolicy;
use crate::errors::{ConfigParseError, ConfigParseErrorKind};
use bytesize::ByteSize;
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{collections::BTreeSet, time::Duration};
use tracing::warn;

/// Trait for handling configuration warnings.
///
/// This trait allows for different warning handling strategies, such as logging warnings
/// (the default behavior) or collecting them for testing purposes.
pub trait ConfigWarnings {
    /// Handle unknown configuration keys found in a config file.
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        project_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    );
}

/// Default implementation of [`ConfigWarnings`] that logs warnings using the tracing crate.
pub struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(
        &mut self,
        config_file: &Utf8Path,
        project_root: &Utf8Path,
        unknown: &BTreeSet<String>,
    ) {
        let mut unknown_str = String::new();
        if unknown.len() == 1 {
            // Print this on the same line.
            unknown_str.push_str("key: ");
            unknown_str.extend(unknown.iter().map(String::as_str));
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push('\n');
                unknown_str.push_str("  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!(
            "in config file {}, ignoring unknown configuration {unknown_str}",
            config_file
                .strip_prefix(project_root)
                .unwrap_or(config_file),
        )
    }
}

/// Overall configuration for testrelay.
///
/// This is the root data structure for testrelay configuration. Most runs will read it from
/// `.config/testrelay.toml` under the project root, layered over the built-in defaults.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    project_root: Utf8PathBuf,
    inner: RelayConfigImpl,
}

impl RelayConfig {
    /// The default location of the config within the project root: `.config/testrelay.toml`.
    pub const CONFIG_PATH: &'static str = ".config/testrelay.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Reads the testrelay config from the given file, or if not specified from
    /// `.config/testrelay.toml` in the project root.
    ///
    /// If the file isn't specified and the project root doesn't have `.config/testrelay.toml`, the
    /// default config is used.
    pub fn from_sources(
        project_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        Self::from_sources_with_warnings(project_root, config_file, &mut DefaultConfigWarnings)
    }

    /// Like [`Self::from_sources`], but with a custom warnings handler.
    pub fn from_sources_with_warnings(
        project_root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let project_root = project_root.into();

        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = project_root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (inner, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;

        if !unknown.is_empty() {
            warnings.unknown_config_keys(&config_file, &project_root, &unknown);
        }

        Ok(Self {
            project_root,
            inner,
        })
    }

    /// Returns the default testrelay config.
    pub fn default_config(project_root: impl Into<Utf8PathBuf>) -> Self {
        let (inner, unknown) = Self::build_and_deserialize_config(&Self::make_default_config())
            .unwrap_or_else(|err| panic!("default config is always valid: {err}"));
        debug_assert!(unknown.is_empty(), "default config has no unknown keys");

        Self {
            project_root: project_root.into(),
            inner,
        }
    }

    /// Returns the project root this config was read relative to.
    pub fn project_root(&self) -> &Utf8Path {
        &self.project_root
    }

    /// Returns the `[process]` section.
    pub fn process(&self) -> &ProcessConfig {
        &self.inner.process
    }

    /// Returns the `[server]` section.
    pub fn server(&self) -> &ServerConfig {
        &self.inner.server
    }

    /// Returns the `[tracker]` section.
    pub fn tracker(&self) -> &TrackerConfig {
        &self.inner.tracker
    }

    /// Returns the `[discovery]` section.
    pub fn discovery(&self) -> &DiscoveryConfig {
        &self.inner.discovery
    }

    /// Returns the absolute journal directory.
    pub fn journal_dir(&self) -> Utf8PathBuf {
        self.project_root.join(&self.inner.tracker.journal_dir)
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(RelayConfigImpl, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: RelayConfigImpl = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // Both serde_path_to_error and the config crate report the key. Drop the key
                // from the config error for consistency.
                let path = error.path().clone();
                let config_error = error.into_inner();
                let error = match config_error {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RelayConfigImpl {
    process: ProcessConfig,
    server: ServerConfig,
    tracker: TrackerConfig,
    discovery: DiscoveryConfig,
}

/// The `[process]` section: how the test execution process is started.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessConfig {
    program: String,
    args: Vec<String>,
    success_exit_codes: Vec<i32>,
}

impl ProcessConfig {
    /// The program to run.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The argument templates, before placeholder substitution.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Exit codes that count as a completed launch.
    pub fn success_exit_codes(&self) -> &[i32] {
        &self.success_exit_codes
    }
}

/// The `[server]` section: the report server the process connects to.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    host: String,
    #[serde(with = "humantime_serde")]
    accept_timeout: Duration,
    max_frame_size: ByteSize,
}

impl ServerConfig {
    /// The loopback host to bind to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// How long to wait for the report connection after the process exits.
    pub fn accept_timeout(&self) -> Duration {
        self.accept_timeout
    }

    /// The largest frame payload accepted, in bytes.
    pub fn max_frame_size(&self) -> u64 {
        self.max_frame_size.as_u64()
    }
}

/// The `[tracker]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrackerConfig {
    retries: RetryPolicy,
    journal_dir: Utf8PathBuf,
}

impl TrackerConfig {
    /// The retry policy for transient tracker failures.
    pub fn retries(&self) -> RetryPolicy {
        self.retries
    }

    /// The journal directory as written in the config, possibly relative.
    pub fn journal_dir(&self) -> &Utf8Path {
        &self.journal_dir
    }
}

/// The `[discovery]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiscoveryConfig {
    extensions: Vec<String>,
}

impl DiscoveryConfig {
    /// File extensions that mark test definition files.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }
}
