// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for testrelay.
//!
//! The configuration is built up in layers: the built-in defaults come first, then the project's
//! `.config/testrelay.toml` (or a file passed in explicitly) is merged on top of them.

mod relay_config;
mod retry_policy;
#[cfg(test)]
mod test_helpers;

pub use relay_config::*;
pub use retry_policy::*;
