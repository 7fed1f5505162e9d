// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Stable, documented values shared between `testrelay` and the tools that
//! invoke it.

mod exit_codes;

pub use exit_codes::*;
