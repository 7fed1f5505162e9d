// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for testrelay-runner: dispatch over real loopback connections, and full
//! launches against real child processes.

mod dispatch;
mod fixtures;
mod launch;
