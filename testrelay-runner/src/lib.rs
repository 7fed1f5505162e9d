// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for testrelay, a live reporting bridge between a test execution process and
//! a result tracker.
//!
//! The flow of a launch: [`launch`] binds a [`server::ReportServer`] and spawns the process. The
//! process connects and streams length-prefixed CBOR frames ([`protocol`]), which the
//! [`dispatcher`] applies to a [`registry`] of declared tests. Group statuses are derived by
//! [`grouping`] and pushed through the [`tracker`] interface.

pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod errors;
pub mod grouping;
pub mod launch;
mod process;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod tracker;
