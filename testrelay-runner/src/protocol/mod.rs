// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The report protocol spoken by the external process.
//!
//! Each message is a frame: a 4-byte little-endian length followed by a CBOR payload. The payload
//! is a map with a `type` discriminator, decoded into an [`Event`]. After every frame it receives,
//! the bridge replies with a [`confirmation`] frame, and the remote side waits for that reply
//! before sending its next message.

mod events;
mod frame;

pub use events::*;
pub use frame::*;
