// Kestrel Daemon Library
// Exposes the network layer for the binary and the integration tests

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod discovery;
pub mod rlpx;
