//! cage client library.
//!
//! The pieces of the launch-orchestration client: manifest model, mount and
//! volume provisioning, the engine RPC transport, and the interactive tty
//! session. The `cage` binary wires them together.

pub mod config;
pub mod dataset;
pub mod engine;
pub mod fsutil;
pub mod launch;
pub mod manifest;
pub mod provision;
pub mod tty;
