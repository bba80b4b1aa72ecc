#![allow(clippy::new_without_default)]

/// Identifier correlating an RPC request with its reply.
pub type CallId = u32;

pub mod logging;
