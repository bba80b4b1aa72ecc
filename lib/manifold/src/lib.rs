//! Transport-agnostic RPC substrate: framed binary buffers, a typed value
//! codec, and a logical-channel multiplexer sharing one underlying pipe.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod message;
pub mod mux;
pub mod pipe;
pub mod support;
pub mod value;
