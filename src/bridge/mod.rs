//! Outer surfaces over the engine.
//!
//! - [`ffi`]: C ABI entry points for host applications
//! - [`streaming`]: tokio channel / `Stream` adapter for Rust callers

pub mod ffi;
pub mod streaming;
