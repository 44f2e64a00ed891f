//! Tracing for buffer operations.
//!
//! The crate logs through `tracing` and never installs a subscriber:
//!
//! | Level | Events |
//! |-------|--------|
//! | `debug` | allocate, free, import, send, receive |
//! | `trace` | lock, unlock |
//! | `warn` | sessions dropped without unlock, permitted lock conflicts, unsealed imports |
//!
//! Lock, unlock and transport calls run inside the spans created here.

mod tracing_support;

pub use tracing_support::{span_buffer_op, span_transport, trace_transfer};
