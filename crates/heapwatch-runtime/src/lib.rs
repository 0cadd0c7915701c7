//! Heapwatch Runtime Library
//!
//! Provides the C ABI used by compiled code and interop stubs:
//! - Write barrier entry points
//! - Byref and pinned object validation
//! - Collector hooks for bounds and card maintenance
//! - Runtime initialization

mod ffi;

pub use ffi::*;
