// Every export takes raw pointers from C callers; the safety contract is the
// C malloc contract, documented once per function.
#![allow(clippy::missing_safety_doc)]
//! # tinyheap-abi
//!
//! `extern "C"` boundary for tinyheap. Produces a `cdylib` exposing the
//! malloc family under `tinyheap_*` symbols, all routed through one
//! process-wide [`MemoryManager`](tinyheap_core::MemoryManager).
//!
//! ```text
//! C caller -> ABI entry (this crate) -> MemoryManager -> heap
//! ```
//!
//! The core hands out addresses only. This crate is where memory is actually
//! touched: zeroing for `calloc`/`zalloc` and copying for `realloc`.

pub mod malloc_abi;
mod runtime;

pub use runtime::{InitStatus, TinyheapRegion, install, manager};
