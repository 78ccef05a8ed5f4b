//! mux-core: the `llmux` command-line front end.
//!
//! Exposed as a library for testing.

pub mod attachment;
pub mod batch;
pub mod config;
pub mod select;
