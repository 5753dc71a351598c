//! CLI command implementations.
//!
//! # Command Modules
//!
//! - [`simulate`] - Thundering-herd simulation against the coalescer

pub mod simulate;
