//! Stampede - request coalescing for async Rust
//!
//! This library protects expensive downstream work (databases, remote APIs,
//! heavy computations) from cache stampedes: concurrent callers asking for the
//! same key share a single in-flight computation instead of each triggering
//! their own.
//!
//! # High-Level API
//!
//! The [`coalesce`] module provides the coalescer:
//!
//! ```
//! use stampede::coalesce::RequestCoalescer;
//! use stampede::config::CoalescerConfig;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CoalescerConfig::new().with_factory_timeout(Duration::from_secs(30));
//! let coalescer: RequestCoalescer<String, u64, std::io::Error> =
//!     RequestCoalescer::with_config(config);
//!
//! let answer = coalescer
//!     .get_or_run("answer".to_string(), || async { Ok(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(answer, 42);
//! # }
//! ```

pub mod coalesce;
pub mod config;
pub mod error;
pub mod logging;

pub use coalesce::{CoalesceKey, CoalescerStats, RequestCoalescer};
pub use config::CoalescerConfig;
pub use error::{CoalesceError, InvalidArgumentReason};

/// Version of the Stampede library and CLI.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
