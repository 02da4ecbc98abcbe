// #![include_doc("../README.md", start)]
//! # recompute
//!
//! `recompute` is a reactive caching core: computations are memoized by key, invalidated when what they read changes, mirrored to remote clients and consumed by debounced live states.
//!
//! ## Features
//!
//! - Memoized computations keyed by operation, arguments and session
//! - Automatic dependency tracking between computations
//! - Push invalidation with per-key ordered notices
//! - Single-flight: concurrent readers of the same key share one computation
//! - Replicas that refetch lazily after a push invalidation
//! - Live states that recompute after a debounce delay and retry failures
//!
//! ## Example
//!
//! ```rust
//! use recompute::{ComputationKey, ComputationRegistry};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> recompute::Result<()> {
//!     let registry = ComputationRegistry::new();
//!     registry.register("square", None, |_, args| async move {
//!         let x = args.first().and_then(|a| a.as_int()).unwrap_or_default();
//!         Ok(x * x)
//!     });
//!
//!     let key = ComputationKey::new("square").arg(3);
//!     let first = registry.call_cell::<i64>(key.clone()).await?;
//!     assert_eq!(*first.value()?, 9);
//!
//!     registry.invalidate(&key);
//!     assert!(!first.is_valid());
//!
//!     let second = registry.call_cell::<i64>(key).await?;
//!     assert!(second.generation() > first.generation());
//!     Ok(())
//! }
//! ```
//!
//! Computations read other computations through their `ComputeContext`. Invalidating a cell invalidates everything that read it, and subscribers (replica mirrors, live states) are notified.
//!
//! ## Configuration
//!
//! ```json
//! {
//!   "registry": { "keep_alive": "1s", "max_cells": 10000 },
//!   "live_state": { "update_delay": "250ms", "retry_delay": "1s", "is_cancellation_supported": true }
//! }
//! ```
//!
//! Durations accept `ms`, `s` and `m` literals or a plain number of milliseconds.
//!
//! ## License
//!
//! This project is dual licensed under Apache-2.0/MIT.
// #![include_doc("../README.md", end)]
