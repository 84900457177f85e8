//! # docsync testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - Store fixtures and replicator helpers
//! - An event recorder for status and per-document events
//! - Fault-injecting connectors and a scripted peer
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes() {
//!     let local = numbered_store("local", "tasks", 10);
//!     let remote = empty_store("remote");
//!     let repl = local_replicator(&local, &remote, push_config(&remote, "tasks"));
//!     let status = run_to_completion(&repl, false).await;
//!     assert!(status.error.is_none());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connectors;
pub mod fixtures;
pub mod generators;
pub mod recorder;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connectors::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::recorder::*;
}

pub use connectors::*;
pub use fixtures::*;
pub use generators::*;
pub use recorder::*;
