//! # chatsync testkit
//!
//! Test utilities for chatsync.
//!
//! This crate provides:
//! - An in-process transport wired to the reference server
//! - A synchronous harness with virtual time and delivery faults
//! - Fixture servers and engine configurations
//! - Property-based test generators using proptest
//! - Scripted JSON scenarios with serializable reports
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chatsync_testkit::prelude::*;
//!
//! #[test]
//! fn converges_after_a_lost_push() {
//!     let mut harness = standard_harness();
//!     harness.server().post_message(contact_peer(0), contact(0), "hi", None).unwrap();
//!     harness.drop_pushes(1);
//!     harness.settle();
//!     assert!(harness.divergence().is_empty());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;
pub mod loopback;
pub mod scenario;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use crate::loopback::*;
    pub use crate::scenario::*;
}

pub use harness::{apply_faults, Fault, Harness};
pub use loopback::{to_sync_error, LoopbackTransport};
pub use scenario::{Report, Scenario, ScenarioError, ScenarioResult, Step};
