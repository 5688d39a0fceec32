//! # Replicant Testkit
//!
//! Testing utilities for Replicant.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a reference schema covering every channel shape, canned
//!   entity messages, recording server hooks and a recording
//!   area-of-interest listener
//! - **Generators**: Proptest strategies for addresses, change sets and filters
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use replicant_testkit::generators::channel_address;
//!
//! proptest! {
//!     #[test]
//!     fn cache_key_is_text_form(address in channel_address()) {
//!         prop_assert_eq!(address.cache_key(), address.to_string());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use replicant_testkit::fixtures::{meta_channel, meta_messages, reference_schema, FixtureHooks};
//!
//! let schema = reference_schema();
//! let hooks = FixtureHooks::new();
//! hooks.set_channel(meta_channel(), meta_messages(3));
//! assert_eq!(schema.name, "reference");
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{reference_schema, AreaOfInterestEvent, FixtureHooks, HookCall, RecordingListener};
pub use generators::{bulk_change_set, change_set, channel_address};
