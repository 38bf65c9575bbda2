#![deny(unsafe_code)]

//! Shared test utilities for the Parley workspace.
//!
//! Provides scripted provider adapters, a recording conversation store
//! with fault injection, and config builders so that individual crate
//! tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! parley-test-utils = { workspace = true }
//! ```

pub mod adapters;
pub mod config;
pub mod store;

pub use adapters::{ScriptedAdapter, StreamScript};
pub use config::TestConfigBuilder;
pub use store::{RecordingStore, StaticCredentials};
