//! Drift integration tests and workspace root
//!
//! This crate serves as the root of the drift workspace and contains
//! integration tests that test interactions between multiple crates.

// Re-export major components for integration testing
pub use drift_store as store;
pub use drift_sync as sync;
