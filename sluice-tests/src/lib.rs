//! Sluice Tests - Cross-component tests for the shuffle stage.
//!
//! Unit tests live next to the code in each crate. This crate wires real
//! stages to the in-memory transport and checks delivery properties end to
//! end:
//!
//! ## Test Organization
//!
//! - `routing_tests`: key resolution range, determinism, and fallback keys
//! - `cache_tests`: merge ordering and flush exclusivity under contention
//! - `stage_tests`: ingest properties (no loss, system records, window, notifier)
//! - `lifecycle_tests`: reconfigure, unhealthy transitions, drain, retries
//!
//! **Support Modules**:
//! - `properties`: delivery checker run against written envelopes
//! - `scenarios`: stage harness and deterministic workloads
//!
//! ## Naming Conventions
//!
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod properties;
pub mod scenarios;

#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod lifecycle_tests;
