//! Shared test helpers for E2E tests.
//!
//! `helpers/mod.rs` rather than `tests/helpers.rs`: Cargo would compile a
//! top-level file in `tests/` as its own test binary.

pub mod wire_client;
