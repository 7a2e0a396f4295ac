//! Integration test crate for the mpENC protocol engine.
//!
//! This crate has no library code — it only contains integration tests
//! that exercise end-to-end protocol flows across multiple workspace
//! crates, simulating a broadcast channel between participants.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p mpenc-integration-tests
//! ```
