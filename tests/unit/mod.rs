// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the replica switch operator
//!
//! This module contains unit tests for:
//! - State machine transitions
//! - Switchover passes against simulated instances
//! - Streaming topology enforcement
//! - Condition reporting and status composition
//! - Validation logic

#[path = "../common/mod.rs"]
mod common;

mod condition;
mod switchover;
mod validation;
