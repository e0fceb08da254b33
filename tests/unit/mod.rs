// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the PostgreSQL cluster operator
//!
//! This module contains unit tests for:
//! - Resource generation per operator version
//! - Comparison of desired and live objects
//! - Cluster reconciliation against an in-memory API server
//! - Restart planning, ordering, resume and retry
//! - Status management and validation

#[path = "../common/mod.rs"]
mod common;

mod comparator;
mod dbops;
mod reconciler;
mod validation;
