//! Integration test crate for ComputeHive.
//!
//! This crate exists solely to run tests that span the registry, scheduler,
//! market and daemon crates. It has no public API - all functionality is in
//! the test modules.

#![forbid(unsafe_code)]
