//! Scenario tests for the executor and the provisioning suite.
//!
//! ## Test Organization
//!
//! - `common`: Shared context, errors, steps and programs
//! - `basic`: Success paths
//! - `failure`: Step failures and panics
//! - `teardown`: Sub-tests and teardown outcomes
//! - `cancellation`: Cancellation tokens and run deadlines
//! - `provision`: The provisioning suite against the in-memory lab
//!
//! ## Test Programs
//!
//! The executor tests use a "rig" domain:
//! - `Acquire`: Claims a named resource and registers its release
//! - `Explode`: Panics
//! - `Stall`: Never finishes
//! - `Check`: Sub-test that passes or fails on demand
//!
//! Every step, sub-test and release appends to `RigContext::events`, so the
//! tests can assert on the exact interleaving.

mod common;

mod failure;
mod teardown;
