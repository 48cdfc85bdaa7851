//! Acceptance tests for the process-data exchange.
//!
//! These tests verify the coordinator end to end against the simulated
//! bus master:
//! - Startup, periodic exchange and teardown on a real task thread
//! - Deadline gate decisions seen by driver callbacks
//! - Configuration files
//!
//! Real-time scheduling is left disabled, so no privileges are needed.

mod common;
mod config_test;
mod gate_test;
mod lifecycle_test;
