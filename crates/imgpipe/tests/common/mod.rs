//! Shared test utilities for imgpipe integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs against an in-process broker
//! - Fake transforms with controllable timing and failure

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::*;
