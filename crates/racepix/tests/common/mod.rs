//! Shared test utilities for racepix integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs with temp directories and an in-memory database
//! - Test doubles for the worker, object storage and watermarking

pub mod harness;

pub use harness::*;
