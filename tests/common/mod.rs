//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A wiremock server standing in for the remote database
//! - Helpers for waiting on replication state

pub mod mock_server;

pub use mock_server::*;
