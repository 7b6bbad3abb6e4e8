//! Testing utilities for stratus clients.
//!
//! This module provides:
//! - A scripted in-memory connector
//! - A handler that records its callbacks

mod mocks;

pub use mocks::{
    HandlerEvent, MockConnector, MockResponse, MockStats, RecordedRequest, RecordingHandler,
};
