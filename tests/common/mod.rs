//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use camgraph::pipeline::{PipelineBridge, RequestId, RequestResult};
use std::time::Duration;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Generous bound for requests driven by worker threads.
pub fn worker_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Completion of `request`, failing the test if it never arrives.
pub fn expect_result(bridge: &PipelineBridge, request: RequestId) -> RequestResult {
    bridge
        .wait_for_request(request, test_timeout())
        .unwrap_or_else(|| panic!("request {} did not complete", request))
}
