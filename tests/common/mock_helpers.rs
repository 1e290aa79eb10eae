//! Mock construction helpers

use camgraph::pipeline::fence::FenceCallback;
use camgraph::pipeline::{
    FenceHandle, FencePrimitive, FenceResult, FenceStatus, PipelineResult, SoftwareFencePool,
};
use mockall::mock;
use std::sync::{Arc, Mutex};

mock! {
    pub Fences {}

    impl FencePrimitive for Fences {
        fn create(&self, name: &str) -> PipelineResult<FenceHandle>;
        fn register_callback(&self, fence: FenceHandle, callback: FenceCallback) -> PipelineResult<()>;
        fn signal(&self, fence: FenceHandle, result: FenceResult) -> PipelineResult<()>;
        fn status(&self, fence: FenceHandle) -> PipelineResult<FenceStatus>;
        fn release(&self, fence: FenceHandle) -> PipelineResult<()>;
    }
}

/// Every fence handed back to the provider, in release order.
pub type ReleaseLog = Arc<Mutex<Vec<FenceHandle>>>;

/// A mock that forwards every call to `pool` and logs releases.
pub fn recording_fences(pool: &Arc<SoftwareFencePool>, releases: &ReleaseLog) -> MockFences {
    let mut mock = MockFences::new();

    let p = Arc::clone(pool);
    mock.expect_create().returning(move |name| p.create(name));
    let p = Arc::clone(pool);
    mock.expect_register_callback()
        .returning(move |fence, callback| p.register_callback(fence, callback));
    let p = Arc::clone(pool);
    mock.expect_signal()
        .returning(move |fence, result| p.signal(fence, result));
    let p = Arc::clone(pool);
    mock.expect_status().returning(move |fence| p.status(fence));
    let p = Arc::clone(pool);
    let log = Arc::clone(releases);
    mock.expect_release().returning(move |fence| {
        log.lock().unwrap().push(fence);
        p.release(fence)
    });
    mock
}

/// Handles released more than once.
pub fn double_releases(releases: &ReleaseLog) -> Vec<FenceHandle> {
    let mut seen = Vec::new();
    let mut doubled = Vec::new();
    for fence in releases.lock().unwrap().iter() {
        if seen.contains(fence) {
            doubled.push(*fence);
        } else {
            seen.push(*fence);
        }
    }
    doubled
}
