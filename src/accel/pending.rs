//! Builds waiting on a GPU fence

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Runs once the fence reaches its value; must not block
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

struct PendingBuild {
    fence_value: u64,
    on_complete: Completion,
}

/// Fence-gated completion callbacks, polled once per frame
#[derive(Default)]
pub struct PendingBuilds {
    builds: Mutex<Vec<PendingBuild>>,
}

impl PendingBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    fn builds(&self) -> MutexGuard<'_, Vec<PendingBuild>> {
        self.builds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, fence_value: u64, on_complete: Completion) {
        self.builds().push(PendingBuild { fence_value, on_complete });
    }

    /// Run every callback whose fence value has been reached
    ///
    /// Callbacks run after the list lock is released.
    pub fn poll(&self, completed_fence: u64) -> usize {
        let ready: Vec<PendingBuild> = {
            let mut builds = self.builds();
            let (ready, waiting) = std::mem::take(&mut *builds)
                .into_iter()
                .partition(|b| b.fence_value <= completed_fence);
            *builds = waiting;
            ready
        };
        let count = ready.len();
        for build in ready {
            (build.on_complete)();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.builds().len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds().is_empty()
    }
}
