use ash::vk;

use crate::error::Result;
use crate::queue::Queue;

/// A semaphore plus the pipeline stage at which a later submission waits on it.
///
/// Returned by [`Queue::submit`] when a signal stage is requested. The
/// semaphore belongs to the producing recorder and is re-signalled by each of
/// its submissions, so every produced point should be waited on exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPoint {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// What a dependency contributes to a submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prepared {
    pub wait: Option<WaitPoint>,
    /// Extra semaphore the submission must signal on behalf of the dependency.
    pub signal: Option<vk::Semaphore>,
}

/// Something a submission has to be ordered after.
///
/// `prepare` runs before the driver submit with the queue's submit lock
/// held; `submitted` runs right after the driver accepted the batch, still
/// under the lock.
pub trait SubmitDependency {
    fn prepare(&self, queue: &Queue) -> Result<Prepared>;

    fn submitted(&self, _queue: &Queue) -> Result<()> {
        Ok(())
    }
}

impl SubmitDependency for WaitPoint {
    fn prepare(&self, _queue: &Queue) -> Result<Prepared> {
        Ok(Prepared {
            wait: Some(*self),
            signal: None,
        })
    }
}
