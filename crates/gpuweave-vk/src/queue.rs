use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::command::CommandRecorder;
use crate::driver::{Driver, DriverResult, QueueFamilyInfo, QueueSubmission};
use crate::error::{DriverCall, GpuError, Result};
use crate::submit::{SubmitDependency, WaitPoint};

/// A hardware queue. Submissions to one queue are serialized.
pub struct Queue {
    driver: Arc<dyn Driver>,
    family: u32,
    index: u32,
    flags: vk::QueueFlags,
    handle: vk::Queue,
    submit_lock: Mutex<()>,
}

impl Queue {
    pub(crate) fn new(driver: Arc<dyn Driver>, family: &QueueFamilyInfo, index: u32) -> Self {
        let handle = driver.get_queue(family.index, index);
        debug!(family = family.index, index, flags = ?family.flags, "queue ready");
        Self {
            driver,
            family: family.index,
            index,
            flags: family.flags,
            handle,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn flags(&self) -> vk::QueueFlags {
        self.flags
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    /// Submit a recorded command buffer.
    ///
    /// Ends recording, collects a wait from every dependency, optionally
    /// signals the recorder's persistent semaphore at `signal_stage`, re-arms
    /// the recorder's fence and submits. Each dependency is then told the
    /// submission happened; every hook runs even if an earlier one fails, and
    /// the first failure is returned. Returns the produced wait point when a
    /// signal stage was given.
    pub fn submit(
        &self,
        recorder: &mut CommandRecorder,
        dependencies: &[&dyn SubmitDependency],
        signal_stage: Option<vk::PipelineStageFlags>,
    ) -> Result<Option<WaitPoint>> {
        if recorder.family() != self.family {
            return Err(GpuError::Configuration(format!(
                "recorder for family {} submitted to a family {} queue",
                recorder.family(),
                self.family
            )));
        }

        let _guard = self.submit_lock.lock();
        recorder.end()?;

        let mut wait_semaphores = Vec::with_capacity(dependencies.len());
        let mut wait_stages = Vec::with_capacity(dependencies.len());
        let mut signal_semaphores = Vec::new();
        let produced = match self.collect(
            recorder,
            dependencies,
            signal_stage,
            &mut wait_semaphores,
            &mut wait_stages,
            &mut signal_semaphores,
        ) {
            Ok(produced) => produced,
            Err(e) => {
                recorder.mark_failed();
                return Err(e);
            }
        };

        let command_buffers = [recorder.command_buffer()];
        let submission = QueueSubmission {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &signal_semaphores,
        };
        let result = self
            .driver
            .reset_fence(recorder.fence())
            .call("vkResetFences")
            .and_then(|()| {
                self.driver
                    .queue_submit(self.handle, &submission, recorder.fence())
                    .call("vkQueueSubmit")
            });
        if let Err(e) = result {
            recorder.mark_failed();
            return Err(e);
        }
        recorder.mark_submitted();
        debug!(
            family = self.family,
            index = self.index,
            waits = wait_semaphores.len(),
            signals = signal_semaphores.len(),
            "submitted"
        );

        let mut first_error = None;
        for dependency in dependencies {
            if let Err(e) = dependency.submitted(self) {
                warn!(error = %e, "post-submit hook failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(produced),
        }
    }

    fn collect(
        &self,
        recorder: &mut CommandRecorder,
        dependencies: &[&dyn SubmitDependency],
        signal_stage: Option<vk::PipelineStageFlags>,
        wait_semaphores: &mut Vec<vk::Semaphore>,
        wait_stages: &mut Vec<vk::PipelineStageFlags>,
        signal_semaphores: &mut Vec<vk::Semaphore>,
    ) -> Result<Option<WaitPoint>> {
        for dependency in dependencies {
            let prepared = dependency.prepare(self)?;
            if let Some(wait) = prepared.wait {
                wait_semaphores.push(wait.semaphore);
                wait_stages.push(wait.stage);
            }
            if let Some(signal) = prepared.signal {
                signal_semaphores.push(signal);
            }
        }
        match signal_stage {
            Some(stage) => {
                let semaphore = recorder.signal_semaphore()?;
                signal_semaphores.push(semaphore);
                Ok(Some(WaitPoint { semaphore, stage }))
            }
            None => Ok(None),
        }
    }

    /// Present on this queue. Only called from `SubmitDependency::submitted`,
    /// where the submit lock is already held.
    pub(crate) fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> DriverResult<bool> {
        self.driver
            .queue_present(self.handle, swapchain, image_index, wait)
    }

    pub fn wait_idle(&self) -> Result<()> {
        let _guard = self.submit_lock.lock();
        self.driver
            .queue_wait_idle(self.handle)
            .call("vkQueueWaitIdle")
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("family", &self.family)
            .field("index", &self.index)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Index of the queue to use for `flags`: queues with exactly these flags
/// win over queues with a superset, and `priority` skips that many
/// candidates, wrapping around.
pub fn select_queue_index(
    queues: &[vk::QueueFlags],
    flags: vk::QueueFlags,
    priority: u32,
) -> Option<usize> {
    let exact: Vec<usize> = (0..queues.len()).filter(|&i| queues[i] == flags).collect();
    let candidates = if exact.is_empty() {
        (0..queues.len())
            .filter(|&i| queues[i].contains(flags))
            .collect()
    } else {
        exact
    };
    if candidates.is_empty() {
        None
    } else {
        Some(candidates[priority as usize % candidates.len()])
    }
}
