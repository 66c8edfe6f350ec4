use std::sync::Arc;

use ash::vk;
use gpuweave_core::GpuweaveConfig;
use tracing::{info, warn};

use crate::collab::{ImageDecoder, ShaderCompiler, ShaderStage, SurfaceProvider};
use crate::command::CommandRecorder;
use crate::descriptor::DescriptorLayout;
use crate::driver::{Driver, LayoutBinding};
use crate::error::{DriverCall, GpuError, Result};
use crate::memory::{MemoryArena, Reserve, ResourceId};
use crate::objects::{ImageView, Sampler, ShaderModule, TimestampPool, ViewKind};
use crate::pool::MemoryPool;
use crate::present::PresentationBridge;
use crate::queue::{select_queue_index, Queue};
use crate::resource::{Buffer, Image, ImageDescription, ImageRange};
use crate::submit::{SubmitDependency, WaitPoint};
use crate::validation::ValidationCollector;

/// An opened logical device: its queues, memory types and configuration.
///
/// Every GPU object is created through the device. Objects hold their own
/// reference to the driver, so the driver outlives all of them.
pub struct Device {
    driver: Arc<dyn Driver>,
    memory_types: Arc<[vk::MemoryType]>,
    queues: Vec<Queue>,
    config: GpuweaveConfig,
    validation: ValidationCollector,
}

/// Decoded pixels sitting in a host-visible staging buffer.
pub struct StagedImage {
    pub arena: MemoryArena,
    pub buffer: ResourceId,
    pub description: ImageDescription,
    pub bytes: usize,
}

impl Device {
    pub fn new(
        driver: Arc<dyn Driver>,
        config: GpuweaveConfig,
        validation: ValidationCollector,
    ) -> Result<Self> {
        config.validate()?;
        let memory_types: Arc<[vk::MemoryType]> = driver.memory_types().into();
        let mut queues = Vec::new();
        for family in driver.queue_families() {
            for index in 0..family.queue_count {
                queues.push(Queue::new(driver.clone(), &family, index));
            }
        }
        if queues.is_empty() {
            return Err(GpuError::Configuration(
                "device exposes no queues".to_string(),
            ));
        }
        info!(
            queues = queues.len(),
            memory_types = memory_types.len(),
            "device opened"
        );
        Ok(Self {
            driver,
            memory_types,
            queues,
            config,
            validation,
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn config(&self) -> &GpuweaveConfig {
        &self.config
    }

    pub fn validation(&self) -> &ValidationCollector {
        &self.validation
    }

    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.memory_types
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Pick a queue supporting `flags`; see [`select_queue_index`].
    pub fn select_queue(&self, flags: vk::QueueFlags, priority: u32) -> Result<&Queue> {
        let all: Vec<vk::QueueFlags> = self.queues.iter().map(|q| q.flags()).collect();
        select_queue_index(&all, flags, priority)
            .map(|i| &self.queues[i])
            .ok_or_else(|| {
                GpuError::Configuration(format!("no suitable queue found for {flags:?}"))
            })
    }

    // ── Memory ──────────────────────────────────────────────

    pub fn new_arena(&self) -> MemoryArena {
        MemoryArena::new(self.driver.clone(), self.memory_types.clone())
    }

    pub fn new_memory_pool(&self) -> MemoryPool {
        MemoryPool::new(self.driver.clone(), self.memory_types.clone())
    }

    /// A buffer without memory. `host` asks for host-visible, coherent memory.
    pub fn new_buffer(&self, size: u64, usage: vk::BufferUsageFlags, host: bool) -> Result<Buffer> {
        Buffer::new(self.driver.clone(), size, usage, host)
    }

    pub fn new_image(&self, desc: ImageDescription, usage: vk::ImageUsageFlags) -> Result<Image> {
        Image::new(self.driver.clone(), desc, usage)
    }

    /// Decode an encoded image straight into a new host-visible staging buffer.
    pub fn stage_image(&self, decoder: &dyn ImageDecoder, encoded: &[u8]) -> Result<StagedImage> {
        let description = decoder
            .describe(encoded)
            .map_err(|message| GpuError::Collaborator {
                what: "image decode",
                message,
            })?;
        let size = description.byte_size()?;
        let buffer = self.new_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC, true)?;
        let mut arena = self.new_arena();
        let id = match arena.reserve(buffer)? {
            Reserve::Accepted(id) => id,
            Reserve::Rejected(_) => {
                return Err(GpuError::ResourceState(
                    "fresh arena rejected staging buffer".to_string(),
                ))
            }
        };
        arena.allocate()?;
        let bytes = decoder
            .decode(encoded, arena.slice_mut(id)?)
            .map_err(|message| GpuError::Collaborator {
                what: "image decode",
                message,
            })?;
        Ok(StagedImage {
            arena,
            buffer: id,
            description,
            bytes,
        })
    }

    // ── Commands ────────────────────────────────────────────

    /// A recorder on the family of the first queue matching `flags`.
    pub fn new_recorder(&self, flags: vk::QueueFlags, once: bool) -> Result<CommandRecorder> {
        let family = self.select_queue(flags, 0)?.family();
        CommandRecorder::new(
            self.driver.clone(),
            family,
            once,
            self.config.device.fence_timeout_ms,
        )
    }

    /// Submit on a queue of the recorder's family; `priority` skips that
    /// many queues of the family, wrapping around.
    pub fn submit(
        &self,
        recorder: &mut CommandRecorder,
        priority: u32,
        dependencies: &[&dyn SubmitDependency],
        signal_stage: Option<vk::PipelineStageFlags>,
    ) -> Result<Option<WaitPoint>> {
        let family: Vec<&Queue> = self
            .queues
            .iter()
            .filter(|q| q.family() == recorder.family())
            .collect();
        if family.is_empty() {
            return Err(GpuError::Configuration(format!(
                "no queue in family {}",
                recorder.family()
            )));
        }
        let queue = family[priority as usize % family.len()];
        queue.submit(recorder, dependencies, signal_stage)
    }

    // ── Descriptors / samplers / views ──────────────────────

    pub fn new_descriptor_layout(&self, binding: LayoutBinding) -> Result<DescriptorLayout> {
        DescriptorLayout::root(self.driver.clone(), binding)
    }

    pub fn new_sampler(&self, address_mode: vk::SamplerAddressMode) -> Result<Sampler> {
        Sampler::new(self.driver.clone(), address_mode)
    }

    pub fn new_image_view(&self, image: &Image, range: &ImageRange, kind: ViewKind) -> Result<ImageView> {
        ImageView::new(self.driver.clone(), image, range, kind)
    }

    pub fn new_timestamp_pool(&self, count: u32) -> Result<TimestampPool> {
        TimestampPool::new(self.driver.clone(), count)
    }

    pub fn new_shader_module(
        &self,
        compiler: &dyn ShaderCompiler,
        source: &str,
        stage: ShaderStage,
    ) -> Result<ShaderModule> {
        ShaderModule::compile(self.driver.clone(), compiler, source, stage)
    }

    pub fn shader_from_spirv(&self, spirv: &[u32], stage: ShaderStage) -> Result<ShaderModule> {
        ShaderModule::from_spirv(self.driver.clone(), spirv, stage, String::new())
    }

    pub fn new_presentation(&self, provider: Arc<dyn SurfaceProvider>) -> Result<PresentationBridge> {
        PresentationBridge::new(
            self.driver.clone(),
            provider,
            self.validation.clone(),
            self.config.presentation.clone(),
            self.config.device.fence_timeout_ns(),
        )
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.driver.device_wait_idle().call("vkDeviceWaitIdle")
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            warn!(error = %e, "device did not go idle before teardown");
        }
    }
}
