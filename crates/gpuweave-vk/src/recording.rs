//! A software [`Driver`] that logs every call and simulates execution.
//!
//! Nothing runs on submit. Pending batches execute when the host blocks on
//! them (`wait_for_fence`, `*_wait_idle`) or when the caller drives the
//! simulation with [`RecordingDriver::step`] / [`RecordingDriver::complete_all`].
//! A batch starts only after every semaphore it waits on has been signalled,
//! and batches on one queue start in submission order. Host-visible memory is
//! backed by real heap allocations and `CopyBuffer` moves bytes, so data
//! round-trips can be checked end to end.

use std::collections::{HashMap, HashSet, VecDeque};

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::driver::{
    DescriptorWrite, Driver, DriverResult, LayoutBinding, QueueFamilyInfo, QueueSubmission,
    SwapchainRequest,
};
use crate::recorded::RecordedCommand;
use crate::resource::{ImageDescription, ImageRange};

const DEFAULT_BUFFER_ALIGNMENT: u64 = 4;
const DEFAULT_IMAGE_ALIGNMENT: u64 = 256;

struct Batch {
    id: u64,
    queue: u64,
    command_buffers: Vec<u64>,
    waits: Vec<u64>,
    signals: Vec<u64>,
    fence: u64,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_batch: u64,
    calls: Vec<String>,
    failures: HashMap<&'static str, vk::Result>,
    live: HashSet<u64>,

    memory: HashMap<u64, Vec<u8>>,
    buffers: HashMap<u64, (u64, vk::BufferUsageFlags)>,
    images: HashMap<u64, ImageDescription>,
    buffer_binding: HashMap<u64, (u64, u64)>,

    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    pool_buffers: HashMap<u64, Vec<u64>>,
    recorded: HashMap<u64, Vec<RecordedCommand>>,

    pending: VecDeque<Batch>,
    executed: Vec<(u64, vk::CommandBuffer)>,
    hung: bool,

    surface_extent: vk::Extent2D,
    swapchains: HashMap<u64, Vec<u64>>,
    acquire_results: VecDeque<vk::Result>,
    present_results: VecDeque<vk::Result>,
    next_image: u32,
    presented: Vec<u32>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        self.next_handle
    }

    fn release(&mut self, raw: u64) {
        self.live.remove(&raw);
    }

    /// Index of the first pending batch that may start now.
    fn runnable(&self) -> Option<usize> {
        let mut blocked_queues = HashSet::new();
        for (i, batch) in self.pending.iter().enumerate() {
            if blocked_queues.contains(&batch.queue) {
                continue;
            }
            let ready = batch
                .waits
                .iter()
                .all(|s| self.semaphores.get(s).copied().unwrap_or(false));
            if ready {
                return Some(i);
            }
            blocked_queues.insert(batch.queue);
        }
        None
    }

    fn run_one(&mut self) -> bool {
        if self.hung {
            return false;
        }
        let Some(i) = self.runnable() else {
            return false;
        };
        let Some(batch) = self.pending.remove(i) else {
            return false;
        };
        for wait in &batch.waits {
            self.semaphores.insert(*wait, false);
        }
        for cmd in &batch.command_buffers {
            let commands = self.recorded.get(cmd).cloned().unwrap_or_default();
            for command in &commands {
                self.execute(command);
            }
            self.executed
                .push((batch.id, vk::CommandBuffer::from_raw(*cmd)));
        }
        for signal in &batch.signals {
            self.semaphores.insert(*signal, true);
        }
        if batch.fence != 0 {
            self.fences.insert(batch.fence, true);
        }
        trace!(batch = batch.id, "simulated batch executed");
        true
    }

    fn run_all(&mut self) {
        while self.run_one() {}
    }

    fn execute(&mut self, command: &RecordedCommand) {
        if let RecordedCommand::CopyBuffer { src, dst, regions } = command {
            let (Some(&(src_mem, src_base)), Some(&(dst_mem, dst_base))) = (
                self.buffer_binding.get(&src.as_raw()),
                self.buffer_binding.get(&dst.as_raw()),
            ) else {
                return;
            };
            for region in regions {
                let from = (src_base + region.src_offset) as usize;
                let to = (dst_base + region.dst_offset) as usize;
                let len = region.size as usize;
                let bytes = match self.memory.get(&src_mem) {
                    Some(mem) if from + len <= mem.len() => mem[from..from + len].to_vec(),
                    _ => continue,
                };
                if let Some(mem) = self.memory.get_mut(&dst_mem) {
                    if to + len <= mem.len() {
                        mem[to..to + len].copy_from_slice(&bytes);
                    }
                }
            }
        }
    }
}

/// Software driver for tests and dry runs.
pub struct RecordingDriver {
    memory_types: Vec<vk::MemoryType>,
    families: Vec<QueueFamilyInfo>,
    buffer_alignment: Mutex<Vec<(vk::BufferUsageFlags, u64)>>,
    state: Mutex<State>,
}

impl RecordingDriver {
    /// One device-local and one host-visible memory type; a general
    /// graphics family with two queues and a compute/transfer family with one.
    pub fn new() -> Self {
        Self::with_layout(
            vec![
                vk::MemoryType {
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                vk::MemoryType {
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
            ],
            vec![
                QueueFamilyInfo {
                    index: 0,
                    flags: vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER,
                    queue_count: 2,
                },
                QueueFamilyInfo {
                    index: 1,
                    flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                    queue_count: 1,
                },
            ],
        )
    }

    pub fn with_layout(memory_types: Vec<vk::MemoryType>, families: Vec<QueueFamilyInfo>) -> Self {
        Self {
            memory_types,
            families,
            buffer_alignment: Mutex::new(Vec::new()),
            state: Mutex::new(State {
                surface_extent: vk::Extent2D {
                    width: 640,
                    height: 480,
                },
                ..State::default()
            }),
        }
    }

    /// Buffers whose usage intersects `usage` report `alignment`.
    pub fn set_buffer_alignment(&self, usage: vk::BufferUsageFlags, alignment: u64) {
        self.buffer_alignment.lock().push((usage, alignment));
    }

    /// Make the next call named `call` (e.g. `"vkAllocateMemory"`) fail.
    pub fn fail_next(&self, call: &'static str, result: vk::Result) {
        self.state.lock().failures.insert(call, result);
    }

    /// While hung no batch executes and fence waits time out.
    pub fn set_hung(&self, hung: bool) {
        self.state.lock().hung = hung;
    }

    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state.lock().surface_extent = vk::Extent2D { width, height };
    }

    /// Queue a result for an upcoming acquire. `SUBOPTIMAL_KHR` acquires
    /// successfully but flags the swapchain; anything else is an error.
    pub fn push_acquire_result(&self, result: vk::Result) {
        self.state.lock().acquire_results.push_back(result);
    }

    pub fn push_present_result(&self, result: vk::Result) {
        self.state.lock().present_results.push_back(result);
    }

    /// Signal a semaphore from the host, standing in for an external producer.
    pub fn signal_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.insert(semaphore.as_raw(), true);
    }

    /// Execute one runnable batch. Returns false when nothing could start.
    pub fn step(&self) -> bool {
        self.state.lock().run_one()
    }

    /// Execute every batch whose dependencies can be met.
    pub fn complete_all(&self) {
        self.state.lock().run_all();
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Entry point names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// Command buffers in the order their batches executed.
    pub fn executed(&self) -> Vec<vk::CommandBuffer> {
        self.state.lock().executed.iter().map(|(_, cmd)| *cmd).collect()
    }

    /// Operations recorded into `cmd` since it was last begun.
    pub fn recorded(&self, cmd: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .recorded
            .get(&cmd.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    /// Images handed to `vkQueuePresentKHR`, in order.
    pub fn presented(&self) -> Vec<u32> {
        self.state.lock().presented.clone()
    }

    /// Driver objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    fn enter(&self, state: &mut State, call: &'static str) -> DriverResult<()> {
        state.calls.push(call.to_string());
        trace!(call, "driver call");
        match state.failures.remove(call) {
            Some(result) => Err(result),
            None => Ok(()),
        }
    }

    fn log(&self, state: &mut State, call: &'static str) {
        state.calls.push(call.to_string());
        trace!(call, "driver call");
    }

    fn create<T: Handle>(&self, call: &'static str) -> DriverResult<T> {
        let mut state = self.state.lock();
        self.enter(&mut state, call)?;
        Ok(T::from_raw(state.handle()))
    }

    fn destroy<T: Handle>(&self, call: &'static str, handle: T) {
        let mut state = self.state.lock();
        self.log(&mut state, call);
        state.release(handle.as_raw());
    }

    fn alignment_for(&self, usage: vk::BufferUsageFlags) -> u64 {
        self.buffer_alignment
            .lock()
            .iter()
            .find(|(flags, _)| flags.intersects(usage))
            .map_or(DEFAULT_BUFFER_ALIGNMENT, |(_, alignment)| *alignment)
    }

    fn all_types(&self) -> u32 {
        match self.memory_types.len() {
            0 => 0,
            n if n >= 32 => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for RecordingDriver {
    fn memory_types(&self) -> Vec<vk::MemoryType> {
        self.memory_types.clone()
    }

    fn queue_families(&self) -> Vec<QueueFamilyInfo> {
        self.families.clone()
    }

    fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        let mut state = self.state.lock();
        self.log(&mut state, "vkGetDeviceQueue");
        vk::Queue::from_raw(((family as u64 + 1) << 32) | index as u64)
    }

    fn timestamp_period(&self) -> f32 {
        1.0
    }

    // ── Buffer / Image ──────────────────────────────────────

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> DriverResult<vk::Buffer> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkCreateBuffer")?;
        let raw = state.handle();
        state.buffers.insert(raw, (size, usage));
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        self.log(&mut state, "vkDestroyBuffer");
        state.buffers.remove(&buffer.as_raw());
        state.buffer_binding.remove(&buffer.as_raw());
        state.release(buffer.as_raw());
    }

    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let (size, usage) = self
            .state
            .lock()
            .buffers
            .get(&buffer.as_raw())
            .copied()
            .unwrap_or((0, vk::BufferUsageFlags::empty()));
        vk::MemoryRequirements {
            size,
            alignment: self.alignment_for(usage),
            memory_type_bits: self.all_types(),
        }
    }

    fn create_image(
        &self,
        desc: &ImageDescription,
        _usage: vk::ImageUsageFlags,
    ) -> DriverResult<vk::Image> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkCreateImage")?;
        let raw = state.handle();
        state.images.insert(raw, *desc);
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        self.log(&mut state, "vkDestroyImage");
        state.images.remove(&image.as_raw());
        state.release(image.as_raw());
    }

    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self
            .state
            .lock()
            .images
            .get(&image.as_raw())
            .and_then(|desc| desc.byte_size().ok())
            .unwrap_or(0);
        vk::MemoryRequirements {
            size,
            alignment: DEFAULT_IMAGE_ALIGNMENT,
            memory_type_bits: self.all_types(),
        }
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _desc: &ImageDescription,
        _range: &ImageRange,
        _view_type: vk::ImageViewType,
        _aspect: vk::ImageAspectFlags,
    ) -> DriverResult<vk::ImageView> {
        self.create("vkCreateImageView")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.destroy("vkDestroyImageView", view);
    }

    fn create_sampler(&self, _address_mode: vk::SamplerAddressMode) -> DriverResult<vk::Sampler> {
        self.create("vkCreateSampler")
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.destroy("vkDestroySampler", sampler);
    }

    // ── Memory ──────────────────────────────────────────────

    fn allocate_memory(&self, size: u64, _memory_type: u32) -> DriverResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkAllocateMemory")?;
        let raw = state.handle();
        state.memory.insert(raw, vec![0; size as usize]);
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        self.log(&mut state, "vkFreeMemory");
        state.memory.remove(&memory.as_raw());
        state.release(memory.as_raw());
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> DriverResult<*mut u8> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkMapMemory")?;
        match state.memory.get_mut(&memory.as_raw()) {
            Some(bytes) if bytes.len() as u64 >= size => Ok(bytes.as_mut_ptr()),
            _ => Err(vk::Result::ERROR_MEMORY_MAP_FAILED),
        }
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        self.log(&mut state, "vkUnmapMemory");
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkBindBufferMemory")?;
        state
            .buffer_binding
            .insert(buffer.as_raw(), (memory.as_raw(), offset));
        Ok(())
    }

    fn bind_image_memory(
        &self,
        _image: vk::Image,
        _memory: vk::DeviceMemory,
        _offset: u64,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkBindImageMemory")
    }

    // ── Fence / Semaphore ───────────────────────────────────

    fn create_fence(&self, signaled: bool) -> DriverResult<vk::Fence> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkCreateFence")?;
        let raw = state.handle();
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        self.log(&mut state, "vkDestroyFence");
        state.fences.remove(&fence.as_raw());
        state.release(fence.as_raw());
    }

    fn reset_fence(&self, fence: vk::Fence) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkResetFences")?;
        state.fences.insert(fence.as_raw(), false);
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkWaitForFences")?;
        let raw = fence.as_raw();
        while !state.fences.get(&raw).copied().unwrap_or(false) {
            if !state.run_one() {
                return Err(vk::Result::TIMEOUT);
            }
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> DriverResult<bool> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkGetFenceStatus")?;
        Ok(state.fences.get(&fence.as_raw()).copied().unwrap_or(false))
    }

    fn create_semaphore(&self) -> DriverResult<vk::Semaphore> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkCreateSemaphore")?;
        let raw = state.handle();
        state.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        self.log(&mut state, "vkDestroySemaphore");
        state.semaphores.remove(&semaphore.as_raw());
        state.release(semaphore.as_raw());
    }

    // ── Command recording ───────────────────────────────────

    fn create_command_pool(
        &self,
        _family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> DriverResult<vk::CommandPool> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkCreateCommandPool")?;
        let raw = state.handle();
        state.pool_buffers.insert(raw, Vec::new());
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        self.log(&mut state, "vkDestroyCommandPool");
        if let Some(buffers) = state.pool_buffers.remove(&pool.as_raw()) {
            for cmd in buffers {
                state.recorded.remove(&cmd);
                state.release(cmd);
            }
        }
        state.release(pool.as_raw());
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkResetCommandPool")?;
        let buffers = state
            .pool_buffers
            .get(&pool.as_raw())
            .cloned()
            .unwrap_or_default();
        for cmd in buffers {
            state.recorded.insert(cmd, Vec::new());
        }
        Ok(())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> DriverResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkAllocateCommandBuffers")?;
        let raw = state.handle();
        state.pool_buffers.entry(pool.as_raw()).or_default().push(raw);
        state.recorded.insert(raw, Vec::new());
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkBeginCommandBuffer")?;
        state.recorded.insert(cmd.as_raw(), Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkEndCommandBuffer")
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &RecordedCommand) {
        let mut state = self.state.lock();
        state.calls.push(format!("vkCmd{}", command.name()));
        state
            .recorded
            .entry(cmd.as_raw())
            .or_default()
            .push(command.clone());
    }

    // ── Queue ───────────────────────────────────────────────

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &QueueSubmission<'_>,
        fence: vk::Fence,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkQueueSubmit")?;
        let signals = submission.signal_semaphores;
        if (1..signals.len()).any(|i| signals[..i].contains(&signals[i])) {
            warn!("batch signals the same semaphore twice");
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        state.next_batch += 1;
        let batch = Batch {
            id: state.next_batch,
            queue: queue.as_raw(),
            command_buffers: submission.command_buffers.iter().map(|c| c.as_raw()).collect(),
            waits: submission.wait_semaphores.iter().map(|s| s.as_raw()).collect(),
            signals: submission.signal_semaphores.iter().map(|s| s.as_raw()).collect(),
            fence: fence.as_raw(),
        };
        state.pending.push_back(batch);
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkQueueWaitIdle")?;
        state.run_all();
        if state.pending.iter().any(|b| b.queue == queue.as_raw()) {
            return Err(vk::Result::TIMEOUT);
        }
        Ok(())
    }

    fn device_wait_idle(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkDeviceWaitIdle")?;
        state.run_all();
        Ok(())
    }

    // ── Descriptors ─────────────────────────────────────────

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[LayoutBinding],
        _update_after_bind: bool,
    ) -> DriverResult<vk::DescriptorSetLayout> {
        self.create("vkCreateDescriptorSetLayout")
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.destroy("vkDestroyDescriptorSetLayout", layout);
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
        _update_after_bind: bool,
    ) -> DriverResult<vk::DescriptorPool> {
        self.create("vkCreateDescriptorPool")
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.destroy("vkDestroyDescriptorPool", pool);
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> DriverResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkAllocateDescriptorSets")?;
        // Sets are freed with their pool.
        state.next_handle += 1;
        Ok(vk::DescriptorSet::from_raw(state.next_handle))
    }

    fn update_descriptor_set(&self, _write: &DescriptorWrite) {
        let mut state = self.state.lock();
        self.log(&mut state, "vkUpdateDescriptorSets");
    }

    // ── Queries / Shaders ───────────────────────────────────

    fn create_timestamp_pool(&self, _count: u32) -> DriverResult<vk::QueryPool> {
        self.create("vkCreateQueryPool")
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.destroy("vkDestroyQueryPool", pool);
    }

    fn query_results(&self, _pool: vk::QueryPool, count: u32) -> DriverResult<Vec<u64>> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkGetQueryPoolResults")?;
        Ok((0..count as u64).map(|i| i * 1000).collect())
    }

    fn create_shader_module(&self, _code: &[u32]) -> DriverResult<vk::ShaderModule> {
        self.create("vkCreateShaderModule")
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.destroy("vkDestroyShaderModule", module);
    }

    // ── Surface / Swapchain ─────────────────────────────────

    fn surface_capabilities(
        &self,
        _surface: vk::SurfaceKHR,
    ) -> DriverResult<vk::SurfaceCapabilitiesKHR> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: state.surface_extent,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        })
    }

    fn surface_formats(&self, _surface: vk::SurfaceKHR) -> DriverResult<Vec<vk::SurfaceFormatKHR>> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        Ok(vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }])
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> DriverResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkCreateSwapchainKHR")?;
        let raw = state.handle();
        let images: Vec<u64> = (0..request.min_image_count)
            .map(|_| {
                state.next_handle += 1;
                state.next_handle
            })
            .collect();
        state.swapchains.insert(raw, images);
        state.next_image = 0;
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        self.log(&mut state, "vkDestroySwapchainKHR");
        state.swapchains.remove(&swapchain.as_raw());
        state.release(swapchain.as_raw());
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> DriverResult<Vec<vk::Image>> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkGetSwapchainImagesKHR")?;
        state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|images| images.iter().map(|raw| vk::Image::from_raw(*raw)).collect())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> DriverResult<(u32, bool)> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkAcquireNextImageKHR")?;
        let suboptimal = match state.acquire_results.pop_front() {
            None | Some(vk::Result::SUCCESS) => false,
            Some(vk::Result::SUBOPTIMAL_KHR) => true,
            Some(error) => return Err(error),
        };
        let count = state
            .swapchains
            .get(&swapchain.as_raw())
            .map_or(0, |images| images.len() as u32);
        if count == 0 {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        let index = state.next_image % count;
        state.next_image = index + 1;
        state.semaphores.insert(semaphore.as_raw(), true);
        Ok((index, suboptimal))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> DriverResult<bool> {
        let mut state = self.state.lock();
        self.enter(&mut state, "vkQueuePresentKHR")?;
        // The presentation engine waits for the rendering batch. A wait
        // nothing will ever signal hangs a real device.
        while !state.semaphores.get(&wait.as_raw()).copied().unwrap_or(false) {
            if !state.run_one() {
                warn!(?wait, "present waits on a semaphore that is never signalled");
                return Err(vk::Result::ERROR_DEVICE_LOST);
            }
        }
        state.semaphores.insert(wait.as_raw(), false);
        state.presented.push(image_index);
        match state.present_results.pop_front() {
            None | Some(vk::Result::SUCCESS) => Ok(false),
            Some(vk::Result::SUBOPTIMAL_KHR) => Ok(true),
            Some(error) => Err(error),
        }
    }
}
