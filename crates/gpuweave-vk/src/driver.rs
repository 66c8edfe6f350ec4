//! The seam between the orchestration layer and the graphics driver.
//!
//! Every object the engine creates goes through [`Driver`]. The production
//! implementation is [`AshDriver`](crate::AshDriver); [`RecordingDriver`](crate::RecordingDriver)
//! is a software stand-in that logs calls and simulates queue execution.
//! Fallible calls return the driver's raw result code; callers attach context.

use ash::vk;

use crate::recorded::RecordedCommand;
use crate::resource::{ImageDescription, ImageRange};

pub type DriverResult<T> = Result<T, vk::Result>;

/// A queue family as exposed by the opened device.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: vk::QueueFlags,
    /// Number of queues the device was created with in this family.
    pub queue_count: u32,
}

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy)]
pub struct LayoutBinding {
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub flags: vk::DescriptorBindingFlags,
}

#[derive(Debug, Clone, Copy)]
pub enum DescriptorInfo {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub info: DescriptorInfo,
}

/// A single batch handed to `vkQueueSubmit`.
#[derive(Debug, Clone, Copy)]
pub struct QueueSubmission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub usage: vk::ImageUsageFlags,
    pub old_swapchain: vk::SwapchainKHR,
}

pub trait Driver: Send + Sync {
    // ── Device properties ───────────────────────────────────
    fn memory_types(&self) -> Vec<vk::MemoryType>;
    fn queue_families(&self) -> Vec<QueueFamilyInfo>;
    fn get_queue(&self, family: u32, index: u32) -> vk::Queue;
    /// Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f32;

    // ── Buffer / Image ──────────────────────────────────────
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> DriverResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn create_image(
        &self,
        desc: &ImageDescription,
        usage: vk::ImageUsageFlags,
    ) -> DriverResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn create_image_view(
        &self,
        image: vk::Image,
        desc: &ImageDescription,
        range: &ImageRange,
        view_type: vk::ImageViewType,
        aspect: vk::ImageAspectFlags,
    ) -> DriverResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, address_mode: vk::SamplerAddressMode) -> DriverResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // ── Memory ──────────────────────────────────────────────
    fn allocate_memory(&self, size: u64, memory_type: u32) -> DriverResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    /// Map the whole allocation. The pointer stays valid until `unmap_memory`.
    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> DriverResult<*mut u8>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> DriverResult<()>;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> DriverResult<()>;

    // ── Fence / Semaphore ───────────────────────────────────
    fn create_fence(&self, signaled: bool) -> DriverResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> DriverResult<()>;
    /// Blocks until signalled; `Err(TIMEOUT)` when the bound expires.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> DriverResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> DriverResult<bool>;
    fn create_semaphore(&self) -> DriverResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // ── Command recording ───────────────────────────────────
    fn create_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> DriverResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> DriverResult<()>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> DriverResult<vk::CommandBuffer>;
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> DriverResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> DriverResult<()>;
    fn record(&self, cmd: vk::CommandBuffer, command: &RecordedCommand);

    // ── Queue ───────────────────────────────────────────────
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &QueueSubmission<'_>,
        fence: vk::Fence,
    ) -> DriverResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()>;
    fn device_wait_idle(&self) -> DriverResult<()>;

    // ── Descriptors ─────────────────────────────────────────
    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
        update_after_bind: bool,
    ) -> DriverResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
        update_after_bind: bool,
    ) -> DriverResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> DriverResult<vk::DescriptorSet>;
    fn update_descriptor_set(&self, write: &DescriptorWrite);

    // ── Queries / Shaders ───────────────────────────────────
    fn create_timestamp_pool(&self, count: u32) -> DriverResult<vk::QueryPool>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);
    fn query_results(&self, pool: vk::QueryPool, count: u32) -> DriverResult<Vec<u64>>;
    fn create_shader_module(&self, code: &[u32]) -> DriverResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    // ── Surface / Swapchain ─────────────────────────────────
    fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> DriverResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self, surface: vk::SurfaceKHR) -> DriverResult<Vec<vk::SurfaceFormatKHR>>;
    fn create_swapchain(&self, request: &SwapchainRequest) -> DriverResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> DriverResult<Vec<vk::Image>>;
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> DriverResult<(u32, bool)>;
    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> DriverResult<bool>;
}
