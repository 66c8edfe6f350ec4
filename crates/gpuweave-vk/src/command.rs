//! Command recording.
//!
//! A [`CommandRecorder`] owns one command pool with a single primary command
//! buffer, one fence that is created once and re-armed on every submit, and
//! at most one persistent signal semaphore created the first time a
//! submission asks for one. Recording goes
//! `Initial -> Recording -> Submitted -> Complete`, and `begin` recycles a
//! completed recorder back into `Recording`.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use crate::driver::Driver;
use crate::error::{DriverCall, GpuError, Result};
use crate::objects::TimestampPool;
use crate::recorded::{ImageBarrier, RecordedCommand};
use crate::resource::{texel_size, Buffer, Image, ImageRange};

/// Most vertex inputs or descriptor sets a single draw binds.
pub const MAX_BINDINGS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Initial,
    Recording,
    Submitted,
    Complete,
    Disposed,
}

/// Destination access implied by transitioning into `layout`, for the
/// layouts the recorder knows about.
pub fn access_for_layout(layout: vk::ImageLayout) -> Option<vk::AccessFlags> {
    match layout {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => Some(vk::AccessFlags::MEMORY_READ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => Some(vk::AccessFlags::MEMORY_WRITE),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => Some(vk::AccessFlags::TRANSFER_WRITE),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => Some(vk::AccessFlags::TRANSFER_READ),
        _ => None,
    }
}

// ── Recording inputs ────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PipelineBinding {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

#[derive(Debug, Clone, Copy)]
pub struct VertexInput<'a> {
    pub buffer: &'a Buffer,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SetBinding {
    pub set: vk::DescriptorSet,
    pub dynamic_offset: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct PushConstants {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub data: Vec<u8>,
}

/// One draw call with everything it binds.
///
/// For indexed draws `inputs[0]` is the index buffer (32-bit indices) and
/// the remaining inputs are vertex bindings 0, 1, ...
#[derive(Debug, Clone)]
pub struct DrawItem<'a> {
    pub pipeline: PipelineBinding,
    pub indexed: bool,
    pub inputs: Vec<VertexInput<'a>>,
    pub sets: Vec<SetBinding>,
    pub push: Option<PushConstants>,
    pub count: u32,
    pub instances: u32,
    pub first: u32,
    pub first_instance: u32,
}

#[derive(Debug, Clone)]
pub struct ComputeItem {
    pub pipeline: PipelineBinding,
    pub sets: Vec<SetBinding>,
    pub push: Option<PushConstants>,
    pub groups: [u32; 3],
}

#[derive(Debug, Clone)]
pub struct RenderTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_colors: Vec<[f32; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    BufferToImage,
    ImageToBuffer,
}

/// A buffer/image copy wrapped in the layout transitions it needs.
#[derive(Debug, Clone, Copy)]
pub struct TransferItem<'a> {
    pub direction: TransferDirection,
    pub buffer: &'a Buffer,
    pub buffer_offset: u64,
    pub image: &'a Image,
    /// Range to copy, carrying the layout the image is in now.
    pub range: ImageRange,
    pub final_layout: vk::ImageLayout,
}

// ── Recorder ────────────────────────────────────────────────

pub struct CommandRecorder {
    driver: Arc<dyn Driver>,
    family: u32,
    once: bool,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    signal: Option<vk::Semaphore>,
    state: RecorderState,
    used: bool,
    recorded: usize,
    timeout_ms: u64,
}

impl CommandRecorder {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        family: u32,
        once: bool,
        timeout_ms: u64,
    ) -> Result<Self> {
        let flags = if once {
            vk::CommandPoolCreateFlags::TRANSIENT
        } else {
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
        };
        let pool = driver
            .create_command_pool(family, flags)
            .call("vkCreateCommandPool")?;
        let cmd = match driver.allocate_command_buffer(pool) {
            Ok(cmd) => cmd,
            Err(result) => {
                driver.destroy_command_pool(pool);
                return Err(GpuError::Driver {
                    call: "vkAllocateCommandBuffers",
                    result,
                });
            }
        };
        let fence = match driver.create_fence(false) {
            Ok(fence) => fence,
            Err(result) => {
                driver.destroy_command_pool(pool);
                return Err(GpuError::Driver {
                    call: "vkCreateFence",
                    result,
                });
            }
        };
        debug!(family, once, ?pool, ?fence, "created command recorder");
        Ok(Self {
            driver,
            family,
            once,
            pool,
            cmd,
            fence,
            signal: None,
            state: RecorderState::Initial,
            used: false,
            recorded: 0,
            timeout_ms,
        })
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn is_single_use(&self) -> bool {
        self.once
    }

    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Number of operations recorded since the last `begin`.
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Start (or restart) recording.
    pub fn begin(&mut self) -> Result<()> {
        match self.state {
            RecorderState::Recording => {
                return Err(GpuError::ResourceState(
                    "recorder is already recording".to_string(),
                ))
            }
            RecorderState::Disposed => {
                return Err(GpuError::ResourceState("recorder is disposed".to_string()))
            }
            RecorderState::Submitted => {
                if !self.poll()? {
                    return Err(GpuError::ResourceState(
                        "recorder is still executing on the GPU".to_string(),
                    ));
                }
            }
            RecorderState::Initial | RecorderState::Complete => {}
        }

        if self.used {
            self.driver
                .reset_command_pool(self.pool)
                .call("vkResetCommandPool")?;
        }
        let flags = if self.once {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        self.driver
            .begin_command_buffer(self.cmd, flags)
            .call("vkBeginCommandBuffer")?;
        self.used = true;
        self.recorded = 0;
        self.state = RecorderState::Recording;
        Ok(())
    }

    fn ensure_recording(&self, what: &str) -> Result<()> {
        if self.state == RecorderState::Recording {
            Ok(())
        } else {
            Err(GpuError::ResourceState(format!(
                "{what} requires a recording recorder, state is {:?}",
                self.state
            )))
        }
    }

    fn push(&mut self, command: RecordedCommand) {
        self.driver.record(self.cmd, &command);
        self.recorded += 1;
    }

    // ── Transfer ────────────────────────────────────────────

    /// Copy `min(src.size, dst.size)` bytes from the start of `src` to `dst`.
    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer) -> Result<()> {
        self.ensure_recording("copy_buffer")?;
        src.ensure_bound("copy_buffer")?;
        dst.ensure_bound("copy_buffer")?;
        let size = src.size().min(dst.size());
        self.push(RecordedCommand::CopyBuffer {
            src: src.handle(),
            dst: dst.handle(),
            regions: vec![vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            }],
        });
        Ok(())
    }

    /// Transition `range` of `image` into `new_layout`. Returns the range in
    /// its new layout.
    pub fn set_layout(
        &mut self,
        image: &Image,
        range: &ImageRange,
        new_layout: vk::ImageLayout,
    ) -> Result<ImageRange> {
        let dst_access =
            access_for_layout(new_layout).ok_or(GpuError::UnmappedLayout(new_layout))?;
        self.barrier_with_access(image, range, new_layout, dst_access)
    }

    /// Layout transition with an explicit destination access mask, for
    /// layouts [`access_for_layout`] does not cover.
    pub fn barrier_with_access(
        &mut self,
        image: &Image,
        range: &ImageRange,
        new_layout: vk::ImageLayout,
        dst_access: vk::AccessFlags,
    ) -> Result<ImageRange> {
        self.ensure_recording("set_layout")?;
        image.ensure_bound("set_layout")?;
        let src_access = access_for_layout(range.layout).unwrap_or(vk::AccessFlags::empty());
        self.push(RecordedCommand::PipelineBarrier {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            image_barriers: vec![ImageBarrier {
                image: image.handle(),
                old_layout: range.layout,
                new_layout,
                src_access,
                dst_access,
                range: range.subresource(image.description().aspect()),
            }],
        });
        Ok(range.with_layout(new_layout))
    }

    /// One copy region per mip level in `range`, tightly packed in the buffer
    /// starting at `buffer_offset`.
    fn image_regions(
        image: &Image,
        range: &ImageRange,
        buffer_offset: u64,
    ) -> Result<Vec<vk::BufferImageCopy>> {
        let desc = image.description();
        let texel = texel_size(desc.format);
        if texel.is_none() && range.level_count > 1 {
            return Err(GpuError::Configuration(format!(
                "cannot pack mip levels of {:?} into a buffer",
                desc.format
            )));
        }
        let mut offset = buffer_offset;
        let mut regions = Vec::with_capacity(range.level_count as usize);
        for level in range.first_mip..range.first_mip + range.level_count {
            let extent = desc.mip_extent(level);
            regions.push(vk::BufferImageCopy {
                buffer_offset: offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: desc.aspect(),
                    mip_level: level,
                    base_array_layer: range.first_layer,
                    layer_count: range.layer_count,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: extent,
            });
            if let Some(texel) = texel {
                offset += extent.width as u64
                    * extent.height as u64
                    * extent.depth as u64
                    * range.layer_count as u64
                    * texel as u64;
            }
        }
        Ok(regions)
    }

    /// Copy buffer contents into the image; the image must already be in
    /// `range.layout` (normally transfer-dst).
    pub fn copy_buffer_to_image(
        &mut self,
        src: &Buffer,
        buffer_offset: u64,
        dst: &Image,
        range: &ImageRange,
    ) -> Result<()> {
        self.ensure_recording("copy_buffer_to_image")?;
        src.ensure_bound("copy_buffer_to_image")?;
        dst.ensure_bound("copy_buffer_to_image")?;
        let regions = Self::image_regions(dst, range, buffer_offset)?;
        self.push(RecordedCommand::CopyBufferToImage {
            src: src.handle(),
            dst: dst.handle(),
            dst_layout: range.layout,
            regions,
        });
        Ok(())
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: &Image,
        range: &ImageRange,
        dst: &Buffer,
        buffer_offset: u64,
    ) -> Result<()> {
        self.ensure_recording("copy_image_to_buffer")?;
        src.ensure_bound("copy_image_to_buffer")?;
        dst.ensure_bound("copy_image_to_buffer")?;
        let regions = Self::image_regions(src, range, buffer_offset)?;
        self.push(RecordedCommand::CopyImageToBuffer {
            src: src.handle(),
            src_layout: range.layout,
            dst: dst.handle(),
            regions,
        });
        Ok(())
    }

    /// Record each item as: barrier into the transfer layout, copy, barrier
    /// into the final layout. Nothing is recorded if any item is invalid.
    pub fn transfer(&mut self, items: &[TransferItem<'_>]) -> Result<()> {
        self.ensure_recording("transfer")?;
        for item in items {
            if access_for_layout(item.final_layout).is_none() {
                return Err(GpuError::UnmappedLayout(item.final_layout));
            }
            item.buffer.ensure_bound("transfer")?;
            item.image.ensure_bound("transfer")?;
            Self::image_regions(item.image, &item.range, item.buffer_offset)?;
        }

        for item in items {
            match item.direction {
                TransferDirection::BufferToImage => {
                    let range = self.set_layout(
                        item.image,
                        &item.range,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    )?;
                    self.copy_buffer_to_image(item.buffer, item.buffer_offset, item.image, &range)?;
                    self.set_layout(item.image, &range, item.final_layout)?;
                }
                TransferDirection::ImageToBuffer => {
                    let range = self.set_layout(
                        item.image,
                        &item.range,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    )?;
                    self.copy_image_to_buffer(item.image, &range, item.buffer, item.buffer_offset)?;
                    self.set_layout(item.image, &range, item.final_layout)?;
                }
            }
        }
        Ok(())
    }

    /// Clear an image that is in transfer-dst or general layout.
    pub fn clear_image(&mut self, image: &Image, range: &ImageRange, color: [f32; 4]) -> Result<()> {
        self.ensure_recording("clear_image")?;
        image.ensure_bound("clear_image")?;
        if range.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL
            && range.layout != vk::ImageLayout::GENERAL
        {
            return Err(GpuError::ResourceState(format!(
                "clear_image needs TRANSFER_DST_OPTIMAL or GENERAL, image is {:?}",
                range.layout
            )));
        }
        self.push(RecordedCommand::ClearColorImage {
            image: image.handle(),
            layout: range.layout,
            color,
            range: range.subresource(vk::ImageAspectFlags::COLOR),
        });
        Ok(())
    }

    // ── Graphics / Compute ──────────────────────────────────

    /// Begin a render pass and cover the whole target with viewport and scissor.
    pub fn begin_render_pass(&mut self, target: &RenderTarget) -> Result<()> {
        self.ensure_recording("begin_render_pass")?;
        self.push(RecordedCommand::BeginRenderPass {
            render_pass: target.render_pass,
            framebuffer: target.framebuffer,
            extent: target.extent,
            clear_colors: target.clear_colors.clone(),
        });
        self.push(RecordedCommand::SetViewport {
            viewport: vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: target.extent.width as f32,
                height: target.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        });
        self.push(RecordedCommand::SetScissor {
            scissor: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: target.extent,
            },
        });
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        self.ensure_recording("end_render_pass")?;
        self.push(RecordedCommand::EndRenderPass);
        Ok(())
    }

    /// Record a list of draws. Draws with zero instances record nothing.
    pub fn draw(&mut self, items: &[DrawItem<'_>]) -> Result<()> {
        self.ensure_recording("draw")?;
        for item in items {
            if item.inputs.len() > MAX_BINDINGS || item.sets.len() > MAX_BINDINGS {
                return Err(GpuError::Configuration(format!(
                    "draw binds {} inputs and {} sets, at most {MAX_BINDINGS} each",
                    item.inputs.len(),
                    item.sets.len()
                )));
            }
            if item.indexed && item.inputs.is_empty() {
                return Err(GpuError::Configuration(
                    "indexed draw without an index buffer".to_string(),
                ));
            }
            for input in &item.inputs {
                input.buffer.ensure_bound("draw")?;
            }
        }

        for item in items.iter().filter(|i| i.instances > 0) {
            self.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, &item.pipeline, &item.sets, &item.push);
            for (slot, input) in item.inputs.iter().enumerate() {
                if item.indexed && slot == 0 {
                    self.push(RecordedCommand::BindIndexBuffer {
                        buffer: input.buffer.handle(),
                        offset: input.offset,
                        index_type: vk::IndexType::UINT32,
                    });
                } else {
                    let binding = if item.indexed { slot - 1 } else { slot };
                    self.push(RecordedCommand::BindVertexBuffers {
                        first_binding: binding as u32,
                        buffers: vec![input.buffer.handle()],
                        offsets: vec![input.offset],
                    });
                }
            }
            if item.indexed {
                self.push(RecordedCommand::DrawIndexed {
                    index_count: item.count,
                    instance_count: item.instances,
                    first_index: item.first,
                    vertex_offset: 0,
                    first_instance: item.first_instance,
                });
            } else {
                self.push(RecordedCommand::Draw {
                    vertex_count: item.count,
                    instance_count: item.instances,
                    first_vertex: item.first,
                    first_instance: item.first_instance,
                });
            }
        }
        Ok(())
    }

    pub fn dispatch(&mut self, item: &ComputeItem) -> Result<()> {
        self.ensure_recording("dispatch")?;
        if item.sets.len() > MAX_BINDINGS {
            return Err(GpuError::Configuration(format!(
                "dispatch binds {} sets, at most {MAX_BINDINGS}",
                item.sets.len()
            )));
        }
        self.bind_pipeline(vk::PipelineBindPoint::COMPUTE, &item.pipeline, &item.sets, &item.push);
        let [x, y, z] = item.groups;
        self.push(RecordedCommand::Dispatch {
            group_count_x: x,
            group_count_y: y,
            group_count_z: z,
        });
        Ok(())
    }

    fn bind_pipeline(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        pipeline: &PipelineBinding,
        sets: &[SetBinding],
        push: &Option<PushConstants>,
    ) {
        self.push(RecordedCommand::BindPipeline {
            bind_point,
            pipeline: pipeline.pipeline,
        });
        for (index, set) in sets.iter().enumerate() {
            self.push(RecordedCommand::BindDescriptorSets {
                bind_point,
                layout: pipeline.layout,
                first_set: index as u32,
                sets: vec![set.set],
                dynamic_offsets: set.dynamic_offset.into_iter().collect(),
            });
        }
        if let Some(push) = push.as_ref().filter(|p| !p.data.is_empty()) {
            self.push(RecordedCommand::PushConstants {
                layout: pipeline.layout,
                stages: push.stages,
                offset: push.offset,
                data: push.data.clone(),
            });
        }
    }

    // ── Queries ─────────────────────────────────────────────

    pub fn reset_timestamps(&mut self, pool: &TimestampPool) -> Result<()> {
        self.ensure_recording("reset_timestamps")?;
        self.push(RecordedCommand::ResetQueryPool {
            pool: pool.handle(),
            first: 0,
            count: pool.count(),
        });
        Ok(())
    }

    pub fn write_timestamp(
        &mut self,
        pool: &TimestampPool,
        query: u32,
        stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        self.ensure_recording("write_timestamp")?;
        if query >= pool.count() {
            return Err(GpuError::ResourceState(format!(
                "timestamp {query} out of range for pool of {}",
                pool.count()
            )));
        }
        self.push(RecordedCommand::WriteTimestamp {
            stage,
            pool: pool.handle(),
            query,
        });
        Ok(())
    }

    // ── Submission hooks (used by Queue) ────────────────────

    /// Ends recording. A driver failure leaves the recorder `Complete` so it
    /// can be begun again.
    pub(crate) fn end(&mut self) -> Result<()> {
        self.ensure_recording("submit")?;
        let ended = self
            .driver
            .end_command_buffer(self.cmd)
            .call("vkEndCommandBuffer");
        if ended.is_err() {
            self.mark_failed();
        }
        ended
    }

    /// The persistent signal semaphore, created on first use.
    pub(crate) fn signal_semaphore(&mut self) -> Result<vk::Semaphore> {
        if let Some(semaphore) = self.signal {
            return Ok(semaphore);
        }
        let semaphore = self
            .driver
            .create_semaphore()
            .call("vkCreateSemaphore")?;
        debug!(?semaphore, "created recorder signal semaphore");
        self.signal = Some(semaphore);
        Ok(semaphore)
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.state = RecorderState::Submitted;
    }

    /// The command buffer never reached the queue.
    pub(crate) fn mark_failed(&mut self) {
        self.state = RecorderState::Complete;
    }

    // ── Completion ──────────────────────────────────────────

    /// Non-blocking completion check.
    pub fn poll(&mut self) -> Result<bool> {
        match self.state {
            RecorderState::Submitted => {
                let done = self
                    .driver
                    .fence_signaled(self.fence)
                    .call("vkGetFenceStatus")?;
                if done {
                    self.state = RecorderState::Complete;
                }
                Ok(done)
            }
            RecorderState::Complete | RecorderState::Initial => Ok(true),
            RecorderState::Recording => Ok(false),
            RecorderState::Disposed => {
                Err(GpuError::ResourceState("recorder is disposed".to_string()))
            }
        }
    }

    pub fn is_complete(&mut self) -> Result<bool> {
        self.poll()
    }

    /// Block until the last submission finishes, bounded by the fence timeout.
    pub fn wait(&mut self) -> Result<()> {
        match self.state {
            RecorderState::Submitted => {
                match self
                    .driver
                    .wait_for_fence(self.fence, self.timeout_ms.saturating_mul(1_000_000))
                {
                    Ok(()) => {
                        self.state = RecorderState::Complete;
                        Ok(())
                    }
                    Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout {
                        what: "command recorder fence",
                        timeout_ms: self.timeout_ms,
                    }),
                    Err(result) => Err(GpuError::Driver {
                        call: "vkWaitForFences",
                        result,
                    }),
                }
            }
            RecorderState::Initial | RecorderState::Complete => Ok(()),
            RecorderState::Recording => Err(GpuError::ResourceState(
                "cannot wait on a recorder that was never submitted".to_string(),
            )),
            RecorderState::Disposed => {
                Err(GpuError::ResourceState("recorder is disposed".to_string()))
            }
        }
    }

    /// Wait for pending work, then destroy the semaphore, fence and pool.
    pub fn dispose(&mut self) -> Result<()> {
        if self.state == RecorderState::Disposed {
            return Ok(());
        }
        if self.state == RecorderState::Submitted {
            self.wait()?;
        }
        if let Some(semaphore) = self.signal.take() {
            self.driver.destroy_semaphore(semaphore);
        }
        self.driver.destroy_fence(self.fence);
        self.driver.destroy_command_pool(self.pool);
        self.state = RecorderState::Disposed;
        debug!(pool = ?self.pool, "command recorder disposed");
        Ok(())
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            // Objects the GPU may still use are leaked, not destroyed.
            warn!(error = %e, "leaking command recorder that did not complete");
        }
    }
}

impl std::fmt::Debug for CommandRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("family", &self.family)
            .field("once", &self.once)
            .field("state", &self.state)
            .field("recorded", &self.recorded)
            .finish()
    }
}
