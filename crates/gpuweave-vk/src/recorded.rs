use ash::vk;

/// Operations a [`CommandRecorder`](crate::CommandRecorder) hands to the driver,
/// in recording order. The driver replays each one into the command buffer.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
        offsets: Vec<u64>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    PipelineBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: Vec<ImageBarrier>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
        range: vk::ImageSubresourceRange,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_colors: Vec<[f32; 4]>,
    },
    EndRenderPass,
    SetViewport {
        viewport: vk::Viewport,
    },
    SetScissor {
        scissor: vk::Rect2D,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    WriteTimestamp {
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    },
    ResetQueryPool {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
}

/// Image layout transition with its access masks.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub range: vk::ImageSubresourceRange,
}

impl RecordedCommand {
    /// Short name used in driver call logs.
    pub fn name(&self) -> &'static str {
        match self {
            RecordedCommand::BindPipeline { .. } => "BindPipeline",
            RecordedCommand::BindDescriptorSets { .. } => "BindDescriptorSets",
            RecordedCommand::BindVertexBuffers { .. } => "BindVertexBuffers",
            RecordedCommand::BindIndexBuffer { .. } => "BindIndexBuffer",
            RecordedCommand::PushConstants { .. } => "PushConstants",
            RecordedCommand::Dispatch { .. } => "Dispatch",
            RecordedCommand::PipelineBarrier { .. } => "PipelineBarrier",
            RecordedCommand::CopyBuffer { .. } => "CopyBuffer",
            RecordedCommand::CopyBufferToImage { .. } => "CopyBufferToImage",
            RecordedCommand::CopyImageToBuffer { .. } => "CopyImageToBuffer",
            RecordedCommand::ClearColorImage { .. } => "ClearColorImage",
            RecordedCommand::BeginRenderPass { .. } => "BeginRenderPass",
            RecordedCommand::EndRenderPass => "EndRenderPass",
            RecordedCommand::SetViewport { .. } => "SetViewport",
            RecordedCommand::SetScissor { .. } => "SetScissor",
            RecordedCommand::Draw { .. } => "Draw",
            RecordedCommand::DrawIndexed { .. } => "DrawIndexed",
            RecordedCommand::WriteTimestamp { .. } => "WriteTimestamp",
            RecordedCommand::ResetQueryPool { .. } => "ResetQueryPool",
        }
    }
}
