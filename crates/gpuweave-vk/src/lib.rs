//! GPU resource lifetime and submission orchestration on top of Vulkan.
//!
//! A [`Device`] is the factory for everything else: memory arenas that pack
//! buffers and images into one allocation, command recorders with their own
//! fence, queues that chain submissions through semaphores, descriptor
//! layouts and a presentation bridge for swapchains.

pub mod ash_driver;
pub mod collab;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod driver;
pub mod error;
pub mod extension;
pub mod memory;
pub mod objects;
pub mod pool;
pub mod present;
pub mod queue;
pub mod recorded;
pub mod recording;
pub mod resource;
pub mod submit;
pub mod validation;

pub use ash::vk;

pub use ash_driver::{enumerate_devices, open_device, AshDriver, DeviceInfo};
pub use collab::{CompiledShader, ImageDecoder, ShaderCompiler, ShaderStage, SurfaceProvider};
pub use command::{
    access_for_layout, CommandRecorder, ComputeItem, DrawItem, PipelineBinding, PushConstants,
    RecorderState, RenderTarget, SetBinding, TransferDirection, TransferItem, VertexInput,
};
pub use descriptor::{pool_sizes, DescriptorLayout, DescriptorPool, DescriptorSet};
pub use device::{Device, StagedImage};
pub use driver::{Driver, LayoutBinding, QueueFamilyInfo};
pub use error::{GpuError, Result};
pub use extension::{standard_extensions, Extension, ExtensionKind, ExtensionList};
pub use memory::{
    align_up, select_memory_type, ArenaId, ArenaState, MemoryArena, Reserve, Resource, ResourceId,
};
pub use objects::{ImageView, Sampler, ShaderModule, TimestampPool, ViewKind};
pub use pool::{MemoryPool, PoolResourceId};
pub use present::{PresentFrame, PresentationBridge};
pub use queue::{select_queue_index, Queue};
pub use recorded::RecordedCommand;
pub use recording::RecordingDriver;
pub use resource::{Buffer, Image, ImageDescription, ImageRange};
pub use submit::{Prepared, SubmitDependency, WaitPoint};
pub use validation::{Diagnostic, Severity, SuppressionScope, ValidationCollector};
