//! Interfaces to the layers gpuweave does not implement itself: windowing,
//! image decoding and shader compilation.

use ash::vk;

use crate::resource::ImageDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Geometry,
    Compute,
}

impl ShaderStage {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompiledShader {
    pub spirv: Vec<u32>,
    /// Warnings and other non-fatal output.
    pub log: String,
}

pub trait ShaderCompiler: Send + Sync {
    /// Compile source text to SPIR-V. `Err` carries the diagnostic text.
    fn compile(&self, source: &str, stage: ShaderStage) -> Result<CompiledShader, String>;
}

pub trait ImageDecoder: Send + Sync {
    /// Shape of the decoded image without decoding pixel data.
    fn describe(&self, encoded: &[u8]) -> Result<ImageDescription, String>;

    /// Decode into `dst`, which must hold at least `describe(..).byte_size()`
    /// bytes. Returns the number of bytes written.
    fn decode(&self, encoded: &[u8], dst: &mut [u8]) -> Result<usize, String>;
}

/// The windowing layer's side of presentation.
pub trait SurfaceProvider: Send + Sync {
    /// Instance extensions the surface needs (e.g. `VK_KHR_surface` plus a platform one).
    fn instance_extensions(&self) -> Vec<&'static std::ffi::CStr>;

    fn surface(&self) -> vk::SurfaceKHR;

    /// Current drawable size; used when the surface leaves the extent to the application.
    fn extent(&self) -> vk::Extent2D;
}
