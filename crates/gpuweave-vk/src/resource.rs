use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::driver::Driver;
use crate::error::{DriverCall, GpuError, Result};
use crate::memory::ArenaId;

/// Shape and format of an image.
#[derive(Debug, Clone, Copy)]
pub struct ImageDescription {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub layers: u32,
}

/// A sub-range of an image together with the layout it is currently in.
#[derive(Debug, Clone, Copy)]
pub struct ImageRange {
    pub first_layer: u32,
    pub layer_count: u32,
    pub first_mip: u32,
    pub level_count: u32,
    pub layout: vk::ImageLayout,
}

/// Where a resource lives inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub arena: ArenaId,
    pub offset: u64,
    pub padded_size: u64,
    pub bound: bool,
}

impl ImageDescription {
    pub fn new_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            depth: 1,
            format,
            mip_levels: 1,
            layers: 1,
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers.max(1);
        self
    }

    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }

    /// Extent of one mip level, never collapsing below one texel.
    pub fn mip_extent(&self, level: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
            depth: (self.depth >> level).max(1),
        }
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format_aspect(self.format)
    }

    /// Tightly packed size of every layer and mip level in bytes.
    pub fn byte_size(&self) -> Result<u64> {
        let texel = texel_size(self.format).ok_or_else(|| {
            GpuError::Configuration(format!("unknown texel size for {:?}", self.format))
        })?;
        let per_layer: u64 = (0..self.mip_levels)
            .map(|level| {
                let e = self.mip_extent(level);
                e.width as u64 * e.height as u64 * e.depth as u64 * texel as u64
            })
            .sum();
        Ok(per_layer * self.layers as u64)
    }

    /// Range covering every layer and mip level.
    pub fn full_range(&self, layout: vk::ImageLayout) -> ImageRange {
        ImageRange {
            first_layer: 0,
            layer_count: self.layers,
            first_mip: 0,
            level_count: self.mip_levels,
            layout,
        }
    }
}

impl ImageRange {
    pub fn subresource(&self, aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: self.first_mip,
            level_count: self.level_count,
            base_array_layer: self.first_layer,
            layer_count: self.layer_count,
        }
    }

    pub fn with_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.layout = layout;
        self
    }
}

/// Bytes per texel for the formats gpuweave stages through buffers.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT => 2,
        vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

pub fn format_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

// ── Buffer ──────────────────────────────────────────────────

/// A driver buffer with no memory of its own until an arena binds it.
pub struct Buffer {
    driver: Arc<dyn Driver>,
    handle: vk::Buffer,
    size: u64,
    usage: vk::BufferUsageFlags,
    host: bool,
    placement: Option<Placement>,
}

impl Buffer {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        size: u64,
        usage: vk::BufferUsageFlags,
        host: bool,
    ) -> Result<Self> {
        if size == 0 {
            return Err(GpuError::Configuration(
                "buffer size must be non-zero".to_string(),
            ));
        }
        let handle = driver.create_buffer(size, usage).call("vkCreateBuffer")?;
        debug!(?handle, size, host, "created buffer");
        Ok(Self {
            driver,
            handle,
            size,
            usage,
            host,
            placement: None,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Whether this buffer asks for host-visible memory.
    pub fn is_host(&self) -> bool {
        self.host
    }

    pub fn placement(&self) -> Option<Placement> {
        self.placement
    }

    pub fn is_bound(&self) -> bool {
        self.placement.is_some_and(|p| p.bound)
    }

    pub(crate) fn requirements(&self) -> vk::MemoryRequirements {
        self.driver.buffer_requirements(self.handle)
    }

    pub(crate) fn place(&mut self, placement: Placement) {
        self.placement = Some(placement);
    }

    pub(crate) fn bind(&mut self, memory: vk::DeviceMemory) -> Result<()> {
        let mut placement = self.placement.ok_or_else(|| {
            GpuError::ResourceState("buffer was never reserved in an arena".to_string())
        })?;
        self.driver
            .bind_buffer_memory(self.handle, memory, placement.offset)
            .call("vkBindBufferMemory")?;
        placement.bound = true;
        self.placement = Some(placement);
        Ok(())
    }

    pub(crate) fn ensure_bound(&self, what: &str) -> Result<()> {
        if self.is_bound() {
            Ok(())
        } else {
            Err(GpuError::ResourceState(format!(
                "{what}: buffer {:?} is not bound to memory",
                self.handle
            )))
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        debug!(handle = ?self.handle, "destroying buffer");
        self.driver.destroy_buffer(self.handle);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("host", &self.host)
            .field("placement", &self.placement)
            .finish()
    }
}

// ── Image ───────────────────────────────────────────────────

pub struct Image {
    driver: Arc<dyn Driver>,
    handle: vk::Image,
    desc: ImageDescription,
    usage: vk::ImageUsageFlags,
    /// Swapchain images belong to the swapchain and are never destroyed here.
    owned: bool,
    placement: Option<Placement>,
}

impl Image {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        desc: ImageDescription,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(GpuError::Configuration(format!(
                "image extent {}x{}x{} has a zero dimension",
                desc.width, desc.height, desc.depth
            )));
        }
        let handle = driver.create_image(&desc, usage).call("vkCreateImage")?;
        debug!(?handle, width = desc.width, height = desc.height, format = ?desc.format, "created image");
        Ok(Self {
            driver,
            handle,
            desc,
            usage,
            owned: true,
            placement: None,
        })
    }

    /// Wrap an image owned by someone else (a swapchain). It counts as bound.
    pub(crate) fn borrowed(
        driver: Arc<dyn Driver>,
        handle: vk::Image,
        desc: ImageDescription,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            driver,
            handle,
            desc,
            usage,
            owned: false,
            placement: None,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn description(&self) -> &ImageDescription {
        &self.desc
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn placement(&self) -> Option<Placement> {
        self.placement
    }

    pub fn is_bound(&self) -> bool {
        !self.owned || self.placement.is_some_and(|p| p.bound)
    }

    pub(crate) fn requirements(&self) -> vk::MemoryRequirements {
        self.driver.image_requirements(self.handle)
    }

    pub(crate) fn place(&mut self, placement: Placement) {
        self.placement = Some(placement);
    }

    pub(crate) fn bind(&mut self, memory: vk::DeviceMemory) -> Result<()> {
        let mut placement = self.placement.ok_or_else(|| {
            GpuError::ResourceState("image was never reserved in an arena".to_string())
        })?;
        self.driver
            .bind_image_memory(self.handle, memory, placement.offset)
            .call("vkBindImageMemory")?;
        placement.bound = true;
        self.placement = Some(placement);
        Ok(())
    }

    pub(crate) fn ensure_bound(&self, what: &str) -> Result<()> {
        if self.is_bound() {
            Ok(())
        } else {
            Err(GpuError::ResourceState(format!(
                "{what}: image {:?} is not bound to memory",
                self.handle
            )))
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.owned {
            debug!(handle = ?self.handle, "destroying image");
            self.driver.destroy_image(self.handle);
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("desc", &self.desc)
            .field("owned", &self.owned)
            .field("placement", &self.placement)
            .finish()
    }
}
