use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::collab::{ShaderCompiler, ShaderStage};
use crate::driver::Driver;
use crate::error::{DriverCall, GpuError, Result};
use crate::resource::{Image, ImageRange};

// ── Image view ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    D2,
    D2Array,
    D3,
    Cube,
}

impl ViewKind {
    fn view_type(self) -> vk::ImageViewType {
        match self {
            ViewKind::D2 => vk::ImageViewType::TYPE_2D,
            ViewKind::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
            ViewKind::D3 => vk::ImageViewType::TYPE_3D,
            ViewKind::Cube => vk::ImageViewType::CUBE,
        }
    }
}

pub struct ImageView {
    driver: Arc<dyn Driver>,
    handle: vk::ImageView,
    image: vk::Image,
    range: ImageRange,
    kind: ViewKind,
}

impl ImageView {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        image: &Image,
        range: &ImageRange,
        kind: ViewKind,
    ) -> Result<Self> {
        image.ensure_bound("image view")?;
        if kind == ViewKind::Cube && range.layer_count != 6 {
            return Err(GpuError::Configuration(format!(
                "cube view needs 6 layers, range has {}",
                range.layer_count
            )));
        }
        let desc = image.description();
        if range.first_layer + range.layer_count > desc.layers
            || range.first_mip + range.level_count > desc.mip_levels
        {
            return Err(GpuError::Configuration(
                "view range exceeds the image".to_string(),
            ));
        }
        let handle = driver
            .create_image_view(image.handle(), desc, range, kind.view_type(), desc.aspect())
            .call("vkCreateImageView")?;
        debug!(?handle, ?kind, "created image view");
        Ok(Self {
            driver,
            handle,
            image: image.handle(),
            range: *range,
            kind,
        })
    }

    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn range(&self) -> &ImageRange {
        &self.range
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.driver.destroy_image_view(self.handle);
    }
}

// ── Sampler ─────────────────────────────────────────────────

/// Linear-filtered sampler with one address mode on every axis.
pub struct Sampler {
    driver: Arc<dyn Driver>,
    handle: vk::Sampler,
    address_mode: vk::SamplerAddressMode,
}

impl Sampler {
    pub(crate) fn new(driver: Arc<dyn Driver>, address_mode: vk::SamplerAddressMode) -> Result<Self> {
        let handle = driver
            .create_sampler(address_mode)
            .call("vkCreateSampler")?;
        Ok(Self {
            driver,
            handle,
            address_mode,
        })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    pub fn address_mode(&self) -> vk::SamplerAddressMode {
        self.address_mode
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.driver.destroy_sampler(self.handle);
    }
}

// ── Timestamps ──────────────────────────────────────────────

pub struct TimestampPool {
    driver: Arc<dyn Driver>,
    handle: vk::QueryPool,
    count: u32,
    period_ns: f32,
}

impl TimestampPool {
    pub(crate) fn new(driver: Arc<dyn Driver>, count: u32) -> Result<Self> {
        if count == 0 {
            return Err(GpuError::Configuration(
                "timestamp pool needs at least one query".to_string(),
            ));
        }
        let handle = driver
            .create_timestamp_pool(count)
            .call("vkCreateQueryPool")?;
        let period_ns = driver.timestamp_period();
        Ok(Self {
            driver,
            handle,
            count,
            period_ns,
        })
    }

    pub fn handle(&self) -> vk::QueryPool {
        self.handle
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Raw tick values; only meaningful once the writing submission completed.
    pub fn results(&self) -> Result<Vec<u64>> {
        self.driver
            .query_results(self.handle, self.count)
            .call("vkGetQueryPoolResults")
    }

    /// Nanoseconds between two consecutive timestamps, for every pair.
    pub fn intervals_ns(&self) -> Result<Vec<f64>> {
        let ticks = self.results()?;
        Ok(ticks
            .windows(2)
            .map(|w| w[1].saturating_sub(w[0]) as f64 * self.period_ns as f64)
            .collect())
    }
}

impl Drop for TimestampPool {
    fn drop(&mut self) {
        self.driver.destroy_query_pool(self.handle);
    }
}

// ── Shader module ───────────────────────────────────────────

pub struct ShaderModule {
    driver: Arc<dyn Driver>,
    handle: vk::ShaderModule,
    stage: ShaderStage,
    log: String,
}

impl ShaderModule {
    pub(crate) fn compile(
        driver: Arc<dyn Driver>,
        compiler: &dyn ShaderCompiler,
        source: &str,
        stage: ShaderStage,
    ) -> Result<Self> {
        let output = compiler
            .compile(source, stage)
            .map_err(|message| GpuError::Collaborator {
                what: "shader compilation",
                message,
            })?;
        if !output.log.is_empty() {
            debug!(?stage, log = %output.log, "shader compiler log");
        }
        Self::from_spirv(driver, &output.spirv, stage, output.log)
    }

    pub(crate) fn from_spirv(
        driver: Arc<dyn Driver>,
        spirv: &[u32],
        stage: ShaderStage,
        log: String,
    ) -> Result<Self> {
        if spirv.first() != Some(&SPIRV_MAGIC) {
            return Err(GpuError::Collaborator {
                what: "shader compilation",
                message: "output is not SPIR-V".to_string(),
            });
        }
        let handle = driver
            .create_shader_module(spirv)
            .call("vkCreateShaderModule")?;
        Ok(Self {
            driver,
            handle,
            stage,
            log,
        })
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Non-fatal compiler output.
    pub fn log(&self) -> &str {
        &self.log
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.driver.destroy_shader_module(self.handle);
    }
}

pub const SPIRV_MAGIC: u32 = 0x0723_0203;
