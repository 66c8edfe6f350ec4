//! Swapchain ownership and the acquire/present handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use gpuweave_core::config::{PresentMode, PresentationConfig};
use tracing::{debug, info, warn};

use crate::collab::SurfaceProvider;
use crate::driver::{Driver, SwapchainRequest};
use crate::error::{is_surface_stale, DriverCall, GpuError, Result};
use crate::queue::Queue;
use crate::resource::{Image, ImageDescription};
use crate::submit::{Prepared, SubmitDependency, WaitPoint};
use crate::validation::ValidationCollector;

const SWAPCHAIN_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSFER_SRC.as_raw(),
);

/// Connects rendering submissions to a presentable surface.
///
/// The swapchain is rebuilt lazily: any out-of-date or suboptimal result
/// marks the bridge stale and the next [`next_frame`](Self::next_frame)
/// rebuilds instead of acquiring.
pub struct PresentationBridge {
    driver: Arc<dyn Driver>,
    provider: Arc<dyn SurfaceProvider>,
    validation: ValidationCollector,
    config: PresentationConfig,
    timeout_ns: u64,
    swapchain: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    images: Vec<Image>,
    /// Per frame slot: signalled by the acquire, waited on by rendering.
    acquire: Vec<vk::Semaphore>,
    /// Per frame slot: signalled by rendering, waited on by the present.
    present: Vec<vk::Semaphore>,
    next_acquire: usize,
    stale: Arc<AtomicBool>,
}

impl PresentationBridge {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        provider: Arc<dyn SurfaceProvider>,
        validation: ValidationCollector,
        config: PresentationConfig,
        timeout_ns: u64,
    ) -> Result<Self> {
        let mut bridge = Self {
            driver,
            provider,
            validation,
            config,
            timeout_ns,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            acquire: Vec::new(),
            present: Vec::new(),
            next_acquire: 0,
            stale: Arc::new(AtomicBool::new(false)),
        };
        bridge.rebuild()?;
        Ok(bridge)
    }

    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn image(&self, index: u32) -> Option<&Image> {
        self.images.get(index as usize)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Force a rebuild on the next frame, e.g. after a window resize.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Acquire the next swapchain image.
    ///
    /// `None` means there is nothing to render into this time: the surface
    /// has zero size, or the swapchain was stale and has just been rebuilt.
    pub fn next_frame(&mut self) -> Result<Option<PresentFrame>> {
        if self.is_stale() {
            self.rebuild()?;
            return Ok(None);
        }
        if self.images.is_empty() || self.acquire.is_empty() {
            return Ok(None);
        }

        let slot = self.next_acquire;
        let semaphore = self.acquire[slot];
        let acquired = self
            .driver
            .acquire_next_image(self.swapchain, self.timeout_ns, semaphore);
        let image_index = match acquired {
            Ok((index, false)) => index,
            Ok((_, true)) => {
                debug!("swapchain suboptimal on acquire");
                self.rebuild()?;
                return Ok(None);
            }
            Err(result) if is_surface_stale(result) => {
                debug!(?result, "swapchain out of date on acquire");
                self.rebuild()?;
                return Ok(None);
            }
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                return Err(GpuError::Timeout {
                    what: "swapchain image acquire",
                    timeout_ms: self.timeout_ns / 1_000_000,
                })
            }
            Err(result) => {
                return Err(GpuError::Driver {
                    call: "vkAcquireNextImageKHR",
                    result,
                })
            }
        };
        self.next_acquire = (self.next_acquire + 1) % self.acquire.len();

        Ok(Some(PresentFrame {
            image_index,
            image: self.images[image_index as usize].handle(),
            acquire: semaphore,
            present: self.present[slot],
            swapchain: self.swapchain,
            extent: self.extent,
            stale: self.stale.clone(),
        }))
    }

    fn rebuild(&mut self) -> Result<()> {
        let _quiet = self.validation.suppress();
        self.driver
            .device_wait_idle()
            .call("vkDeviceWaitIdle")?;

        let surface = self.provider.surface();
        let caps = self
            .driver
            .surface_capabilities(surface)
            .call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let formats = self
            .driver
            .surface_formats(surface)
            .call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let format = pick_format(&formats)?;
        let extent = pick_extent(&caps, self.provider.extent());

        self.release_frames();
        if extent.width == 0 || extent.height == 0 {
            // Minimised: keep the old swapchain handle and try again next frame.
            debug!("surface has zero extent, deferring swapchain creation");
            self.stale.store(true, Ordering::Release);
            return Ok(());
        }

        let min_image_count = match caps.max_image_count {
            0 => caps.min_image_count + 1,
            max => (caps.min_image_count + 1).min(max),
        };
        let old = self.swapchain;
        let swapchain = self
            .driver
            .create_swapchain(&SwapchainRequest {
                surface,
                min_image_count,
                format,
                extent,
                transform: caps.current_transform,
                present_mode: present_mode(self.config.present_mode),
                usage: SWAPCHAIN_USAGE,
                old_swapchain: old,
            })
            .call("vkCreateSwapchainKHR")?;
        if old != vk::SwapchainKHR::null() {
            self.driver.destroy_swapchain(old);
        }
        self.swapchain = swapchain;
        self.format = format.format;
        self.extent = extent;

        let desc = ImageDescription::new_2d(extent.width, extent.height, format.format);
        self.images = self
            .driver
            .swapchain_images(swapchain)
            .call("vkGetSwapchainImagesKHR")?
            .into_iter()
            .map(|handle| Image::borrowed(self.driver.clone(), handle, desc, SWAPCHAIN_USAGE))
            .collect();

        let semaphores = self.images.len() + self.config.extra_frames as usize;
        for _ in 0..semaphores {
            let acquire = self.driver.create_semaphore().call("vkCreateSemaphore")?;
            self.acquire.push(acquire);
            let present = self.driver.create_semaphore().call("vkCreateSemaphore")?;
            self.present.push(present);
        }
        self.next_acquire = 0;
        self.stale.store(false, Ordering::Release);
        info!(
            width = extent.width,
            height = extent.height,
            images = self.images.len(),
            format = ?format.format,
            "swapchain built"
        );
        Ok(())
    }

    fn release_frames(&mut self) {
        self.images.clear();
        for semaphore in self.acquire.drain(..).chain(self.present.drain(..)) {
            self.driver.destroy_semaphore(semaphore);
        }
    }
}

impl Drop for PresentationBridge {
    fn drop(&mut self) {
        if let Err(result) = self.driver.device_wait_idle() {
            warn!(?result, "device did not go idle before swapchain teardown");
        }
        self.release_frames();
        if self.swapchain != vk::SwapchainKHR::null() {
            self.driver.destroy_swapchain(self.swapchain);
        }
    }
}

impl std::fmt::Debug for PresentationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationBridge")
            .field("swapchain", &self.swapchain)
            .field("extent", &self.extent)
            .field("images", &self.images.len())
            .field("stale", &self.is_stale())
            .finish()
    }
}

fn pick_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    let first = formats.first().ok_or_else(|| {
        GpuError::Configuration("surface reports no formats".to_string())
    })?;
    let mut format = *first;
    if format.format == vk::Format::UNDEFINED {
        format.format = vk::Format::R8G8B8A8_UNORM;
    }
    Ok(format)
}

fn pick_extent(caps: &vk::SurfaceCapabilitiesKHR, wanted: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: wanted
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: wanted
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

fn present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

// ── Frame ───────────────────────────────────────────────────

/// One acquired swapchain image, used as a dependency of the submission
/// that renders into it.
#[derive(Debug, Clone)]
pub struct PresentFrame {
    image_index: u32,
    image: vk::Image,
    acquire: vk::Semaphore,
    present: vk::Semaphore,
    swapchain: vk::SwapchainKHR,
    extent: vk::Extent2D,
    stale: Arc<AtomicBool>,
}

impl PresentFrame {
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn acquire_semaphore(&self) -> vk::Semaphore {
        self.acquire
    }

    pub fn present_semaphore(&self) -> vk::Semaphore {
        self.present
    }
}

impl SubmitDependency for PresentFrame {
    fn prepare(&self, _queue: &Queue) -> Result<Prepared> {
        Ok(Prepared {
            wait: Some(WaitPoint {
                semaphore: self.acquire,
                stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            }),
            signal: Some(self.present),
        })
    }

    fn submitted(&self, queue: &Queue) -> Result<()> {
        match queue.present(self.swapchain, self.image_index, self.present) {
            Ok(false) => Ok(()),
            Ok(true) => {
                debug!("swapchain suboptimal on present");
                self.stale.store(true, Ordering::Release);
                Ok(())
            }
            Err(result) if is_surface_stale(result) => {
                warn!(?result, "swapchain out of date on present");
                self.stale.store(true, Ordering::Release);
                Ok(())
            }
            Err(result) => Err(GpuError::Driver {
                call: "vkQueuePresentKHR",
                result,
            }),
        }
    }
}
