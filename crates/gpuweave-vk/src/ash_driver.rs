//! The production [`Driver`]: real Vulkan through `ash`.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;
use gpuweave_core::GpuweaveConfig;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collab::SurfaceProvider;
use crate::device::Device;
use crate::driver::{
    DescriptorInfo, DescriptorWrite, Driver, DriverResult, LayoutBinding, QueueFamilyInfo,
    QueueSubmission, SwapchainRequest,
};
use crate::error::{DriverCall, GpuError, Result};
use crate::extension::{
    standard_extensions, AttachContext, CapabilityProbe, CreateRequest, ExtensionKind,
    ExtensionList,
};
use crate::recorded::RecordedCommand;
use crate::resource::{ImageDescription, ImageRange};
use crate::validation::ValidationCollector;

const QUEUE_PRIORITIES: [f32; 3] = [1.0, 0.5, 0.25];

// ── Capability probe ────────────────────────────────────────

#[derive(Debug, Default)]
struct AshProbe {
    layers: Vec<CString>,
    instance_extensions: Vec<CString>,
    device_extensions: Vec<CString>,
    descriptor_indexing: bool,
}

impl AshProbe {
    fn for_entry(entry: &ash::Entry) -> Result<Self> {
        let layers = unsafe { entry.enumerate_instance_layer_properties() }
            .call("vkEnumerateInstanceLayerProperties")?
            .iter()
            .filter_map(|p| p.layer_name_as_c_str().ok().map(CStr::to_owned))
            .collect();
        let instance_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
            .call("vkEnumerateInstanceExtensionProperties")?
            .iter()
            .filter_map(|p| p.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();
        Ok(Self {
            layers,
            instance_extensions,
            ..Self::default()
        })
    }

    fn probe_device(&mut self, instance: &ash::Instance, physical: vk::PhysicalDevice) -> Result<()> {
        self.device_extensions = unsafe { instance.enumerate_device_extension_properties(physical) }
            .call("vkEnumerateDeviceExtensionProperties")?
            .iter()
            .filter_map(|p| p.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();

        let mut indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default();
        let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut indexing);
        unsafe { instance.get_physical_device_features2(physical, &mut features) };
        self.descriptor_indexing = indexing.descriptor_binding_partially_bound == vk::TRUE
            && indexing.runtime_descriptor_array == vk::TRUE
            && indexing.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
            && indexing.descriptor_binding_storage_buffer_update_after_bind == vk::TRUE;
        Ok(())
    }
}

impl CapabilityProbe for AshProbe {
    fn has_layer(&self, name: &CStr) -> bool {
        self.layers.iter().any(|l| l.as_c_str() == name)
    }

    fn has_instance_extension(&self, name: &CStr) -> bool {
        self.instance_extensions.iter().any(|e| e.as_c_str() == name)
    }

    fn has_device_extension(&self, name: &CStr) -> bool {
        self.device_extensions.iter().any(|e| e.as_c_str() == name)
    }

    fn supports_descriptor_indexing(&self) -> bool {
        self.descriptor_indexing
    }
}

// ── Physical device report ──────────────────────────────────

/// What `gpuweave devices` prints for each adapter.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub kind: &'static str,
    pub api_version: String,
    pub device_local_bytes: u64,
    pub queue_families: Vec<QueueFamilyInfo>,
    /// Validity of every extension in the list, `Err` holding the reason.
    pub extensions: Vec<(&'static str, std::result::Result<(), String>)>,
}

fn device_kind(kind: vk::PhysicalDeviceType) -> &'static str {
    match kind {
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
        vk::PhysicalDeviceType::CPU => "cpu",
        _ => "other",
    }
}

/// Enumerate every physical device and check `extensions` against each.
pub fn enumerate_devices(extensions: &ExtensionList) -> Result<Vec<DeviceInfo>> {
    let entry = unsafe { ash::Entry::load()? };
    let mut probe = AshProbe::for_entry(&entry)?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"gpuweave")
        .api_version(vk::make_api_version(0, 1, 2, 0));
    let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
    let instance = unsafe { entry.create_instance(&create_info, None) }.call("vkCreateInstance")?;

    let result = describe_devices(&instance, &mut probe, extensions);
    unsafe { instance.destroy_instance(None) };
    result
}

fn describe_devices(
    instance: &ash::Instance,
    probe: &mut AshProbe,
    extensions: &ExtensionList,
) -> Result<Vec<DeviceInfo>> {
    let physical_devices =
        unsafe { instance.enumerate_physical_devices() }.call("vkEnumeratePhysicalDevices")?;
    let mut devices = Vec::with_capacity(physical_devices.len());
    for (index, &pd) in physical_devices.iter().enumerate() {
        probe.probe_device(instance, pd)?;
        let props = unsafe { instance.get_physical_device_properties(pd) };
        let mem = unsafe { instance.get_physical_device_memory_properties(pd) };
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let device_local_bytes = mem.memory_heaps[..mem.memory_heap_count as usize]
            .iter()
            .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|h| h.size)
            .sum();
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(pd) }
            .iter()
            .enumerate()
            .map(|(i, f)| QueueFamilyInfo {
                index: i as u32,
                flags: f.queue_flags,
                queue_count: f.queue_count,
            })
            .collect();
        let info = DeviceInfo {
            index: index as u32,
            name,
            kind: device_kind(props.device_type),
            api_version: format!(
                "{}.{}.{}",
                vk::api_version_major(props.api_version),
                vk::api_version_minor(props.api_version),
                vk::api_version_patch(props.api_version)
            ),
            device_local_bytes,
            queue_families,
            extensions: extensions.report(&*probe),
        };
        info!(
            index,
            name = %info.name,
            kind = info.kind,
            vram_mb = info.device_local_bytes / (1024 * 1024),
            "found device"
        );
        devices.push(info);
    }
    Ok(devices)
}

/// Open the configured device with the standard extension list.
pub fn open_device(
    config: &GpuweaveConfig,
    validation: ValidationCollector,
    surface: Option<&dyn SurfaceProvider>,
) -> Result<Device> {
    let extensions = standard_extensions(config, &validation, surface);
    let driver = AshDriver::new(config, extensions)?;
    Device::new(Arc::new(driver), config.clone(), validation)
}

// ── Driver ──────────────────────────────────────────────────

struct Opened {
    physical: vk::PhysicalDevice,
    device: ash::Device,
    families: Vec<QueueFamilyInfo>,
    swapchain_enabled: bool,
}

pub struct AshDriver {
    entry: ash::Entry,
    instance: ash::Instance,
    physical: vk::PhysicalDevice,
    device: ash::Device,
    memory_types: Vec<vk::MemoryType>,
    families: Vec<QueueFamilyInfo>,
    timestamp_period: f32,
    surface_loader: Option<ash::khr::surface::Instance>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    extensions: ExtensionList,
    surfaces: Mutex<Vec<vk::SurfaceKHR>>,
}

// SAFETY: Vulkan handles are valid across threads; every call that needs
// external synchronization (queue submit/present) is serialized by `Queue`.
unsafe impl Send for AshDriver {}
unsafe impl Sync for AshDriver {}

impl AshDriver {
    pub fn new(config: &GpuweaveConfig, mut extensions: ExtensionList) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };
        let mut probe = AshProbe::for_entry(&entry)?;
        let mut request = CreateRequest::default();
        extensions.prepare_all(ExtensionKind::Instance, &probe, &mut request)?;

        let app_name = CString::new(config.application.name.as_str())
            .map_err(|e| GpuError::Configuration(e.to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"gpuweave")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 2, 0));
        let layers: Vec<*const std::ffi::c_char> =
            request.layers.iter().map(|l| l.as_ptr()).collect();
        let instance_extensions: Vec<*const std::ffi::c_char> =
            request.instance_extensions.iter().map(|e| e.as_ptr()).collect();
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&instance_extensions);
        let instance =
            unsafe { entry.create_instance(&create_info, None) }.call("vkCreateInstance")?;
        info!(
            layers = request.layers.len(),
            extensions = request.instance_extensions.len(),
            "created Vulkan instance"
        );

        let ctx = AttachContext {
            entry: &entry,
            instance: &instance,
            device: None,
        };
        if let Err(e) = extensions.attach_all(ExtensionKind::Instance, &ctx) {
            unsafe { instance.destroy_instance(None) };
            return Err(e);
        }

        let surface_enabled = request
            .instance_extensions
            .iter()
            .any(|e| e.as_c_str() == ash::khr::surface::NAME);
        match Self::open(config, &entry, &instance, &mut probe, &mut extensions, request) {
            Ok(opened) => {
                let Opened {
                    physical,
                    device,
                    families,
                    swapchain_enabled,
                } = opened;
                let mem = unsafe { instance.get_physical_device_memory_properties(physical) };
                let props = unsafe { instance.get_physical_device_properties(physical) };
                let memory_types = mem.memory_types[..mem.memory_type_count as usize].to_vec();
                let surface_loader =
                    surface_enabled.then(|| ash::khr::surface::Instance::new(&entry, &instance));
                let swapchain_loader = swapchain_enabled
                    .then(|| ash::khr::swapchain::Device::new(&instance, &device));
                Ok(Self {
                    entry,
                    instance,
                    physical,
                    device,
                    memory_types,
                    families,
                    timestamp_period: props.limits.timestamp_period,
                    surface_loader,
                    swapchain_loader,
                    extensions,
                    surfaces: Mutex::new(Vec::new()),
                })
            }
            Err(e) => {
                let ctx = AttachContext {
                    entry: &entry,
                    instance: &instance,
                    device: None,
                };
                extensions.detach_all(ExtensionKind::Instance, &ctx);
                extensions.teardown_all();
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn open(
        config: &GpuweaveConfig,
        entry: &ash::Entry,
        instance: &ash::Instance,
        probe: &mut AshProbe,
        extensions: &mut ExtensionList,
        mut request: CreateRequest,
    ) -> Result<Opened> {
        let physical_devices =
            unsafe { instance.enumerate_physical_devices() }.call("vkEnumeratePhysicalDevices")?;
        let physical = *physical_devices
            .get(config.device.index as usize)
            .ok_or_else(|| {
                GpuError::Configuration(format!(
                    "no physical device at index {} ({} found)",
                    config.device.index,
                    physical_devices.len()
                ))
            })?;
        probe.probe_device(instance, physical)?;
        extensions.prepare_all(ExtensionKind::Device, &*probe, &mut request)?;

        let family_props =
            unsafe { instance.get_physical_device_queue_family_properties(physical) };
        let priorities: Vec<Vec<f32>> = family_props
            .iter()
            .map(|f| {
                let count = f.queue_count.min(config.device.queues_per_family) as usize;
                (0..count)
                    .map(|i| QUEUE_PRIORITIES[i.min(QUEUE_PRIORITIES.len() - 1)])
                    .collect()
            })
            .collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = priorities
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_empty())
            .map(|(i, p)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(i as u32)
                    .queue_priorities(p)
            })
            .collect();
        let families: Vec<QueueFamilyInfo> = family_props
            .iter()
            .enumerate()
            .filter(|(i, _)| !priorities[*i].is_empty())
            .map(|(i, f)| QueueFamilyInfo {
                index: i as u32,
                flags: f.queue_flags,
                queue_count: priorities[i].len() as u32,
            })
            .collect();

        let device_extensions: Vec<*const std::ffi::c_char> =
            request.device_extensions.iter().map(|e| e.as_ptr()).collect();
        let mut indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default()
            .descriptor_binding_partially_bound(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true);
        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions);
        if request.descriptor_indexing {
            create_info = create_info.push_next(&mut indexing);
        }
        let device = unsafe { instance.create_device(physical, &create_info, None) }
            .call("vkCreateDevice")?;

        let ctx = AttachContext {
            entry,
            instance,
            device: Some(&device),
        };
        if let Err(e) = extensions.attach_all(ExtensionKind::Device, &ctx) {
            unsafe { device.destroy_device(None) };
            return Err(e);
        }
        info!(
            device = config.device.index,
            queues = families.iter().map(|f| f.queue_count).sum::<u32>(),
            extensions = request.device_extensions.len(),
            "created Vulkan device"
        );
        let swapchain_enabled = request
            .device_extensions
            .iter()
            .any(|e| e.as_c_str() == ash::khr::swapchain::NAME);
        Ok(Opened {
            physical,
            device,
            families,
            swapchain_enabled,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical
    }

    /// Take ownership of a surface created on this driver's instance; it is
    /// destroyed together with the instance.
    pub fn adopt_surface(&self, surface: vk::SurfaceKHR) {
        self.surfaces.lock().push(surface);
    }

    fn swapchain_loader(&self) -> DriverResult<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    fn surface_loader(&self) -> DriverResult<&ash::khr::surface::Instance> {
        self.surface_loader
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            warn!(?e, "device_wait_idle failed during teardown");
        }
        let ctx = AttachContext {
            entry: &self.entry,
            instance: &self.instance,
            device: Some(&self.device),
        };
        self.extensions.detach_all(ExtensionKind::Device, &ctx);
        unsafe { self.device.destroy_device(None) };

        if let Some(loader) = &self.surface_loader {
            for surface in self.surfaces.lock().drain(..) {
                unsafe { loader.destroy_surface(surface, None) };
            }
        }
        let ctx = AttachContext {
            entry: &self.entry,
            instance: &self.instance,
            device: None,
        };
        self.extensions.detach_all(ExtensionKind::Instance, &ctx);
        self.extensions.teardown_all();
        unsafe { self.instance.destroy_instance(None) };
        debug!("Vulkan instance destroyed");
    }
}

impl Driver for AshDriver {
    fn memory_types(&self) -> Vec<vk::MemoryType> {
        self.memory_types.clone()
    }

    fn queue_families(&self) -> Vec<QueueFamilyInfo> {
        self.families.clone()
    }

    fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, index) }
    }

    fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    // ── Buffer / Image ──────────────────────────────────────

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> DriverResult<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn buffer_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn create_image(
        &self,
        desc: &ImageDescription,
        usage: vk::ImageUsageFlags,
    ) -> DriverResult<vk::Image> {
        let image_type = if desc.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let flags = if desc.layers >= 6 && desc.layers % 6 == 0 && desc.width == desc.height {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(image_type)
            .format(desc.format)
            .extent(desc.extent())
            .mip_levels(desc.mip_levels)
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        unsafe { self.device.create_image(&info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn image_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        desc: &ImageDescription,
        range: &ImageRange,
        view_type: vk::ImageViewType,
        aspect: vk::ImageAspectFlags,
    ) -> DriverResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(range.subresource(aspect));
        unsafe { self.device.create_image_view(&info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, address_mode: vk::SamplerAddressMode) -> DriverResult<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .max_lod(8.0);
        unsafe { self.device.create_sampler(&info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    // ── Memory ──────────────────────────────────────────────

    fn allocate_memory(&self, size: u64, memory_type: u32) -> DriverResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: u64) -> DriverResult<*mut u8> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
        }?;
        Ok(ptr.cast())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> DriverResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> DriverResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    // ── Fence / Semaphore ───────────────────────────────────

    fn create_fence(&self, signaled: bool) -> DriverResult<vk::Fence> {
        let mut info = vk::FenceCreateInfo::default();
        if signaled {
            info = info.flags(vk::FenceCreateFlags::SIGNALED);
        }
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn reset_fence(&self, fence: vk::Fence) -> DriverResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> DriverResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> DriverResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn create_semaphore(&self) -> DriverResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    // ── Command recording ───────────────────────────────────

    fn create_command_pool(
        &self,
        family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> DriverResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(flags);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> DriverResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> DriverResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        unsafe { self.device.allocate_command_buffers(&info) }?
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> DriverResult<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(cmd, &info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> DriverResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn record(&self, cb: vk::CommandBuffer, command: &RecordedCommand) {
        let dev = &self.device;
        match command {
            RecordedCommand::BindPipeline {
                bind_point,
                pipeline,
            } => unsafe {
                dev.cmd_bind_pipeline(cb, *bind_point, *pipeline);
            },

            RecordedCommand::BindDescriptorSets {
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            } => unsafe {
                dev.cmd_bind_descriptor_sets(
                    cb,
                    *bind_point,
                    *layout,
                    *first_set,
                    sets,
                    dynamic_offsets,
                );
            },

            RecordedCommand::BindVertexBuffers {
                first_binding,
                buffers,
                offsets,
            } => unsafe {
                dev.cmd_bind_vertex_buffers(cb, *first_binding, buffers, offsets);
            },

            RecordedCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => unsafe {
                dev.cmd_bind_index_buffer(cb, *buffer, *offset, *index_type);
            },

            RecordedCommand::PushConstants {
                layout,
                stages,
                offset,
                data,
            } => unsafe {
                dev.cmd_push_constants(cb, *layout, *stages, *offset, data);
            },

            RecordedCommand::Dispatch {
                group_count_x,
                group_count_y,
                group_count_z,
            } => unsafe {
                dev.cmd_dispatch(cb, *group_count_x, *group_count_y, *group_count_z);
            },

            RecordedCommand::PipelineBarrier {
                src_stage,
                dst_stage,
                image_barriers,
            } => {
                let vk_img_barriers: Vec<vk::ImageMemoryBarrier> = image_barriers
                    .iter()
                    .map(|b| {
                        vk::ImageMemoryBarrier::default()
                            .src_access_mask(b.src_access)
                            .dst_access_mask(b.dst_access)
                            .old_layout(b.old_layout)
                            .new_layout(b.new_layout)
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .image(b.image)
                            .subresource_range(b.range)
                    })
                    .collect();
                unsafe {
                    dev.cmd_pipeline_barrier(
                        cb,
                        *src_stage,
                        *dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &vk_img_barriers,
                    );
                }
            }

            RecordedCommand::CopyBuffer { src, dst, regions } => unsafe {
                dev.cmd_copy_buffer(cb, *src, *dst, regions);
            },

            RecordedCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => unsafe {
                dev.cmd_copy_buffer_to_image(cb, *src, *dst, *dst_layout, regions);
            },

            RecordedCommand::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                regions,
            } => unsafe {
                dev.cmd_copy_image_to_buffer(cb, *src, *src_layout, *dst, regions);
            },

            RecordedCommand::ClearColorImage {
                image,
                layout,
                color,
                range,
            } => {
                let value = vk::ClearColorValue { float32: *color };
                unsafe {
                    dev.cmd_clear_color_image(cb, *image, *layout, &value, std::slice::from_ref(range));
                }
            }

            RecordedCommand::BeginRenderPass {
                render_pass,
                framebuffer,
                extent,
                clear_colors,
            } => {
                let clear_values: Vec<vk::ClearValue> = clear_colors
                    .iter()
                    .map(|c| vk::ClearValue {
                        color: vk::ClearColorValue { float32: *c },
                    })
                    .collect();
                let begin_info = vk::RenderPassBeginInfo::default()
                    .render_pass(*render_pass)
                    .framebuffer(*framebuffer)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: *extent,
                    })
                    .clear_values(&clear_values);
                unsafe {
                    dev.cmd_begin_render_pass(cb, &begin_info, vk::SubpassContents::INLINE);
                }
            }

            RecordedCommand::EndRenderPass => unsafe {
                dev.cmd_end_render_pass(cb);
            },

            RecordedCommand::SetViewport { viewport } => unsafe {
                dev.cmd_set_viewport(cb, 0, std::slice::from_ref(viewport));
            },

            RecordedCommand::SetScissor { scissor } => unsafe {
                dev.cmd_set_scissor(cb, 0, std::slice::from_ref(scissor));
            },

            RecordedCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                dev.cmd_draw(
                    cb,
                    *vertex_count,
                    *instance_count,
                    *first_vertex,
                    *first_instance,
                );
            },

            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                dev.cmd_draw_indexed(
                    cb,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                );
            },

            RecordedCommand::WriteTimestamp { stage, pool, query } => unsafe {
                dev.cmd_write_timestamp(cb, *stage, *pool, *query);
            },

            RecordedCommand::ResetQueryPool { pool, first, count } => unsafe {
                dev.cmd_reset_query_pool(cb, *pool, *first, *count);
            },
        }
    }

    // ── Queue ───────────────────────────────────────────────

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &QueueSubmission<'_>,
        fence: vk::Fence,
    ) -> DriverResult<()> {
        let info = vk::SubmitInfo::default()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores);
        unsafe { self.device.queue_submit(queue, &[info], fence) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn device_wait_idle(&self) -> DriverResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    // ── Descriptors ─────────────────────────────────────────

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
        update_after_bind: bool,
    ) -> DriverResult<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .enumerate()
            .map(|(i, b)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i as u32)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let flags: Vec<vk::DescriptorBindingFlags> = bindings.iter().map(|b| b.flags).collect();
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
        let mut info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        if update_after_bind {
            info = info
                .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                .push_next(&mut flags_info);
        }
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
        update_after_bind: bool,
    ) -> DriverResult<vk::DescriptorPool> {
        let flags = if update_after_bind {
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(flags)
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> DriverResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe { self.device.allocate_descriptor_sets(&info) }?
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn update_descriptor_set(&self, write: &DescriptorWrite) {
        let base = vk::WriteDescriptorSet::default()
            .dst_set(write.set)
            .dst_binding(write.binding)
            .dst_array_element(write.array_element)
            .descriptor_type(write.descriptor_type);
        match write.info {
            DescriptorInfo::Buffer {
                buffer,
                offset,
                range,
            } => {
                let infos = [vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                }];
                let w = base.buffer_info(&infos);
                unsafe { self.device.update_descriptor_sets(&[w], &[]) };
            }
            DescriptorInfo::Image {
                view,
                layout,
                sampler,
            } => {
                let infos = [vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }];
                let w = base.image_info(&infos);
                unsafe { self.device.update_descriptor_sets(&[w], &[]) };
            }
        }
    }

    // ── Queries / Shaders ───────────────────────────────────

    fn create_timestamp_pool(&self, count: u32) -> DriverResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        unsafe { self.device.create_query_pool(&info, None) }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    fn query_results(&self, pool: vk::QueryPool, count: u32) -> DriverResult<Vec<u64>> {
        let mut out = vec![0u64; count as usize];
        unsafe {
            self.device.get_query_pool_results(
                pool,
                0,
                &mut out,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }?;
        Ok(out)
    }

    fn create_shader_module(&self, code: &[u32]) -> DriverResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    // ── Surface / Swapchain ─────────────────────────────────

    fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> DriverResult<vk::SurfaceCapabilitiesKHR> {
        let loader = self.surface_loader()?;
        unsafe { loader.get_physical_device_surface_capabilities(self.physical, surface) }
    }

    fn surface_formats(&self, surface: vk::SurfaceKHR) -> DriverResult<Vec<vk::SurfaceFormatKHR>> {
        let loader = self.surface_loader()?;
        unsafe { loader.get_physical_device_surface_formats(self.physical, surface) }
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> DriverResult<vk::SwapchainKHR> {
        let loader = self.swapchain_loader()?;
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(request.surface)
            .min_image_count(request.min_image_count)
            .image_format(request.format.format)
            .image_color_space(request.format.color_space)
            .image_extent(request.extent)
            .image_array_layers(1)
            .image_usage(request.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(request.transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(request.present_mode)
            .clipped(true)
            .old_swapchain(request.old_swapchain);
        unsafe { loader.create_swapchain(&info, None) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Ok(loader) = self.swapchain_loader() {
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> DriverResult<Vec<vk::Image>> {
        let loader = self.swapchain_loader()?;
        unsafe { loader.get_swapchain_images(swapchain) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> DriverResult<(u32, bool)> {
        let loader = self.swapchain_loader()?;
        unsafe { loader.acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null()) }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> DriverResult<bool> {
        let loader = self.swapchain_loader()?;
        let waits = [wait];
        let swapchains = [swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { loader.queue_present(queue, &info) }
    }
}
