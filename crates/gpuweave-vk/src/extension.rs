//! Instance and device extension plugins.
//!
//! Each plugin is tagged with the level it applies to. The driver asks the
//! plugins of that level to `prepare` the create request, then `attach`
//! after the instance or device exists, and `detach` in reverse order
//! before destroying it.

use std::ffi::{c_void, CStr, CString};

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collab::SurfaceProvider;
use crate::error::{DriverCall, GpuError, Result};
use crate::validation::{Severity, ValidationCollector};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    Instance,
    Device,
}

/// Layers, extensions and features requested for instance/device creation.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub layers: Vec<CString>,
    pub instance_extensions: Vec<CString>,
    pub device_extensions: Vec<CString>,
    pub descriptor_indexing: bool,
}

impl CreateRequest {
    fn add(list: &mut Vec<CString>, name: &CStr) {
        if !list.iter().any(|n| n.as_c_str() == name) {
            list.push(name.to_owned());
        }
    }

    pub fn add_layer(&mut self, name: &CStr) {
        Self::add(&mut self.layers, name);
    }

    pub fn add_instance_extension(&mut self, name: &CStr) {
        Self::add(&mut self.instance_extensions, name);
    }

    pub fn add_device_extension(&mut self, name: &CStr) {
        Self::add(&mut self.device_extensions, name);
    }
}

/// What the loader and the physical device offer.
pub trait CapabilityProbe {
    fn has_layer(&self, name: &CStr) -> bool;
    fn has_instance_extension(&self, name: &CStr) -> bool;
    /// Always false before a physical device has been chosen.
    fn has_device_extension(&self, name: &CStr) -> bool;
    fn supports_descriptor_indexing(&self) -> bool;
}

/// Driver objects available to `attach`/`detach`.
pub struct AttachContext<'a> {
    pub entry: &'a ash::Entry,
    pub instance: &'a ash::Instance,
    pub device: Option<&'a ash::Device>,
}

pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ExtensionKind;

    /// Whether creation must fail when the extension is unsupported.
    fn required(&self) -> bool {
        true
    }

    /// `Err` carries the reason the extension cannot be used.
    fn supported(&self, probe: &dyn CapabilityProbe) -> Result<(), String>;

    fn prepare(&self, probe: &dyn CapabilityProbe, request: &mut CreateRequest);

    fn attach(&self, _ctx: &AttachContext<'_>) -> Result<()> {
        Ok(())
    }

    fn detach(&self, _ctx: &AttachContext<'_>) {}

    /// Release anything left once the instance is gone.
    fn teardown(&self) {}
}

struct Slot {
    extension: Box<dyn Extension>,
    enabled: bool,
}

#[derive(Default)]
pub struct ExtensionList {
    slots: Vec<Slot>,
}

impl ExtensionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, extension: impl Extension + 'static) -> Self {
        self.push(extension);
        self
    }

    pub fn push(&mut self, extension: impl Extension + 'static) {
        self.slots.push(Slot {
            extension: Box::new(extension),
            enabled: false,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.extension.name()).collect()
    }

    /// Names of the extensions that passed `prepare_all`.
    pub fn enabled(&self) -> Vec<&'static str> {
        self.slots
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.extension.name())
            .collect()
    }

    fn enabled_of_kind(
        &self,
        kind: ExtensionKind,
    ) -> impl DoubleEndedIterator<Item = &dyn Extension> + '_ {
        self.slots
            .iter()
            .filter(move |s| s.enabled && s.extension.kind() == kind)
            .map(|s| s.extension.as_ref())
    }

    /// Let every extension of `kind` add to the request. Unsupported
    /// optional extensions are skipped; unsupported required ones fail.
    pub fn prepare_all(
        &mut self,
        kind: ExtensionKind,
        probe: &dyn CapabilityProbe,
        request: &mut CreateRequest,
    ) -> Result<()> {
        for slot in self.slots.iter_mut().filter(|s| s.extension.kind() == kind) {
            let ext = slot.extension.as_ref();
            match ext.supported(probe) {
                Ok(()) => {
                    debug!(extension = ext.name(), "preparing extension");
                    ext.prepare(probe, request);
                    slot.enabled = true;
                }
                Err(reason) if ext.required() => {
                    return Err(GpuError::Configuration(format!(
                        "extension {} unavailable: {reason}",
                        ext.name()
                    )));
                }
                Err(reason) => {
                    warn!(extension = ext.name(), %reason, "optional extension unavailable");
                    slot.enabled = false;
                }
            }
        }
        Ok(())
    }

    pub fn attach_all(&self, kind: ExtensionKind, ctx: &AttachContext<'_>) -> Result<()> {
        for ext in self.enabled_of_kind(kind) {
            ext.attach(ctx)?;
        }
        Ok(())
    }

    pub fn detach_all(&self, kind: ExtensionKind, ctx: &AttachContext<'_>) {
        for ext in self.enabled_of_kind(kind).rev() {
            ext.detach(ctx);
        }
    }

    pub fn teardown_all(&self) {
        for slot in self.slots.iter().rev() {
            slot.extension.teardown();
        }
    }

    /// Per-extension validity, `Err` holding the reason.
    pub fn report(&self, probe: &dyn CapabilityProbe) -> Vec<(&'static str, Result<(), String>)> {
        self.slots
            .iter()
            .map(|s| (s.extension.name(), s.extension.supported(probe)))
            .collect()
    }
}

// ── Validation ──────────────────────────────────────────────

struct Messenger {
    loader: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

/// Khronos validation layer plus a debug messenger that feeds a
/// [`ValidationCollector`]. Optional: skipped when the layer is missing.
pub struct ValidationExtension {
    // Boxed so the address handed to the messenger stays put.
    sink: Box<ValidationCollector>,
    messenger: Mutex<Option<Messenger>>,
}

impl ValidationExtension {
    pub fn new(collector: ValidationCollector) -> Self {
        Self {
            sink: Box::new(collector),
            messenger: Mutex::new(None),
        }
    }

    pub fn collector(&self) -> &ValidationCollector {
        &self.sink
    }
}

impl Extension for ValidationExtension {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Instance
    }

    fn required(&self) -> bool {
        false
    }

    fn supported(&self, probe: &dyn CapabilityProbe) -> Result<(), String> {
        if !probe.has_layer(VALIDATION_LAYER) {
            return Err(format!("layer {} not installed", VALIDATION_LAYER.to_string_lossy()));
        }
        if !probe.has_instance_extension(ash::ext::debug_utils::NAME) {
            return Err("VK_EXT_debug_utils not available".to_string());
        }
        Ok(())
    }

    fn prepare(&self, _probe: &dyn CapabilityProbe, request: &mut CreateRequest) {
        request.add_layer(VALIDATION_LAYER);
        request.add_instance_extension(ash::ext::debug_utils::NAME);
    }

    fn attach(&self, ctx: &AttachContext<'_>) -> Result<()> {
        let loader = ash::ext::debug_utils::Instance::new(ctx.entry, ctx.instance);
        let user_data = self.sink.as_ref() as *const ValidationCollector as *mut c_void;
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(user_data);
        let handle = unsafe { loader.create_debug_utils_messenger(&info, None) }
            .call("vkCreateDebugUtilsMessengerEXT")?;
        info!("validation messenger attached");
        *self.messenger.lock() = Some(Messenger { loader, handle });
        Ok(())
    }

    fn detach(&self, _ctx: &AttachContext<'_>) {
        if let Some(m) = self.messenger.lock().take() {
            unsafe { m.loader.destroy_debug_utils_messenger(m.handle, None) };
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || user_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: user_data is the boxed collector owned by the ValidationExtension,
    // which destroys the messenger before dropping it.
    let collector = unsafe { &*(user_data as *const ValidationCollector) };
    // SAFETY: the loader passes a valid callback-data struct for the call's duration.
    let p_message = unsafe { (*data).p_message };
    let message = if p_message.is_null() {
        String::new()
    } else {
        // SAFETY: p_message is a NUL-terminated string owned by the loader.
        unsafe { CStr::from_ptr(p_message) }
            .to_string_lossy()
            .into_owned()
    };
    let severity = if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        Severity::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        Severity::Warning
    } else {
        Severity::Info
    };
    collector.report(severity, message);
    vk::FALSE
}

// ── Descriptor indexing ─────────────────────────────────────

/// Partially bound, update-after-bind and runtime-sized descriptor arrays.
#[derive(Debug, Default)]
pub struct DescriptorIndexingExtension;

impl Extension for DescriptorIndexingExtension {
    fn name(&self) -> &'static str {
        "descriptor-indexing"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Device
    }

    fn supported(&self, probe: &dyn CapabilityProbe) -> Result<(), String> {
        if !probe.has_device_extension(ash::ext::descriptor_indexing::NAME) {
            return Err("VK_EXT_descriptor_indexing not available".to_string());
        }
        if !probe.supports_descriptor_indexing() {
            return Err("descriptor indexing features not supported".to_string());
        }
        Ok(())
    }

    fn prepare(&self, _probe: &dyn CapabilityProbe, request: &mut CreateRequest) {
        request.add_device_extension(ash::ext::descriptor_indexing::NAME);
        request.descriptor_indexing = true;
    }
}

// ── Presentation ────────────────────────────────────────────

/// Instance extensions named by the windowing layer.
pub struct SurfaceExtension {
    names: Vec<&'static CStr>,
}

impl SurfaceExtension {
    pub fn new(provider: &dyn SurfaceProvider) -> Self {
        Self {
            names: provider.instance_extensions(),
        }
    }

    pub fn from_names(names: Vec<&'static CStr>) -> Self {
        Self { names }
    }
}

impl Extension for SurfaceExtension {
    fn name(&self) -> &'static str {
        "surface"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Instance
    }

    fn supported(&self, probe: &dyn CapabilityProbe) -> Result<(), String> {
        match self.names.iter().find(|n| !probe.has_instance_extension(n)) {
            Some(missing) => Err(format!("{} not available", missing.to_string_lossy())),
            None => Ok(()),
        }
    }

    fn prepare(&self, _probe: &dyn CapabilityProbe, request: &mut CreateRequest) {
        for name in &self.names {
            request.add_instance_extension(name);
        }
    }
}

#[derive(Debug, Default)]
pub struct SwapchainExtension;

impl Extension for SwapchainExtension {
    fn name(&self) -> &'static str {
        "swapchain"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Device
    }

    fn supported(&self, probe: &dyn CapabilityProbe) -> Result<(), String> {
        if probe.has_device_extension(ash::khr::swapchain::NAME) {
            Ok(())
        } else {
            Err("VK_KHR_swapchain not available".to_string())
        }
    }

    fn prepare(&self, _probe: &dyn CapabilityProbe, request: &mut CreateRequest) {
        request.add_device_extension(ash::khr::swapchain::NAME);
    }
}

/// Extension list matching the configuration flags.
pub fn standard_extensions(
    config: &gpuweave_core::GpuweaveConfig,
    validation: &ValidationCollector,
    surface: Option<&dyn SurfaceProvider>,
) -> ExtensionList {
    let mut list = ExtensionList::new();
    if config.application.validation {
        list.push(ValidationExtension::new(validation.clone()));
    }
    if config.application.descriptor_indexing {
        list.push(DescriptorIndexingExtension);
    }
    if let Some(provider) = surface {
        list.push(SurfaceExtension::new(provider));
        list.push(SwapchainExtension);
    }
    list
}
