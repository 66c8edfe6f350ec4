use ash::vk;

use gpuweave_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// Missing queue, memory type, extension or other device capability.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation not legal in the object's current lifecycle state.
    #[error("resource state error: {0}")]
    ResourceState(String),

    #[error("{call} failed: {result:?}")]
    Driver {
        call: &'static str,
        result: vk::Result,
    },

    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: &'static str, timeout_ms: u64 },

    #[error("no access mask is known for image layout {0:?}")]
    UnmappedLayout(vk::ImageLayout),

    #[error("validation error: {0}")]
    Validation(String),

    /// Failure reported by the windowing, image decode or shader compile layer.
    #[error("{what} failed: {message}")]
    Collaborator { what: &'static str, message: String },

    #[error("failed to load the Vulkan loader: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type Result<T, E = GpuError> = std::result::Result<T, E>;

/// Attach the driver entry point name to a raw result code.
pub(crate) trait DriverCall<T> {
    fn call(self, call: &'static str) -> Result<T>;
}

impl<T> DriverCall<T> for std::result::Result<T, vk::Result> {
    fn call(self, call: &'static str) -> Result<T> {
        self.map_err(|result| GpuError::Driver { call, result })
    }
}

/// Surface results that mean "rebuild the swapchain", not failure.
pub fn is_surface_stale(result: vk::Result) -> bool {
    matches!(
        result,
        vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR
    )
}
