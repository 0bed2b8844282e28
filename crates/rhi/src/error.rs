//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
///
/// Variants map onto the failure classes of the synchronization core:
/// configuration errors ([`RhiError::Configuration`], [`RhiError::NoSuitableGpu`])
/// are fatal at startup; protocol violations ([`RhiError::InvalidState`]) indicate
/// a logic bug in a pass and are never retried; [`RhiError::SurfaceOutOfDate`] is
/// the one recoverable kind, handled by the caller's resize path;
/// [`RhiError::DeviceLost`] is unrecoverable at this layer.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(ash::vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// The GPU device was lost; the graphics context must be torn down
    #[error("GPU device lost")]
    DeviceLost,

    /// The presentation surface is stale and must be recreated
    #[error("Presentation surface out of date")]
    SurfaceOutOfDate,

    /// Protocol violation: an object was used outside its legal lifecycle
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Startup configuration error (e.g. a required queue capability
    /// combination the device does not expose)
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<ash::vk::Result> for RhiError {
    fn from(result: ash::vk::Result) -> Self {
        use ash::vk;
        match result {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                RhiError::SurfaceOutOfDate
            }
            other => RhiError::Vulkan(other),
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn test_device_lost_is_distinguished() {
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_DEVICE_LOST),
            RhiError::DeviceLost
        ));
    }

    #[test]
    fn test_out_of_date_is_distinguished() {
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            RhiError::SurfaceOutOfDate
        ));
    }

    #[test]
    fn test_other_vulkan_errors_pass_through() {
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            RhiError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
    }
}
