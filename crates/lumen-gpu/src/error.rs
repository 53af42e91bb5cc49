//! GPU error types.

use ash::vk;
use thiserror::Error;

use crate::barrier::ImageId;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error not covered by a more specific variant.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// The device was lost. Not recoverable in place.
    #[error("Device lost")]
    DeviceLost,

    /// Device memory exhausted.
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// Memory allocation failed for a reason other than exhaustion.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Resource usage flags or parameters the backend cannot honor together.
    #[error("Invalid usage combination: {0}")]
    InvalidUsageCombination(String),

    /// A required pipeline field was left unset.
    #[error("Incomplete pipeline state: missing {0}")]
    IncompletePipelineState(&'static str),

    /// Two descriptor bindings share one slot.
    #[error("Duplicate descriptor binding slot {0}")]
    DuplicateBindingSlot(u32),

    /// A descriptor write does not match the set layout.
    #[error("Invalid descriptor binding: {0}")]
    InvalidBinding(String),

    /// The descriptor pool has no capacity left for the request.
    #[error("Descriptor pool exhausted: {0}")]
    PoolExhausted(String),

    /// A descriptor set was written while a frame referencing it is in flight.
    #[error("Descriptor set for frame slot {slot} is still in flight")]
    DescriptorInFlight { slot: usize },

    /// A transition or access named an image the sequencer never registered.
    #[error("Unknown resource handle: {0:?}")]
    UnknownResourceHandle(ImageId),

    /// An operation declared a layout that differs from the tracked one.
    #[error("Layout mismatch on {image:?}: expected {expected:?}, tracked {actual:?}")]
    LayoutMismatch {
        image: ImageId,
        expected: vk::ImageLayout,
        actual: vk::ImageLayout,
    },

    /// Shader bytecode could not be loaded.
    #[error("Shader load failed: {0}")]
    ShaderLoad(String),

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Required device feature missing.
    #[error("Required feature not supported: {0}")]
    FeatureNotSupported(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Whether the error requires tearing the device down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                Self::PoolExhausted(format!("{result}"))
            }
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_results_map_to_taxonomy() {
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GpuError::OutOfDeviceMemory
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            GpuError::PoolExhausted(_)
        ));
        assert!(matches!(
            GpuError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }

    #[test]
    fn only_device_loss_is_fatal() {
        assert!(GpuError::DeviceLost.is_fatal());
        assert!(!GpuError::OutOfDeviceMemory.is_fatal());
        assert!(!GpuError::DuplicateBindingSlot(0).is_fatal());
    }
}
