//! Runtime configuration.

use crate::error::{GpuError, Result};
use serde::{Deserialize, Serialize};

/// Settings fixed when the device context and passes are created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Frames the host may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Descriptor sets reserved in each pass pool beyond one per frame.
    pub extra_descriptor_sets: u32,
    /// Have the allocator log the device's memory heaps at start-up.
    pub log_memory_information: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            extra_descriptor_sets: 0,
            log_memory_information: cfg!(debug_assertions),
        }
    }
}

impl GpuConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn extra_descriptor_sets(mut self, sets: u32) -> Self {
        self.extra_descriptor_sets = sets;
        self
    }

    pub fn log_memory_information(mut self, enable: bool) -> Self {
        self.log_memory_information = enable;
        self
    }

    /// Reject settings no pass can work with.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
