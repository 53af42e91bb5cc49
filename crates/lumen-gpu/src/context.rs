//! Device context.
//!
//! The host creates the instance, device and queue; the context borrows them
//! for the lifetime of the renderer and owns only the allocator.

use crate::capabilities::GpuCapabilities;
use crate::config::GpuConfig;
use crate::error::Result;
use crate::memory::{AllocatorStats, DeviceAllocator};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared handles every pass needs.
pub struct DeviceContext {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    queue: vk::Queue,
    queue_family: u32,
    capabilities: GpuCapabilities,
    allocator: Mutex<DeviceAllocator>,
    config: GpuConfig,
}

impl DeviceContext {
    /// Wrap a ready device.
    ///
    /// Fails with `FeatureNotSupported` when the device lacks any feature
    /// [`GpuCapabilities::missing_requirement`] checks. Those features must
    /// also have been enabled at device creation.
    ///
    /// # Safety
    /// All handles must be valid and outlive the context. `queue` must belong
    /// to `queue_family` and support graphics.
    pub unsafe fn new(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: Arc<ash::Device>,
        queue: vk::Queue,
        queue_family: u32,
        config: GpuConfig,
    ) -> Result<Self> {
        config.validate()?;

        let capabilities = GpuCapabilities::query(&instance, physical_device);
        capabilities.require()?;
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let allocator = DeviceAllocator::new(
            &instance,
            device.clone(),
            physical_device,
            config.log_memory_information,
        )?;

        Ok(Self {
            instance,
            physical_device,
            device,
            queue,
            queue_family,
            capabilities,
            allocator: Mutex::new(allocator),
            config,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Graphics queue the passes submit to.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    /// Get access to the allocator.
    pub fn allocator(&self) -> &Mutex<DeviceAllocator> {
        &self.allocator
    }

    /// Current allocation counters.
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.lock().stats()
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        // Memory must go before the host destroys the device.
        self.allocator.lock().shutdown();
    }
}
