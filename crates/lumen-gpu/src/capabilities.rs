//! Device capability checks.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Features the passes rely on.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,

    /// `dynamicRendering` (Vulkan 1.3 core feature).
    pub supports_dynamic_rendering: bool,
    /// `synchronization2` (Vulkan 1.3 core feature).
    pub supports_synchronization2: bool,
    /// `multiview` (Vulkan 1.1 core feature).
    pub supports_multiview: bool,
    /// `separateDepthStencilLayouts` (Vulkan 1.2 core feature), needed for
    /// `DEPTH_ATTACHMENT_OPTIMAL`.
    pub supports_separate_depth_stencil_layouts: bool,
    /// `maxMultiviewViewCount`.
    pub max_multiview_view_count: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
}

impl GpuCapabilities {
    /// Views the cubemap pass renders at once.
    pub const CUBE_VIEWS: u32 = 6;

    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let mut multiview_properties = vk::PhysicalDeviceMultiviewProperties::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut multiview_properties);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;
        let max_multiview_view_count = multiview_properties.max_multiview_view_count;

        let api_version = properties.api_version;
        let (
            supports_multiview,
            supports_separate_depth_stencil_layouts,
            supports_dynamic_rendering,
            supports_synchronization2,
        ) = if version_at_least(api_version, 1, 3) {
            let mut features11 = vk::PhysicalDeviceVulkan11Features::default();
            let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
            let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut features11)
                .push_next(&mut features12)
                .push_next(&mut features13);
            instance.get_physical_device_features2(physical_device, &mut features2);
            (
                features11.multiview == vk::TRUE,
                features12.separate_depth_stencil_layouts == vk::TRUE,
                features13.dynamic_rendering == vk::TRUE,
                features13.synchronization2 == vk::TRUE,
            )
        } else {
            (false, false, false, false)
        };

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            api_version,
            supports_dynamic_rendering,
            supports_synchronization2,
            supports_multiview,
            supports_separate_depth_stencil_layouts,
            max_multiview_view_count,
            device_local_memory_mb,
        }
    }

    /// First missing requirement, if any.
    pub fn missing_requirement(&self) -> Option<&'static str> {
        if !version_at_least(self.api_version, 1, 3) {
            Some("Vulkan 1.3")
        } else if !self.supports_dynamic_rendering {
            Some("dynamicRendering")
        } else if !self.supports_synchronization2 {
            Some("synchronization2")
        } else if !self.supports_multiview {
            Some("multiview")
        } else if self.max_multiview_view_count < Self::CUBE_VIEWS {
            Some("maxMultiviewViewCount >= 6")
        } else if !self.supports_separate_depth_stencil_layouts {
            Some("separateDepthStencilLayouts")
        } else {
            None
        }
    }

    /// Whether the device can run both passes.
    pub fn meets_requirements(&self) -> bool {
        self.missing_requirement().is_none()
    }

    /// Fail with `FeatureNotSupported` naming the first missing requirement.
    pub fn require(&self) -> Result<()> {
        match self.missing_requirement() {
            Some(missing) => Err(GpuError::FeatureNotSupported(format!(
                "{}: {missing}",
                self.device_name
            ))),
            None => Ok(()),
        }
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - {} multiview views",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.max_multiview_view_count,
        )
    }
}

fn version_at_least(version: u32, major: u32, minor: u32) -> bool {
    let (v_major, v_minor) = (
        vk::api_version_major(version),
        vk::api_version_minor(version),
    );
    v_major > major || (v_major == major && v_minor >= minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "test device".to_string(),
            api_version: vk::make_api_version(0, 1, 3, 250),
            supports_dynamic_rendering: true,
            supports_synchronization2: true,
            supports_multiview: true,
            supports_separate_depth_stencil_layouts: true,
            max_multiview_view_count: 6,
            device_local_memory_mb: 8192,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn full_feature_set_meets_requirements() {
        assert!(capable().meets_requirements());
        assert!(capable().require().is_ok());
    }

    #[test]
    fn too_few_views_is_reported() {
        let mut caps = capable();
        caps.max_multiview_view_count = 4;
        assert_eq!(
            caps.missing_requirement(),
            Some("maxMultiviewViewCount >= 6")
        );
        assert!(matches!(
            caps.require(),
            Err(GpuError::FeatureNotSupported(_))
        ));
    }

    #[test]
    fn depth_only_layouts_are_required() {
        let mut caps = capable();
        caps.supports_separate_depth_stencil_layouts = false;
        assert_eq!(
            caps.missing_requirement(),
            Some("separateDepthStencilLayouts")
        );
        assert!(caps.require().is_err());
    }

    #[test]
    fn old_api_version_fails_first() {
        let mut caps = capable();
        caps.api_version = vk::make_api_version(0, 1, 2, 0);
        caps.supports_multiview = false;
        assert_eq!(caps.missing_requirement(), Some("Vulkan 1.3"));
    }

    #[test]
    fn version_comparison() {
        assert!(version_at_least(vk::make_api_version(0, 2, 0, 0), 1, 3));
        assert!(!version_at_least(vk::make_api_version(0, 1, 2, 9), 1, 3));
    }
}
