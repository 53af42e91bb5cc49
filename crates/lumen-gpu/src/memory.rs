//! Device resource allocation.
//!
//! Every buffer and image gets its own dedicated memory block. Ownership is
//! linear: the allocator hands out a [`DeviceBuffer`] or [`DeviceImage`] and
//! takes it back by value in `destroy_*`, so a resource cannot be freed twice.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use std::sync::Arc;

/// What a buffer will be bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
}

impl BufferUsage {
    /// Vulkan usage flags for this intent.
    pub fn flags(self) -> vk::BufferUsageFlags {
        match self {
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
    }
}

/// Check a buffer request before touching the device.
///
/// There is no staging path, so uniform buffers (rewritten every frame) must
/// be host-visible.
pub fn validate_buffer_request(size: u64, usage: BufferUsage, host_visible: bool) -> Result<()> {
    if size == 0 {
        return Err(GpuError::InvalidUsageCombination(
            "buffer size must be non-zero".to_string(),
        ));
    }
    if usage == BufferUsage::Uniform && !host_visible {
        return Err(GpuError::InvalidUsageCombination(
            "uniform buffers must be host-visible".to_string(),
        ));
    }
    Ok(())
}

/// Sampler parameters for sampled images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerDesc {
    pub filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

/// Image creation request.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    pub view_type: vk::ImageViewType,
    /// Create with `CUBE_COMPATIBLE` so the layers can later be viewed as a cube.
    pub cube_compatible: bool,
    pub sampler: Option<SamplerDesc>,
}

impl ImageDesc {
    /// A single-layer 2D image with optimal tiling.
    pub fn new_2d(format: vk::Format, extent: vk::Extent2D, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent,
            layers: 1,
            usage,
            tiling: vk::ImageTiling::OPTIMAL,
            view_type: vk::ImageViewType::TYPE_2D,
            cube_compatible: false,
            sampler: None,
        }
    }

    /// Set the array layer count and view the layers as a 2D array.
    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
        self
    }

    /// Mark the image cube compatible.
    pub fn cube_compatible(mut self) -> Self {
        self.cube_compatible = true;
        self
    }

    /// Attach a sampler.
    pub fn with_sampler(mut self, sampler: SamplerDesc) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Check the request before touching the device.
    pub fn validate(&self) -> Result<()> {
        if self.usage.is_empty() {
            return Err(GpuError::InvalidUsageCombination(
                "image usage must not be empty".to_string(),
            ));
        }
        if self.layers == 0 || self.extent.width == 0 || self.extent.height == 0 {
            return Err(GpuError::InvalidUsageCombination(format!(
                "degenerate image {}x{}x{}",
                self.extent.width, self.extent.height, self.layers
            )));
        }
        let is_cube_view = self.view_type == vk::ImageViewType::CUBE
            || self.view_type == vk::ImageViewType::CUBE_ARRAY;
        if is_cube_view && !self.cube_compatible {
            return Err(GpuError::InvalidUsageCombination(
                "cube views require a cube-compatible image".to_string(),
            ));
        }
        if self.cube_compatible
            && (self.layers % 6 != 0 || self.extent.width != self.extent.height)
        {
            return Err(GpuError::InvalidUsageCombination(format!(
                "cube-compatible images need square faces and a multiple of 6 layers, got {}x{}x{}",
                self.extent.width, self.extent.height, self.layers
            )));
        }
        if self.layers > 1 && self.view_type == vk::ImageViewType::TYPE_2D {
            return Err(GpuError::InvalidUsageCombination(
                "layered images need an array or cube view".to_string(),
            ));
        }
        if self.sampler.is_some() && !self.usage.contains(vk::ImageUsageFlags::SAMPLED) {
            return Err(GpuError::InvalidUsageCombination(
                "a sampler was requested for an image without SAMPLED usage".to_string(),
            ));
        }
        Ok(())
    }
}

/// Copy `src` to the start of a mapped range.
///
/// On success `dst[..src.len()]` equals `src` exactly.
pub fn write_mapped(dst: &mut [u8], src: &[u8]) -> Result<()> {
    let dst_len = dst.len();
    let target = dst.get_mut(..src.len()).ok_or_else(|| {
        GpuError::InvalidState(format!(
            "upload of {} bytes exceeds mapped range of {dst_len} bytes",
            src.len()
        ))
    })?;
    target.copy_from_slice(src);
    Ok(())
}

/// Upload `bytes` into the mapped range of a `capacity`-byte buffer.
///
/// `mapped` is `None` when the allocation has no host mapping.
pub fn upload_to_mapped(
    mapped: Option<&mut [u8]>,
    capacity: u64,
    host_visible: bool,
    bytes: &[u8],
) -> Result<()> {
    if !host_visible {
        return Err(GpuError::InvalidState(
            "upload to a buffer that is not host-visible".to_string(),
        ));
    }
    if bytes.len() as u64 > capacity {
        return Err(GpuError::InvalidState(format!(
            "upload of {} bytes into a {capacity}-byte buffer",
            bytes.len()
        )));
    }
    let mapped = mapped.ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
    write_mapped(mapped, bytes)
}

/// Copy the first `len` bytes out of the mapped range of a `capacity`-byte buffer.
pub fn read_from_mapped(mapped: Option<&[u8]>, capacity: u64, len: usize) -> Result<Vec<u8>> {
    if len as u64 > capacity {
        return Err(GpuError::InvalidState(format!(
            "readback of {len} bytes from a {capacity}-byte buffer"
        )));
    }
    let mapped = mapped.ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
    mapped.get(..len).map(<[u8]>::to_vec).ok_or_else(|| {
        GpuError::InvalidState(format!(
            "readback of {len} bytes exceeds mapped range of {} bytes",
            mapped.len()
        ))
    })
}

/// Live allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub live_buffers: usize,
    pub live_images: usize,
    pub buffer_bytes: u64,
}

impl AllocatorStats {
    fn buffer_created(&mut self, size: u64) {
        self.live_buffers += 1;
        self.buffer_bytes += size;
    }

    fn buffer_destroyed(&mut self, size: u64) {
        self.live_buffers = self.live_buffers.saturating_sub(1);
        self.buffer_bytes = self.buffer_bytes.saturating_sub(size);
    }

    /// Whether nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.live_buffers == 0 && self.live_images == 0
    }
}

fn map_allocation_error(err: AllocationError) -> GpuError {
    match err {
        AllocationError::OutOfMemory => GpuError::OutOfDeviceMemory,
        other => GpuError::AllocationFailed(other.to_string()),
    }
}

/// Device memory allocator.
pub struct DeviceAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    stats: AllocatorStats,
}

impl DeviceAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        log_memory_information: bool,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information,
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(map_allocation_error)?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            stats: AllocatorStats::default(),
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Current allocation counters.
    pub fn stats(&self) -> AllocatorStats {
        self.stats
    }

    /// Create a buffer backed by its own memory block.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        host_visible: bool,
        name: &str,
    ) -> Result<DeviceBuffer> {
        validate_buffer_request(size, usage, host_visible)?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.flags())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = if host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let allocation = match self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::DedicatedBuffer(buffer),
                })
                .map_err(map_allocation_error)
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.release(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        self.stats.buffer_created(size);
        tracing::debug!(name, size, ?usage, host_visible, "created buffer");

        Ok(DeviceBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            host_visible,
        })
    }

    /// Destroy a buffer and free its memory.
    pub fn destroy_buffer(&mut self, mut buffer: DeviceBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?.free(allocation).map_err(map_allocation_error)?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        self.stats.buffer_destroyed(buffer.size);

        Ok(())
    }

    /// Create an image with its view and optional sampler.
    pub fn create_image(&mut self, desc: &ImageDesc, name: &str) -> Result<DeviceImage> {
        desc.validate()?;

        let flags = if desc.cube_compatible {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.inner().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: desc.tiling == vk::ImageTiling::LINEAR,
                    allocation_scheme: AllocationScheme::DedicatedImage(image),
                })
                .map_err(map_allocation_error)
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let mut partial = DeviceImage {
            image,
            view: vk::ImageView::null(),
            sampler: None,
            allocation: Some(allocation),
            format: desc.format,
            extent: desc.extent,
            layers: desc.layers,
            usage: desc.usage,
        };

        if let Err(e) = self.finish_image(&mut partial, desc) {
            self.discard_image(partial);
            return Err(e);
        }

        self.stats.live_images += 1;
        tracing::debug!(
            name,
            width = desc.extent.width,
            height = desc.extent.height,
            layers = desc.layers,
            format = ?desc.format,
            "created image"
        );

        Ok(partial)
    }

    /// Bind memory and create the view and sampler.
    fn finish_image(&self, image: &mut DeviceImage, desc: &ImageDesc) -> Result<()> {
        let allocation = image
            .allocation
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("image has no allocation".to_string()))?;

        unsafe {
            self.device
                .bind_image_memory(image.image, allocation.memory(), allocation.offset())?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(image.subresource_range());

        image.view = unsafe { self.device.create_image_view(&view_info, None)? };

        if let Some(sampler) = desc.sampler {
            let sampler_info = vk::SamplerCreateInfo::default()
                .mag_filter(sampler.filter)
                .min_filter(sampler.filter)
                .mipmap_mode(sampler.mipmap_mode)
                .address_mode_u(sampler.address_mode)
                .address_mode_v(sampler.address_mode)
                .address_mode_w(sampler.address_mode)
                .min_lod(-1000.0)
                .max_lod(1000.0)
                .max_anisotropy(1.0);

            image.sampler = Some(unsafe { self.device.create_sampler(&sampler_info, None)? });
        }

        Ok(())
    }

    /// Tear down an image that never made it into the live counters.
    fn discard_image(&mut self, mut image: DeviceImage) {
        unsafe {
            if let Some(sampler) = image.sampler.take() {
                self.device.destroy_sampler(sampler, None);
            }
            if image.view != vk::ImageView::null() {
                self.device.destroy_image_view(image.view, None);
            }
        }
        if let Some(allocation) = image.allocation.take() {
            self.release(allocation);
        }
        unsafe { self.device.destroy_image(image.image, None) };
    }

    /// Destroy an image together with its view and sampler.
    pub fn destroy_image(&mut self, mut image: DeviceImage) -> Result<()> {
        unsafe {
            if let Some(sampler) = image.sampler.take() {
                self.device.destroy_sampler(sampler, None);
            }
            self.device.destroy_image_view(image.view, None);
        }

        if let Some(allocation) = image.allocation.take() {
            self.inner()?.free(allocation).map_err(map_allocation_error)?;
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        self.stats.live_images = self.stats.live_images.saturating_sub(1);

        Ok(())
    }

    /// Create a host-visible buffer of `size` bytes starting with `bytes`.
    ///
    /// The buffer is destroyed again if the upload fails.
    pub fn create_uploaded_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        bytes: &[u8],
        name: &str,
    ) -> Result<DeviceBuffer> {
        let mut buffer = self.create_buffer(size, usage, true, name)?;
        if let Err(e) = buffer.upload_bytes(bytes) {
            self.release_buffers([buffer]);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Destroy buffers of a construction that failed part-way.
    ///
    /// Errors are logged, the original failure is what the caller reports.
    pub fn release_buffers(&mut self, buffers: impl IntoIterator<Item = DeviceBuffer>) {
        for buffer in buffers {
            if let Err(e) = self.destroy_buffer(buffer) {
                tracing::warn!("failed to release buffer during cleanup: {e}");
            }
        }
    }

    /// Destroy images of a construction that failed part-way.
    pub fn release_images(&mut self, images: impl IntoIterator<Item = DeviceImage>) {
        for image in images {
            if let Err(e) = self.destroy_image(image) {
                tracing::warn!("failed to release image during cleanup: {e}");
            }
        }
    }

    fn release(&mut self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.as_mut() {
            if let Err(e) = allocator.free(allocation) {
                tracing::warn!("failed to release allocation during cleanup: {e}");
            }
        }
    }
}

impl DeviceAllocator {
    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    pub fn shutdown(&mut self) {
        if !self.stats.is_empty() {
            tracing::warn!(
                buffers = self.stats.live_buffers,
                images = self.stats.live_images,
                bytes = self.stats.buffer_bytes,
                "allocator shut down with live resources"
            );
        }
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for DeviceAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A device buffer with its dedicated allocation.
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub usage: BufferUsage,
    pub host_visible: bool,
}

impl DeviceBuffer {
    /// Copy bytes to offset 0 of a host-visible buffer.
    ///
    /// The mapped range is only borrowed for the duration of the call.
    pub fn upload_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut);
        upload_to_mapped(mapped, self.size, self.host_visible, bytes)
    }

    /// Upload plain-old-data values.
    pub fn upload<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<()> {
        self.upload_bytes(bytemuck::cast_slice(data))
    }

    /// Read back the first `len` bytes of a host-visible buffer.
    pub fn read_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mapped = self.allocation.as_ref().and_then(Allocation::mapped_slice);
        read_from_mapped(mapped, self.size, len)
    }
}

/// A device image with its dedicated allocation, view and optional sampler.
pub struct DeviceImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub sampler: Option<vk::Sampler>,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub layers: u32,
    pub usage: vk::ImageUsageFlags,
}

impl DeviceImage {
    /// Subresource range covering every layer, with the aspect implied by the format.
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_for_format(self.format),
            ..color_range(self.layers)
        }
    }
}

/// Image aspect a view of `format` covers.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Color aspect, mip 0, layers `0..layers`.
pub fn color_range(layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: layers,
    }
}
