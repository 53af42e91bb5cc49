//! Descriptor set layouts, pools and validated writes.

use crate::error::{GpuError, Result};
use crate::sync::FrameSlots;
use ash::vk;
use std::collections::HashSet;

/// Descriptor kinds the renderer binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    CombinedImageSampler,
}

impl DescriptorKind {
    pub fn vk_type(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }
}

/// One binding of a set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDesc {
    pub slot: u32,
    pub kind: DescriptorKind,
    pub stages: vk::ShaderStageFlags,
    pub count: u32,
}

/// Descriptor set layout builder.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<BindingDesc>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        slot: u32,
        kind: DescriptorKind,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(BindingDesc {
            slot,
            kind,
            stages,
            count,
        });
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, slot: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(slot, DescriptorKind::UniformBuffer, 1, stages)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, slot: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(slot, DescriptorKind::CombinedImageSampler, 1, stages)
    }

    /// Bindings added so far.
    pub fn bindings(&self) -> &[BindingDesc] {
        &self.bindings
    }

    /// Check slot uniqueness and counts.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            if !seen.insert(binding.slot) {
                return Err(GpuError::DuplicateBindingSlot(binding.slot));
            }
            if binding.count == 0 {
                return Err(GpuError::InvalidBinding(format!(
                    "binding {} has a descriptor count of zero",
                    binding.slot
                )));
            }
        }
        Ok(())
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<DescriptorSetLayout> {
        self.validate()?;

        let vk_bindings: Vec<_> = self
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.slot)
                    .descriptor_type(b.kind.vk_type())
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let handle = device.create_descriptor_set_layout(&layout_info, None)?;

        Ok(DescriptorSetLayout {
            handle,
            bindings: self.bindings,
        })
    }
}

/// A descriptor set layout together with the bindings it was built from.
#[derive(Debug)]
pub struct DescriptorSetLayout {
    handle: vk::DescriptorSetLayout,
    bindings: Vec<BindingDesc>,
}

impl DescriptorSetLayout {
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn bindings(&self) -> &[BindingDesc] {
        &self.bindings
    }

    /// Destroy the layout.
    ///
    /// # Safety
    /// No pipeline layout or set allocation may still need it.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_descriptor_set_layout(self.handle, None);
    }
}

/// Sets and descriptors a pool is created with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCapacity {
    pub max_sets: u32,
    pub uniform_buffers: u32,
    pub combined_image_samplers: u32,
}

impl PoolCapacity {
    /// Room for one set per frame in flight of each layout.
    pub fn for_layouts(frames_in_flight: u32, layouts: &[&[BindingDesc]]) -> Self {
        layouts.iter().fold(Self::default(), |capacity, bindings| {
            (0..frames_in_flight).fold(capacity, |c, _| c.with_set(bindings))
        })
    }

    /// Add room for one more set of `bindings`.
    pub fn with_set(mut self, bindings: &[BindingDesc]) -> Self {
        self.max_sets += 1;
        for binding in bindings {
            match binding.kind {
                DescriptorKind::UniformBuffer => self.uniform_buffers += binding.count,
                DescriptorKind::CombinedImageSampler => {
                    self.combined_image_samplers += binding.count;
                }
            }
        }
        self
    }

    fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        [
            (vk::DescriptorType::UNIFORM_BUFFER, self.uniform_buffers),
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                self.combined_image_samplers,
            ),
        ]
        .into_iter()
        .filter(|&(_, count)| count > 0)
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        })
        .collect()
    }
}

/// Host-side accounting of what a pool has handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBudget {
    capacity: PoolCapacity,
    used: PoolCapacity,
}

impl PoolBudget {
    pub fn new(capacity: PoolCapacity) -> Self {
        Self {
            capacity,
            used: PoolCapacity::default(),
        }
    }

    pub fn capacity(&self) -> PoolCapacity {
        self.capacity
    }

    /// Sets reserved so far.
    pub fn sets_used(&self) -> u32 {
        self.used.max_sets
    }

    /// Reserve one set of `bindings`, leaving the budget untouched on failure.
    pub fn reserve(&mut self, bindings: &[BindingDesc]) -> Result<()> {
        let next = self.used.with_set(bindings);
        let over = |what: &str, used: u32, cap: u32| {
            GpuError::PoolExhausted(format!("{what}: {used} requested, capacity {cap}"))
        };

        if next.max_sets > self.capacity.max_sets {
            return Err(over("sets", next.max_sets, self.capacity.max_sets));
        }
        if next.uniform_buffers > self.capacity.uniform_buffers {
            return Err(over(
                "uniform buffers",
                next.uniform_buffers,
                self.capacity.uniform_buffers,
            ));
        }
        if next.combined_image_samplers > self.capacity.combined_image_samplers {
            return Err(over(
                "combined image samplers",
                next.combined_image_samplers,
                self.capacity.combined_image_samplers,
            ));
        }

        self.used = next;
        Ok(())
    }
}

/// An allocated set and the layout it conforms to.
#[derive(Debug, Clone)]
pub struct DescriptorSetInstance {
    set: vk::DescriptorSet,
    bindings: Vec<BindingDesc>,
    frame_slot: Option<usize>,
}

impl DescriptorSetInstance {
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Frame slot the set belongs to; `None` for a set shared by every frame.
    pub fn frame_slot(&self) -> Option<usize> {
        self.frame_slot
    }

    fn binding(&self, slot: u32) -> Option<&BindingDesc> {
        self.bindings.iter().find(|b| b.slot == slot)
    }
}

/// Descriptor pool sized once at start-up.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    budget: PoolBudget,
}

impl DescriptorPool {
    /// Create a pool with exactly `capacity`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, capacity: PoolCapacity) -> Result<Self> {
        let pool_sizes = capacity.pool_sizes();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(capacity.max_sets)
            .pool_sizes(&pool_sizes);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        tracing::debug!(?capacity, "Created descriptor pool");

        Ok(Self {
            pool,
            budget: PoolBudget::new(capacity),
        })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn budget(&self) -> &PoolBudget {
        &self.budget
    }

    /// Allocate one set of `layout`.
    ///
    /// The budget is checked before the device is called.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &mut self,
        device: &ash::Device,
        layout: &DescriptorSetLayout,
        frame_slot: Option<usize>,
    ) -> Result<DescriptorSetInstance> {
        let mut budget = self.budget;
        budget.reserve(layout.bindings())?;

        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let set = device
            .allocate_descriptor_sets(&alloc_info)?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PoolExhausted("driver returned no set".to_string()))?;

        self.budget = budget;
        Ok(DescriptorSetInstance {
            set,
            bindings: layout.bindings().to_vec(),
            frame_slot,
        })
    }

    /// Allocate one set per frame slot.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_per_frame(
        &mut self,
        device: &ash::Device,
        layout: &DescriptorSetLayout,
        frames_in_flight: usize,
    ) -> Result<Vec<DescriptorSetInstance>> {
        (0..frames_in_flight)
            .map(|slot| self.allocate(device, layout, Some(slot)))
            .collect()
    }

    /// Destroy the pool and every set allocated from it.
    ///
    /// # Safety
    /// No set from this pool may be in use.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingWrite {
    Buffer {
        slot: u32,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        slot: u32,
        info: vk::DescriptorImageInfo,
    },
}

impl PendingWrite {
    fn slot(&self) -> u32 {
        match self {
            Self::Buffer { slot, .. } | Self::Image { slot, .. } => *slot,
        }
    }
}

/// Accumulates writes to one set and applies them in a single update.
pub struct DescriptorWriter<'a> {
    instance: &'a DescriptorSetInstance,
    writes: Vec<PendingWrite>,
}

impl<'a> DescriptorWriter<'a> {
    pub fn new(instance: &'a DescriptorSetInstance) -> Self {
        Self {
            instance,
            writes: Vec::new(),
        }
    }

    fn check_slot(&self, slot: u32, kind: DescriptorKind) -> Result<()> {
        let binding = self.instance.binding(slot).ok_or_else(|| {
            GpuError::InvalidBinding(format!("set layout has no binding {slot}"))
        })?;
        if binding.kind != kind {
            return Err(GpuError::InvalidBinding(format!(
                "binding {slot} is {:?}, write is {kind:?}",
                binding.kind
            )));
        }
        if self.writes.iter().any(|w| w.slot() == slot) {
            return Err(GpuError::InvalidBinding(format!(
                "binding {slot} written twice in one update"
            )));
        }
        Ok(())
    }

    /// Point a uniform-buffer binding at `range` bytes of `buffer`.
    pub fn uniform_buffer(
        &mut self,
        slot: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) -> Result<&mut Self> {
        self.check_slot(slot, DescriptorKind::UniformBuffer)?;
        self.writes.push(PendingWrite::Buffer {
            slot,
            info: vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            },
        });
        Ok(self)
    }

    /// Point a combined-image-sampler binding at a view sampled in `layout`.
    pub fn sampled_image(
        &mut self,
        slot: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> Result<&mut Self> {
        self.check_slot(slot, DescriptorKind::CombinedImageSampler)?;
        self.writes.push(PendingWrite::Image {
            slot,
            info: vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            },
        });
        Ok(self)
    }

    /// Number of pending writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Refuse to touch a set the GPU may still be reading.
    fn check_not_in_flight(&self, slots: &FrameSlots) -> Result<()> {
        if cfg!(debug_assertions) {
            let busy = match self.instance.frame_slot {
                Some(slot) => slots.is_in_flight(slot).then_some(slot),
                None => slots.first_in_flight(),
            };
            if let Some(slot) = busy {
                return Err(GpuError::DescriptorInFlight { slot });
            }
        }
        Ok(())
    }

    /// Apply every pending write in one `vkUpdateDescriptorSets` call.
    ///
    /// # Safety
    /// The device and every referenced buffer, view and sampler must be valid.
    pub unsafe fn commit(self, device: &ash::Device, slots: &FrameSlots) -> Result<usize> {
        self.check_not_in_flight(slots)?;

        let writes: Vec<_> = self
            .writes
            .iter()
            .map(|pending| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.instance.set)
                    .dst_binding(pending.slot());
                match pending {
                    PendingWrite::Buffer { info, .. } => write
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(info)),
                    PendingWrite::Image { info, .. } => write
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(std::slice::from_ref(info)),
                }
            })
            .collect();

        device.update_descriptor_sets(&writes, &[]);
        Ok(writes.len())
    }
}
