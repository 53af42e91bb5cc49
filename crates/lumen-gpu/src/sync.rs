//! Frame-in-flight synchronization.

use crate::error::{GpuError, Result};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    Ok(device.create_semaphore(&create_info, None)?)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    Ok(device.create_fence(&create_info, None)?)
}

/// Block until a fence is signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    device.wait_for_fences(&[fence], true, timeout_ns)?;
    Ok(())
}

/// Reset a fence to the unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Host-side record of which frame slots have submitted work still executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlots {
    in_flight: Vec<bool>,
}

impl FrameSlots {
    /// `count` idle slots.
    pub fn new(count: usize) -> Self {
        Self {
            in_flight: vec![false; count],
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn check(&self, slot: usize) -> Result<()> {
        if slot < self.in_flight.len() {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "frame slot {slot} out of range (frames in flight: {})",
                self.in_flight.len()
            )))
        }
    }

    /// Whether `slot` has work on the GPU.
    pub fn is_in_flight(&self, slot: usize) -> bool {
        self.in_flight.get(slot).copied().unwrap_or(false)
    }

    /// First slot with work on the GPU, if any.
    pub fn first_in_flight(&self) -> Option<usize> {
        self.in_flight.iter().position(|&busy| busy)
    }

    /// Record a submission on `slot`.
    pub fn mark_submitted(&mut self, slot: usize) -> Result<()> {
        self.check(slot)?;
        self.in_flight[slot] = true;
        Ok(())
    }

    /// Record that the fence of `slot` has been waited on.
    pub fn mark_idle(&mut self, slot: usize) -> Result<()> {
        self.check(slot)?;
        self.in_flight[slot] = false;
        Ok(())
    }

    /// Record that the whole device is idle.
    pub fn mark_all_idle(&mut self) {
        self.in_flight.iter_mut().for_each(|busy| *busy = false);
    }
}

/// Per-slot synchronization resources.
pub struct FrameSync {
    /// Signaled when the slot's submission completes.
    pub in_flight: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
}

/// The slot handed out by [`FrameRing::begin_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameToken {
    pub slot: usize,
    /// Primary command buffer, already in the recording state.
    pub command_buffer: vk::CommandBuffer,
}

/// Ring of frame-in-flight slots, one fence and command buffer per slot.
pub struct FrameRing {
    command_pool: vk::CommandPool,
    frames: Vec<FrameSync>,
    slots: FrameSlots,
    current: usize,
    recording: bool,
}

impl FrameRing {
    /// Create `frames_in_flight` slots.
    ///
    /// # Safety
    /// The device must be valid and `queue_family` one of its queue families.
    pub unsafe fn new(device: &ash::Device, queue_family: u32, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "frames in flight must be at least 1".to_string(),
            ));
        }

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = device.create_command_pool(&pool_info, None)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        let command_buffers = match device.allocate_command_buffers(&alloc_info) {
            Ok(buffers) => buffers,
            Err(e) => {
                device.destroy_command_pool(command_pool, None);
                return Err(e.into());
            }
        };

        let mut frames = Vec::with_capacity(frames_in_flight);
        for command_buffer in command_buffers {
            match create_fence(device, true) {
                Ok(in_flight) => frames.push(FrameSync {
                    in_flight,
                    command_buffer,
                }),
                Err(e) => {
                    for frame in &frames {
                        device.destroy_fence(frame.in_flight, None);
                    }
                    device.destroy_command_pool(command_pool, None);
                    return Err(e);
                }
            }
        }

        tracing::info!(frames_in_flight, "Created frame ring");

        Ok(Self {
            command_pool,
            frames,
            slots: FrameSlots::new(frames_in_flight),
            current: 0,
            recording: false,
        })
    }

    /// Index of the current slot.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Number of slots.
    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// One fence per slot, in slot order.
    pub fn fences(&self) -> Vec<vk::Fence> {
        self.frames.iter().map(|f| f.in_flight).collect()
    }

    /// In-flight bookkeeping, for descriptor commits.
    pub fn slots(&self) -> &FrameSlots {
        &self.slots
    }

    /// Wait for the current slot, reset it and begin recording its command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn begin_frame(&mut self, device: &ash::Device) -> Result<FrameToken> {
        if self.recording {
            return Err(GpuError::InvalidState(
                "begin_frame called while a frame is being recorded".to_string(),
            ));
        }

        let frame = &self.frames[self.current];
        wait_for_fence(device, frame.in_flight, u64::MAX)?;
        self.slots.mark_idle(self.current)?;
        reset_fence(device, frame.in_flight)?;

        device.reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(frame.command_buffer, &begin_info)?;

        self.recording = true;
        Ok(FrameToken {
            slot: self.current,
            command_buffer: frame.command_buffer,
        })
    }

    /// End recording, submit the current slot and advance the ring.
    ///
    /// # Safety
    /// The device and queue must be valid; the semaphores must be valid for the
    /// submission.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn submit(
        &mut self,
        device: &ash::Device,
        queue: vk::Queue,
        wait: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signal: &[vk::Semaphore],
    ) -> Result<()> {
        if !self.recording {
            return Err(GpuError::InvalidState(
                "submit called without begin_frame".to_string(),
            ));
        }

        let frame = &self.frames[self.current];
        self.recording = false;
        device.end_command_buffer(frame.command_buffer)?;

        let wait_semaphores: Vec<_> = wait.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<_> = wait.iter().map(|(_, stage)| *stage).collect();
        let command_buffers = [frame.command_buffer];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(signal);

        device.queue_submit(queue, &[submit_info], frame.in_flight)?;
        self.slots.mark_submitted(self.current)?;

        self.current = (self.current + 1) % self.frames.len();
        Ok(())
    }

    /// Wait for every slot to finish.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_all(&mut self, device: &ash::Device) -> Result<()> {
        device.wait_for_fences(&self.fences(), true, u64::MAX)?;
        self.slots.mark_all_idle();
        Ok(())
    }

    /// Destroy the fences and command pool.
    ///
    /// # Safety
    /// No submission from this ring may still be executing.
    pub unsafe fn destroy(self, device: &ash::Device) {
        for frame in &self.frames {
            device.destroy_fence(frame.in_flight, None);
        }
        device.destroy_command_pool(self.command_pool, None);
    }
}
