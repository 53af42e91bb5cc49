//! Image layout tracking and barrier sequencing.
//!
//! The sequencer is the single owner of "what layout is this image in right
//! now, and which stage last touched it". Every transition is computed from
//! that tracked state and immediately folded back into it, so consecutive
//! requests always see the post-transition state.
//!
//! Barriers are expressed with synchronization2 types
//! (`vk::ImageMemoryBarrier2`), recorded through `vkCmdPipelineBarrier2`.

use crate::error::{GpuError, Result};
use crate::memory::DeviceImage;
use ash::vk;
use std::collections::{HashMap, HashSet};

/// Handle to an image registered with a [`BarrierSequencer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(u32);

impl ImageId {
    /// Raw index, for logging.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Tracked synchronization state of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    /// Stage of the most recent access.
    pub stage: vk::PipelineStageFlags2,
    /// Access mask of the most recent access.
    pub access: vk::AccessFlags2,
}

impl ImageState {
    /// Freshly created image, contents undefined.
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };

    /// State after an access described by `access`.
    pub fn after(access: ImageAccess) -> Self {
        let (layout, stage, access) = access.parts();
        Self {
            layout,
            stage,
            access,
        }
    }
}

/// Common ways an image is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAccess {
    /// Source of a transfer (copy/blit).
    TransferRead,
    /// Destination of a transfer.
    TransferWrite,
    /// Color attachment of a render region.
    ColorAttachmentWrite,
    /// Depth attachment of a render region.
    DepthAttachmentWrite,
    /// Sampled from a fragment shader.
    FragmentSampled,
    /// Handed to the presentation engine.
    Present,
}

impl ImageAccess {
    /// Layout, consumer stage and consumer access mask.
    pub fn parts(self) -> (vk::ImageLayout, vk::PipelineStageFlags2, vk::AccessFlags2) {
        match self {
            Self::TransferRead => (
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
            ),
            Self::TransferWrite => (
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            Self::ColorAttachmentWrite => (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE | vk::AccessFlags2::COLOR_ATTACHMENT_READ,
            ),
            Self::DepthAttachmentWrite => (
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            ),
            Self::FragmentSampled => (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            ),
            Self::Present => (
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            ),
        }
    }
}

/// One requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRequest {
    pub image: ImageId,
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl TransitionRequest {
    /// Transition `image` for a preset access.
    pub fn to(image: ImageId, access: ImageAccess) -> Self {
        let (layout, stage, access) = access.parts();
        Self {
            image,
            layout,
            stage,
            access,
        }
    }
}

/// A single computed layout/memory transition.
#[derive(Debug, Clone, Copy)]
pub struct BarrierStep {
    pub image: ImageId,
    pub handle: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub old: ImageState,
    pub new: ImageState,
}

impl BarrierStep {
    /// Vulkan barrier for this step.
    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2<'static> {
        // An image nobody has touched yet has nothing to wait on.
        let src_stage = if self.old.stage.is_empty() {
            vk::PipelineStageFlags2::TOP_OF_PIPE
        } else {
            self.old.stage
        };

        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(self.old.access)
            .dst_stage_mask(self.new.stage)
            .dst_access_mask(self.new.access)
            .old_layout(self.old.layout)
            .new_layout(self.new.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.handle)
            .subresource_range(self.range)
    }
}

/// Steps on distinct images that are issued as one barrier command.
#[derive(Debug, Clone, Default)]
pub struct BarrierBatch {
    steps: Vec<BarrierStep>,
}

impl BarrierBatch {
    /// The steps, in request order.
    pub fn steps(&self) -> &[BarrierStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the batch has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step targeting `image`, if any.
    pub fn step_for(&self, image: ImageId) -> Option<&BarrierStep> {
        self.steps.iter().find(|s| s.image == image)
    }

    /// Vulkan image barriers for a `vk::DependencyInfo`.
    pub fn image_barriers(&self) -> Vec<vk::ImageMemoryBarrier2<'static>> {
        self.steps.iter().map(BarrierStep::to_vk).collect()
    }
}

#[derive(Debug, Clone)]
struct TrackedImage {
    handle: vk::Image,
    range: vk::ImageSubresourceRange,
    state: ImageState,
}

/// Tracks image state and turns transition requests into barriers.
#[derive(Debug, Clone, Default)]
pub struct BarrierSequencer {
    images: HashMap<ImageId, TrackedImage>,
    next_id: u32,
}

impl BarrierSequencer {
    /// Create an empty sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an image in a known state.
    pub fn register(
        &mut self,
        handle: vk::Image,
        range: vk::ImageSubresourceRange,
        initial: ImageState,
    ) -> ImageId {
        let id = ImageId(self.next_id);
        self.next_id += 1;
        self.images.insert(
            id,
            TrackedImage {
                handle,
                range,
                state: initial,
            },
        );
        tracing::trace!(image = id.0, layout = ?initial.layout, "registered image");
        id
    }

    /// Start tracking a freshly created image (all layers, undefined contents).
    pub fn register_image(&mut self, image: &DeviceImage) -> ImageId {
        self.register(image.image, image.subresource_range(), ImageState::UNDEFINED)
    }

    /// Stop tracking an image.
    pub fn unregister(&mut self, id: ImageId) -> Result<()> {
        self.images
            .remove(&id)
            .map(|_| ())
            .ok_or(GpuError::UnknownResourceHandle(id))
    }

    /// Number of tracked images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Whether no images are tracked.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    fn tracked(&self, id: ImageId) -> Result<&TrackedImage> {
        self.images
            .get(&id)
            .ok_or(GpuError::UnknownResourceHandle(id))
    }

    /// Current tracked state.
    pub fn state(&self, id: ImageId) -> Result<ImageState> {
        self.tracked(id).map(|t| t.state)
    }

    /// Current tracked layout.
    pub fn layout(&self, id: ImageId) -> Result<vk::ImageLayout> {
        self.tracked(id).map(|t| t.state.layout)
    }

    /// Vulkan handle of a tracked image.
    pub fn handle(&self, id: ImageId) -> Result<vk::Image> {
        self.tracked(id).map(|t| t.handle)
    }

    /// Refuse an access whose declared layout differs from the tracked one.
    pub fn require_layout(&self, id: ImageId, expected: vk::ImageLayout) -> Result<()> {
        let actual = self.layout(id)?;
        if actual == expected {
            Ok(())
        } else {
            Err(GpuError::LayoutMismatch {
                image: id,
                expected,
                actual,
            })
        }
    }

    /// Record that an operation accessed the image without changing its layout.
    ///
    /// Used after copies and draws so the next barrier waits on the right stage.
    pub fn note_access(
        &mut self,
        id: ImageId,
        layout: vk::ImageLayout,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> Result<()> {
        self.require_layout(id, layout)?;
        if let Some(tracked) = self.images.get_mut(&id) {
            tracked.state.stage = stage;
            tracked.state.access = access;
        }
        Ok(())
    }

    fn plan_step(&self, request: &TransitionRequest) -> Result<BarrierStep> {
        let tracked = self.tracked(request.image)?;
        if request.layout == vk::ImageLayout::UNDEFINED {
            return Err(GpuError::InvalidState(format!(
                "cannot transition {:?} to UNDEFINED",
                request.image
            )));
        }

        Ok(BarrierStep {
            image: request.image,
            handle: tracked.handle,
            range: tracked.range,
            old: tracked.state,
            new: ImageState {
                layout: request.layout,
                stage: request.stage,
                access: request.access,
            },
        })
    }

    fn apply(&mut self, step: &BarrierStep) {
        if let Some(tracked) = self.images.get_mut(&step.image) {
            tracked.state = step.new;
        }
    }

    /// Compute one transition and fold it into the tracked state.
    pub fn transition(
        &mut self,
        id: ImageId,
        to_layout: vk::ImageLayout,
        consumer_stage: vk::PipelineStageFlags2,
        consumer_access: vk::AccessFlags2,
    ) -> Result<BarrierStep> {
        let step = self.plan_step(&TransitionRequest {
            image: id,
            layout: to_layout,
            stage: consumer_stage,
            access: consumer_access,
        })?;
        self.apply(&step);
        Ok(step)
    }

    /// Compute a group of transitions issued together.
    ///
    /// Every request is checked before any state changes; on error the
    /// tracked state is exactly what it was before the call.
    pub fn transition_batch(&mut self, requests: &[TransitionRequest]) -> Result<BarrierBatch> {
        let mut seen = HashSet::with_capacity(requests.len());
        let mut steps = Vec::with_capacity(requests.len());

        for request in requests {
            if !seen.insert(request.image) {
                return Err(GpuError::InvalidState(format!(
                    "{:?} appears twice in one barrier batch",
                    request.image
                )));
            }
            steps.push(self.plan_step(request)?);
        }

        for step in &steps {
            self.apply(step);
        }

        tracing::debug!(steps = steps.len(), "barrier batch");
        Ok(BarrierBatch { steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::color_range;
    use ash::vk::Handle;

    fn image(raw: u64) -> vk::Image {
        vk::Image::from_raw(raw)
    }

    #[test]
    fn transition_updates_tracked_state() {
        let mut seq = BarrierSequencer::new();
        let id = seq.register(image(1), color_range(1), ImageState::UNDEFINED);

        let step = seq
            .transition(
                id,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            )
            .unwrap();

        assert_eq!(step.old, ImageState::UNDEFINED);
        assert_eq!(step.new, ImageState::after(ImageAccess::TransferWrite));
        assert_eq!(
            seq.layout(id).unwrap(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
    }

    #[test]
    fn consecutive_transitions_chain() {
        let mut seq = BarrierSequencer::new();
        let id = seq.register(image(1), color_range(6), ImageState::UNDEFINED);

        let (layout, stage, access) = ImageAccess::TransferWrite.parts();
        seq.transition(id, layout, stage, access).unwrap();

        let (layout, stage, access) = ImageAccess::FragmentSampled.parts();
        let second = seq.transition(id, layout, stage, access).unwrap();

        assert_eq!(
            second.old.layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            "second transition must start from the post-transition state"
        );
        assert_eq!(second.old.stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(second.old.access, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn unknown_handle_is_rejected() {
        let mut seq = BarrierSequencer::new();
        let id = seq.register(image(1), color_range(1), ImageState::UNDEFINED);
        seq.unregister(id).unwrap();

        let err = seq
            .transition(
                id,
                vk::ImageLayout::GENERAL,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_WRITE,
            )
            .unwrap_err();
        assert!(matches!(err, GpuError::UnknownResourceHandle(i) if i == id));
    }

    #[test]
    fn failed_batch_leaves_state_untouched() {
        let mut seq = BarrierSequencer::new();
        let a = seq.register(
            image(1),
            color_range(6),
            ImageState::after(ImageAccess::ColorAttachmentWrite),
        );
        let b = seq.register(image(2), color_range(6), ImageState::UNDEFINED);
        let stale = seq.register(image(3), color_range(1), ImageState::UNDEFINED);
        seq.unregister(stale).unwrap();

        let before_a = seq.state(a).unwrap();
        let before_b = seq.state(b).unwrap();

        let result = seq.transition_batch(&[
            TransitionRequest::to(a, ImageAccess::TransferRead),
            TransitionRequest::to(b, ImageAccess::TransferWrite),
            TransitionRequest::to(stale, ImageAccess::FragmentSampled),
        ]);

        assert!(matches!(result, Err(GpuError::UnknownResourceHandle(_))));
        assert_eq!(seq.state(a).unwrap(), before_a);
        assert_eq!(seq.state(b).unwrap(), before_b);
    }

    #[test]
    fn batch_rejects_duplicate_image() {
        let mut seq = BarrierSequencer::new();
        let a = seq.register(image(1), color_range(1), ImageState::UNDEFINED);

        let result = seq.transition_batch(&[
            TransitionRequest::to(a, ImageAccess::TransferWrite),
            TransitionRequest::to(a, ImageAccess::FragmentSampled),
        ]);

        assert!(matches!(result, Err(GpuError::InvalidState(_))));
        assert_eq!(seq.state(a).unwrap(), ImageState::UNDEFINED);
    }

    #[test]
    fn transition_to_undefined_is_rejected() {
        let mut seq = BarrierSequencer::new();
        let a = seq.register(image(1), color_range(1), ImageState::UNDEFINED);
        let result = seq.transition(
            a,
            vk::ImageLayout::UNDEFINED,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::NONE,
        );
        assert!(result.is_err());
    }

    #[test]
    fn cubemap_copy_batch_matches_expected_masks() {
        let mut seq = BarrierSequencer::new();
        let source = seq.register(
            image(10),
            color_range(6),
            ImageState::after(ImageAccess::ColorAttachmentWrite),
        );
        let faces = seq.register(image(11), color_range(6), ImageState::UNDEFINED);

        let batch = seq
            .transition_batch(&[
                TransitionRequest::to(source, ImageAccess::TransferRead),
                TransitionRequest::to(faces, ImageAccess::TransferWrite),
            ])
            .unwrap();

        assert_eq!(batch.len(), 2);

        let barriers = batch.image_barriers();
        let src = &barriers[0];
        assert_eq!(src.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(src.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(
            src.src_stage_mask,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(src.dst_stage_mask, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(src.dst_access_mask, vk::AccessFlags2::TRANSFER_READ);
        assert_eq!(src.subresource_range.layer_count, 6);

        let dst = &barriers[1];
        assert_eq!(dst.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(dst.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(dst.src_stage_mask, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(dst.src_access_mask, vk::AccessFlags2::NONE);
    }

    #[test]
    fn require_layout_refuses_mismatch() {
        let mut seq = BarrierSequencer::new();
        let a = seq.register(image(1), color_range(1), ImageState::UNDEFINED);

        let err = seq
            .require_layout(a, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::LayoutMismatch {
                actual: vk::ImageLayout::UNDEFINED,
                ..
            }
        ));

        seq.transition_batch(&[TransitionRequest::to(a, ImageAccess::FragmentSampled)])
            .unwrap();
        assert!(seq
            .require_layout(a, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .is_ok());
    }

    #[test]
    fn note_access_updates_stage_only() {
        let mut seq = BarrierSequencer::new();
        let a = seq.register(
            image(1),
            color_range(1),
            ImageState::after(ImageAccess::TransferWrite),
        );

        seq.note_access(
            a,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
        )
        .unwrap();

        let state = seq.state(a).unwrap();
        assert_eq!(state.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(state.stage, vk::PipelineStageFlags2::COPY);

        assert!(seq
            .note_access(
                a,
                vk::ImageLayout::GENERAL,
                vk::PipelineStageFlags2::COPY,
                vk::AccessFlags2::TRANSFER_WRITE,
            )
            .is_err());
    }

    #[test]
    fn ids_are_not_reused() {
        let mut seq = BarrierSequencer::new();
        let a = seq.register(image(1), color_range(1), ImageState::UNDEFINED);
        seq.unregister(a).unwrap();
        let b = seq.register(image(1), color_range(1), ImageState::UNDEFINED);
        assert_ne!(a, b);
        assert_eq!(seq.len(), 1);
    }
}
