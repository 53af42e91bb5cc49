//! Command recording targets.
//!
//! Passes record through [`CommandSink`]. [`VulkanRecorder`] forwards to a
//! command buffer in the recording state; [`CommandLog`] captures the stream
//! so it can be inspected or replayed against a layout model.

use crate::barrier::BarrierBatch;
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashMap;

/// One attachment of a render region.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentDesc {
    /// Image behind the view, used for layout bookkeeping.
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: ClearValue,
}

/// Value an attachment is cleared to on `LOAD_OP_CLEAR`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl Default for ClearValue {
    fn default() -> Self {
        Self::Color([0.0; 4])
    }
}

impl ClearValue {
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// Begin-rendering parameters for dynamic rendering.
#[derive(Debug, Clone)]
pub struct RenderingDesc {
    pub area: vk::Rect2D,
    pub layer_count: u32,
    /// Multiview mask; zero disables multiview.
    pub view_mask: u32,
    pub color_attachments: Vec<AttachmentDesc>,
    pub depth_attachment: Option<AttachmentDesc>,
}

impl RenderingDesc {
    /// Number of views rendered per draw.
    pub fn view_count(&self) -> u32 {
        self.view_mask.count_ones().max(1)
    }
}

/// An image-to-image copy with the layouts the copy declares.
#[derive(Debug, Clone)]
pub struct ImageCopyDesc {
    pub src: vk::Image,
    pub src_layout: vk::ImageLayout,
    pub dst: vk::Image,
    pub dst_layout: vk::ImageLayout,
    pub regions: Vec<vk::ImageCopy>,
}

/// Destination for recorded commands.
pub trait CommandSink {
    fn pipeline_barrier(&mut self, batch: &BarrierBatch);
    fn copy_image(&mut self, copy: &ImageCopyDesc);
    fn begin_rendering(&mut self, desc: &RenderingDesc);
    fn end_rendering(&mut self);
    fn bind_graphics_pipeline(&mut self, pipeline: vk::Pipeline);
    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64);
    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType);
    fn set_viewport(&mut self, viewport: vk::Viewport);
    fn set_scissor(&mut self, scissor: vk::Rect2D);
    /// Images the following draws sample, with the layout each is in.
    ///
    /// Nothing is recorded on the GPU; sinks that model layouts keep it.
    fn sample_images(&mut self, _images: &[(vk::Image, vk::ImageLayout)]) {}
    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
}

/// Records into a Vulkan command buffer.
pub struct VulkanRecorder<'a> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
}

impl<'a> VulkanRecorder<'a> {
    /// Wrap a command buffer.
    ///
    /// # Safety
    /// `cmd` must be a primary command buffer allocated from `device` and in
    /// the recording state for the lifetime of the recorder.
    pub unsafe fn new(device: &'a ash::Device, cmd: vk::CommandBuffer) -> Self {
        Self { device, cmd }
    }

    /// The wrapped command buffer.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }
}

impl CommandSink for VulkanRecorder<'_> {
    fn pipeline_barrier(&mut self, batch: &BarrierBatch) {
        let barriers = batch.image_barriers();
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dependency_info) };
    }

    fn copy_image(&mut self, copy: &ImageCopyDesc) {
        unsafe {
            self.device.cmd_copy_image(
                self.cmd,
                copy.src,
                copy.src_layout,
                copy.dst,
                copy.dst_layout,
                &copy.regions,
            );
        }
    }

    fn begin_rendering(&mut self, desc: &RenderingDesc) {
        let to_vk = |a: &AttachmentDesc| {
            vk::RenderingAttachmentInfo::default()
                .image_view(a.view)
                .image_layout(a.layout)
                .load_op(a.load_op)
                .store_op(a.store_op)
                .clear_value(a.clear.to_vk())
        };

        let colors: Vec<_> = desc.color_attachments.iter().map(to_vk).collect();
        let depth = desc.depth_attachment.as_ref().map(to_vk);

        let mut info = vk::RenderingInfo::default()
            .render_area(desc.area)
            .layer_count(desc.layer_count)
            .view_mask(desc.view_mask)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            info = info.depth_attachment(depth);
        }

        unsafe { self.device.cmd_begin_rendering(self.cmd, &info) };
    }

    fn end_rendering(&mut self) {
        unsafe { self.device.cmd_end_rendering(self.cmd) };
    }

    fn bind_graphics_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                &[],
            );
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.cmd, 0, &[buffer], &[offset]);
        }
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.cmd, buffer, offset, index_type);
        }
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(self.cmd, 0, &[viewport]) };
    }

    fn set_scissor(&mut self, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(self.cmd, 0, &[scissor]) };
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.cmd_draw(
                self.cmd,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }
}

/// A captured command.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    Barrier(BarrierBatch),
    CopyImage(ImageCopyDesc),
    BeginRendering(RenderingDesc),
    EndRendering,
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    BindVertexBuffer {
        buffer: vk::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    SampledImages(Vec<(vk::Image, vk::ImageLayout)>),
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
}

impl RecordedCommand {
    /// Short name, for ordering assertions and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Barrier(_) => "barrier",
            Self::CopyImage(_) => "copy_image",
            Self::BeginRendering(_) => "begin_rendering",
            Self::EndRendering => "end_rendering",
            Self::BindPipeline(_) => "bind_pipeline",
            Self::BindDescriptorSets { .. } => "bind_descriptor_sets",
            Self::BindVertexBuffer { .. } => "bind_vertex_buffer",
            Self::BindIndexBuffer { .. } => "bind_index_buffer",
            Self::SetViewport(_) => "set_viewport",
            Self::SetScissor(_) => "set_scissor",
            Self::SampledImages(_) => "sampled_images",
            Self::Draw { .. } => "draw",
            Self::DrawIndexed { .. } => "draw_indexed",
        }
    }
}

fn check_layout(
    layouts: &HashMap<vk::Image, vk::ImageLayout>,
    image: vk::Image,
    declared: vk::ImageLayout,
    index: usize,
) -> Result<()> {
    let modelled = layouts
        .get(&image)
        .copied()
        .unwrap_or(vk::ImageLayout::UNDEFINED);
    if modelled == declared {
        Ok(())
    } else {
        Err(GpuError::InvalidState(format!(
            "command {index} declares {declared:?} for {image:?}, modelled {modelled:?}"
        )))
    }
}

/// Captures commands in memory.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    commands: Vec<RecordedCommand>,
}

impl CommandLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured commands, in order.
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Command names, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.commands.iter().map(RecordedCommand::name).collect()
    }

    /// Captured barrier batches.
    pub fn barrier_batches(&self) -> impl Iterator<Item = &BarrierBatch> {
        self.commands.iter().filter_map(|c| match c {
            RecordedCommand::Barrier(batch) => Some(batch),
            _ => None,
        })
    }

    /// Number of draw commands of either kind.
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }
                )
            })
            .count()
    }

    /// Replay the stream against a layout model.
    ///
    /// Starting from `initial`, every barrier must start from the modelled
    /// layout and every copy or render region must declare the modelled
    /// layout. Sampled images must be in `SHADER_READ_ONLY_OPTIMAL`.
    /// Returns the final layouts.
    pub fn replay_layouts(
        &self,
        initial: &HashMap<vk::Image, vk::ImageLayout>,
    ) -> Result<HashMap<vk::Image, vk::ImageLayout>> {
        let mut layouts = initial.clone();

        for (index, command) in self.commands.iter().enumerate() {
            match command {
                RecordedCommand::Barrier(batch) => {
                    for step in batch.steps() {
                        // UNDEFINED as the old layout discards contents and is valid from anywhere.
                        if step.old.layout != vk::ImageLayout::UNDEFINED {
                            check_layout(&layouts, step.handle, step.old.layout, index)?;
                        }
                    }
                    for step in batch.steps() {
                        layouts.insert(step.handle, step.new.layout);
                    }
                }
                RecordedCommand::CopyImage(copy) => {
                    check_layout(&layouts, copy.src, copy.src_layout, index)?;
                    check_layout(&layouts, copy.dst, copy.dst_layout, index)?;
                }
                RecordedCommand::BeginRendering(desc) => {
                    for attachment in desc
                        .color_attachments
                        .iter()
                        .chain(desc.depth_attachment.iter())
                    {
                        check_layout(&layouts, attachment.image, attachment.layout, index)?;
                    }
                }
                RecordedCommand::SampledImages(images) => {
                    for &(image, layout) in images {
                        if layout != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                            return Err(GpuError::InvalidState(format!(
                                "command {index} samples {image:?} in {layout:?}"
                            )));
                        }
                        check_layout(&layouts, image, layout, index)?;
                    }
                }
                _ => {}
            }
        }

        Ok(layouts)
    }
}

impl CommandSink for CommandLog {
    fn pipeline_barrier(&mut self, batch: &BarrierBatch) {
        self.commands.push(RecordedCommand::Barrier(batch.clone()));
    }

    fn copy_image(&mut self, copy: &ImageCopyDesc) {
        self.commands.push(RecordedCommand::CopyImage(copy.clone()));
    }

    fn begin_rendering(&mut self, desc: &RenderingDesc) {
        self.commands
            .push(RecordedCommand::BeginRendering(desc.clone()));
    }

    fn end_rendering(&mut self) {
        self.commands.push(RecordedCommand::EndRendering);
    }

    fn bind_graphics_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.commands.push(RecordedCommand::BindPipeline(pipeline));
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.commands.push(RecordedCommand::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        self.commands
            .push(RecordedCommand::BindVertexBuffer { buffer, offset });
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        self.commands.push(RecordedCommand::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
    }

    fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.commands.push(RecordedCommand::SetViewport(viewport));
    }

    fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.commands.push(RecordedCommand::SetScissor(scissor));
    }

    fn sample_images(&mut self, images: &[(vk::Image, vk::ImageLayout)]) {
        self.commands
            .push(RecordedCommand::SampledImages(images.to_vec()));
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.commands.push(RecordedCommand::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.commands.push(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::{BarrierSequencer, ImageAccess, ImageState, TransitionRequest};
    use crate::memory::color_range;
    use ash::vk::Handle;

    fn copy(src: vk::Image, dst: vk::Image) -> ImageCopyDesc {
        ImageCopyDesc {
            src,
            src_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            dst_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            regions: Vec::new(),
        }
    }

    #[test]
    fn replay_accepts_sequenced_stream() {
        let src = vk::Image::from_raw(1);
        let dst = vk::Image::from_raw(2);
        let mut seq = BarrierSequencer::new();
        let a = seq.register(
            src,
            color_range(6),
            ImageState::after(ImageAccess::ColorAttachmentWrite),
        );
        let b = seq.register(dst, color_range(6), ImageState::UNDEFINED);

        let mut log = CommandLog::new();
        let batch = seq
            .transition_batch(&[
                TransitionRequest::to(a, ImageAccess::TransferRead),
                TransitionRequest::to(b, ImageAccess::TransferWrite),
            ])
            .unwrap();
        log.pipeline_barrier(&batch);
        log.copy_image(&copy(src, dst));

        let initial = HashMap::from([(src, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)]);
        let finals = log.replay_layouts(&initial).unwrap();
        assert_eq!(finals[&src], vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(finals[&dst], vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn replay_rejects_copy_without_barrier() {
        let src = vk::Image::from_raw(1);
        let dst = vk::Image::from_raw(2);
        let mut log = CommandLog::new();
        log.copy_image(&copy(src, dst));

        let initial = HashMap::from([(src, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)]);
        assert!(log.replay_layouts(&initial).is_err());
    }

    #[test]
    fn replay_rejects_sampling_a_transfer_target() {
        let src = vk::Image::from_raw(1);
        let faces = vk::Image::from_raw(2);
        let mut seq = BarrierSequencer::new();
        let a = seq.register(
            src,
            color_range(6),
            ImageState::after(ImageAccess::ColorAttachmentWrite),
        );
        let b = seq.register(faces, color_range(6), ImageState::UNDEFINED);

        let mut log = CommandLog::new();
        let batch = seq
            .transition_batch(&[
                TransitionRequest::to(a, ImageAccess::TransferRead),
                TransitionRequest::to(b, ImageAccess::TransferWrite),
            ])
            .unwrap();
        log.pipeline_barrier(&batch);
        log.copy_image(&copy(src, faces));
        // Faces never moved to a shader-readable layout.
        log.sample_images(&[(faces, vk::ImageLayout::TRANSFER_DST_OPTIMAL)]);
        log.draw(6, 1, 0, 0);

        let initial = HashMap::from([(src, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)]);
        assert!(matches!(
            log.replay_layouts(&initial),
            Err(GpuError::InvalidState(_))
        ));

        // Declaring the right layout without the barrier is caught as well.
        let mut log = CommandLog::new();
        log.sample_images(&[(faces, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]);
        assert!(log.replay_layouts(&initial).is_err());
    }

    #[test]
    fn replay_accepts_sampling_after_transition() {
        let faces = vk::Image::from_raw(2);
        let mut seq = BarrierSequencer::new();
        let id = seq.register(
            faces,
            color_range(6),
            ImageState::after(ImageAccess::TransferWrite),
        );

        let mut log = CommandLog::new();
        let batch = seq
            .transition_batch(&[TransitionRequest::to(id, ImageAccess::FragmentSampled)])
            .unwrap();
        log.pipeline_barrier(&batch);
        log.sample_images(&[(faces, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]);

        let initial = HashMap::from([(faces, vk::ImageLayout::TRANSFER_DST_OPTIMAL)]);
        let finals = log.replay_layouts(&initial).unwrap();
        assert_eq!(finals[&faces], vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(log.names(), vec!["barrier", "sampled_images"]);
    }

    #[test]
    fn log_counts_draws() {
        let mut log = CommandLog::new();
        log.draw(6, 1, 0, 0);
        log.draw_indexed(240, 1, 0, 0, 0);
        log.end_rendering();
        assert_eq!(log.draw_count(), 2);
        assert_eq!(log.names(), vec!["draw", "draw_indexed", "end_rendering"]);
    }

    #[test]
    fn view_count_from_mask() {
        let desc = RenderingDesc {
            area: vk::Rect2D::default(),
            layer_count: 1,
            view_mask: 0x3F,
            color_attachments: Vec::new(),
            depth_attachment: None,
        };
        assert_eq!(desc.view_count(), 6);
    }
}
