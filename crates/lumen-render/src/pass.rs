//! Pass recording.
//!
//! [`record_pass`] turns a [`PassRecipe`] into commands in a fixed order:
//!
//! 1. transfer barriers, then image copies
//! 2. pre-render barriers
//! 3. begin rendering
//! 4. bind pipeline, descriptor sets, vertex and index buffers
//! 5. viewport and scissor, when the pipeline declares them dynamic
//! 6. sampled images with their layouts, then draws
//! 7. end rendering
//! 8. post-render barriers
//!
//! The whole pass is planned against a copy of the sequencer before anything
//! is recorded, so a pass that fails records nothing and leaves the tracked
//! image state as it was.

use ash::vk;
use lumen_gpu::{
    AttachmentDesc, BarrierBatch, BarrierSequencer, ClearValue, CommandSink,
    DescriptorSetLayout, DescriptorSetLayoutBuilder, GpuError, GraphicsPipeline, ImageAccess,
    ImageCopyDesc, ImageId, PipelineBuilder, PipelineLayout, RenderingDesc, Result,
    TransitionRequest,
};

/// Set layout, pipeline layout and pipeline of one pass.
pub struct PassPipeline {
    pub set_layout: DescriptorSetLayout,
    pub layout: PipelineLayout,
    pub pipeline: GraphicsPipeline,
}

impl PassPipeline {
    /// Build the set layout, a pipeline layout over it, then the pipeline.
    ///
    /// Whatever was created before a failing step is destroyed again.
    ///
    /// # Safety
    /// The device must be valid and the shaders valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        set_layout: DescriptorSetLayoutBuilder,
        pipeline: PipelineBuilder,
    ) -> Result<Self> {
        let set_layout = set_layout.build(device)?;

        let layout = match PipelineLayout::new(device, &[set_layout.handle()], &[]) {
            Ok(layout) => layout,
            Err(e) => {
                set_layout.destroy(device);
                return Err(e);
            }
        };

        match pipeline.layout(&layout).build(device) {
            Ok(pipeline) => Ok(Self {
                set_layout,
                layout,
                pipeline,
            }),
            Err(e) => {
                layout.destroy(device);
                set_layout.destroy(device);
                Err(e)
            }
        }
    }

    /// # Safety
    /// No submission using the pipeline may still be executing.
    pub unsafe fn destroy(self, device: &ash::Device) {
        self.pipeline.destroy(device);
        self.layout.destroy(device);
        self.set_layout.destroy(device);
    }
}

/// Copy between two tracked images.
#[derive(Debug, Clone)]
pub struct ImageCopyOp {
    pub src: ImageId,
    pub dst: ImageId,
    pub regions: Vec<vk::ImageCopy>,
}

/// A tracked image and the view a pass renders through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetView {
    pub image: ImageId,
    pub view: vk::ImageView,
}

/// One attachment of the render region.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentOp {
    pub image: ImageId,
    pub view: vk::ImageView,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: ClearValue,
}

impl AttachmentOp {
    /// Clear on load, keep the result.
    pub fn cleared(image: ImageId, view: vk::ImageView, clear: ClearValue) -> Self {
        Self {
            image,
            view,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear,
        }
    }

    /// Discard the contents after the pass.
    pub fn transient(mut self) -> Self {
        self.store_op = vk::AttachmentStoreOp::DONT_CARE;
        self
    }
}

/// Dynamic rendering region.
#[derive(Debug, Clone)]
pub struct RenderRegion {
    pub color: Vec<AttachmentOp>,
    pub depth: Option<AttachmentOp>,
    pub area: vk::Rect2D,
    pub layer_count: u32,
    /// Must equal the pipeline's view mask.
    pub view_mask: u32,
}

impl RenderRegion {
    /// Region covering `extent` from the origin.
    pub fn full(extent: vk::Extent2D) -> Self {
        Self {
            color: Vec::new(),
            depth: None,
            area: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            },
            layer_count: 1,
            view_mask: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBinding {
    pub buffer: vk::Buffer,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBinding {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub index_type: vk::IndexType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOp {
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    Indexed {
        index_count: u32,
        instance_count: u32,
    },
}

/// Everything one pass records.
#[derive(Debug, Clone)]
pub struct PassRecipe {
    /// Transitions issued before the copies.
    pub transfer_barriers: Vec<TransitionRequest>,
    pub copies: Vec<ImageCopyOp>,
    /// Transitions issued after the copies, before rendering.
    pub pre_render: Vec<TransitionRequest>,
    pub region: RenderRegion,
    /// Images the fragment stage samples; must be in `SHADER_READ_ONLY_OPTIMAL`.
    pub sampled: Vec<ImageId>,
    pub vertex_buffer: Option<VertexBinding>,
    pub index_buffer: Option<IndexBinding>,
    pub draws: Vec<DrawOp>,
    /// Transitions issued after rendering ends.
    pub post_render: Vec<TransitionRequest>,
}

impl PassRecipe {
    /// A recipe that only renders into `region`.
    pub fn new(region: RenderRegion) -> Self {
        Self {
            transfer_barriers: Vec::new(),
            copies: Vec::new(),
            pre_render: Vec::new(),
            region,
            sampled: Vec::new(),
            vertex_buffer: None,
            index_buffer: None,
            draws: Vec::new(),
            post_render: Vec::new(),
        }
    }
}

/// What a recorded pass issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub barrier_batches: usize,
    pub barriers: usize,
    pub copies: usize,
    pub draws: usize,
    /// Views rendered per draw.
    pub views: u32,
}

/// The pass with every handle resolved and every check done.
struct PassPlan {
    transfer: BarrierBatch,
    copies: Vec<ImageCopyDesc>,
    pre_render: BarrierBatch,
    rendering: RenderingDesc,
    sampled: Vec<(vk::Image, vk::ImageLayout)>,
    post_render: BarrierBatch,
}

fn plan_attachment(
    staged: &mut BarrierSequencer,
    op: &AttachmentOp,
    access: ImageAccess,
) -> Result<AttachmentDesc> {
    let (layout, stage, mask) = access.parts();
    staged.note_access(op.image, layout, stage, mask)?;
    Ok(AttachmentDesc {
        image: staged.handle(op.image)?,
        view: op.view,
        layout,
        load_op: op.load_op,
        store_op: op.store_op,
        clear: op.clear,
    })
}

fn plan(
    staged: &mut BarrierSequencer,
    pipeline: &GraphicsPipeline,
    recipe: &PassRecipe,
) -> Result<PassPlan> {
    if recipe.region.view_mask != pipeline.view_mask() {
        return Err(GpuError::InvalidState(format!(
            "render region view mask {:#x} differs from pipeline view mask {:#x}",
            recipe.region.view_mask,
            pipeline.view_mask()
        )));
    }
    let indexed = recipe
        .draws
        .iter()
        .any(|d| matches!(d, DrawOp::Indexed { .. }));
    if indexed && recipe.index_buffer.is_none() {
        return Err(GpuError::InvalidState(
            "indexed draw without an index buffer".to_string(),
        ));
    }

    let transfer = staged.transition_batch(&recipe.transfer_barriers)?;

    let (src_layout, src_stage, src_access) = ImageAccess::TransferRead.parts();
    let (dst_layout, dst_stage, dst_access) = ImageAccess::TransferWrite.parts();
    let mut copies = Vec::with_capacity(recipe.copies.len());
    for copy in &recipe.copies {
        staged.note_access(copy.src, src_layout, src_stage, src_access)?;
        staged.note_access(copy.dst, dst_layout, dst_stage, dst_access)?;
        copies.push(ImageCopyDesc {
            src: staged.handle(copy.src)?,
            src_layout,
            dst: staged.handle(copy.dst)?,
            dst_layout,
            regions: copy.regions.clone(),
        });
    }

    let pre_render = staged.transition_batch(&recipe.pre_render)?;

    let color_attachments = recipe
        .region
        .color
        .iter()
        .map(|op| plan_attachment(staged, op, ImageAccess::ColorAttachmentWrite))
        .collect::<Result<Vec<_>>>()?;
    let depth_attachment = recipe
        .region
        .depth
        .as_ref()
        .map(|op| plan_attachment(staged, op, ImageAccess::DepthAttachmentWrite))
        .transpose()?;

    let (sampled_layout, sampled_stage, sampled_access) = ImageAccess::FragmentSampled.parts();
    let mut sampled = Vec::with_capacity(recipe.sampled.len());
    for &image in &recipe.sampled {
        staged.note_access(image, sampled_layout, sampled_stage, sampled_access)?;
        sampled.push((staged.handle(image)?, sampled_layout));
    }

    let post_render = staged.transition_batch(&recipe.post_render)?;

    Ok(PassPlan {
        transfer,
        copies,
        pre_render,
        rendering: RenderingDesc {
            area: recipe.region.area,
            layer_count: recipe.region.layer_count,
            view_mask: recipe.region.view_mask,
            color_attachments,
            depth_attachment,
        },
        sampled,
        post_render,
    })
}

/// Issue a non-empty batch.
fn issue(sink: &mut dyn CommandSink, batch: &BarrierBatch, report: &mut PassReport) {
    if !batch.is_empty() {
        sink.pipeline_barrier(batch);
        report.barrier_batches += 1;
        report.barriers += batch.len();
    }
}

/// Record one pass.
///
/// On error nothing has been recorded into `sink` and `sequencer` is unchanged.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn record_pass(
    sink: &mut dyn CommandSink,
    sequencer: &mut BarrierSequencer,
    pipeline: &GraphicsPipeline,
    descriptor_sets: &[vk::DescriptorSet],
    recipe: &PassRecipe,
) -> Result<PassReport> {
    let mut staged = sequencer.clone();
    let plan = plan(&mut staged, pipeline, recipe)?;

    let mut report = PassReport {
        views: plan.rendering.view_count(),
        ..PassReport::default()
    };

    issue(sink, &plan.transfer, &mut report);
    for copy in &plan.copies {
        sink.copy_image(copy);
    }
    issue(sink, &plan.pre_render, &mut report);

    sink.begin_rendering(&plan.rendering);
    sink.bind_graphics_pipeline(pipeline.handle());
    if !descriptor_sets.is_empty() {
        sink.bind_descriptor_sets(pipeline.layout(), 0, descriptor_sets);
    }
    if let Some(vertex) = recipe.vertex_buffer {
        sink.bind_vertex_buffer(vertex.buffer, vertex.offset);
    }
    if let Some(index) = recipe.index_buffer {
        sink.bind_index_buffer(index.buffer, index.offset, index.index_type);
    }

    if pipeline.dynamic_viewport() {
        let area = plan.rendering.area;
        sink.set_viewport(vk::Viewport {
            x: area.offset.x as f32,
            y: area.offset.y as f32,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        sink.set_scissor(area);
    }
    if !plan.sampled.is_empty() {
        sink.sample_images(&plan.sampled);
    }

    for draw in &recipe.draws {
        match *draw {
            DrawOp::Draw {
                vertex_count,
                instance_count,
            } => sink.draw(vertex_count, instance_count, 0, 0),
            DrawOp::Indexed {
                index_count,
                instance_count,
            } => sink.draw_indexed(index_count, instance_count, 0, 0, 0),
        }
    }
    sink.end_rendering();

    issue(sink, &plan.post_render, &mut report);

    report.copies = plan.copies.len();
    report.draws = recipe.draws.len();
    *sequencer = staged;

    tracing::debug!(
        batches = report.barrier_batches,
        copies = report.copies,
        draws = report.draws,
        views = report.views,
        "recorded pass"
    );
    Ok(report)
}
