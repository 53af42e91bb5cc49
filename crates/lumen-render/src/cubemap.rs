//! Cubemap format-transform pass.
//!
//! The six faces of a source cube render target are copied into a 6-layer
//! float array, which one multiview draw samples to fill a new cubemap:
//!
//! 1. source -> transfer src, faces -> transfer dst
//! 2. copy all six layers
//! 3. faces -> shader read, output -> color attachment
//! 4. full-screen triangle pair over views 0..6

use ash::vk;
use lumen_gpu::memory::color_range;
use lumen_gpu::{
    BarrierBatch, BarrierSequencer, BindingDesc, BufferUsage, ClearValue, CommandSink,
    DepthStencilConfig, DescriptorPool, DescriptorSetInstance, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DescriptorWriter, DeviceAllocator, DeviceBuffer, DeviceContext,
    DeviceImage, FrameSlots, GpuCapabilities, GpuError, GraphicsPipeline, ImageAccess, ImageDesc,
    ImageId, PipelineBuilder, PipelineLayout, PoolCapacity, Result, SamplerDesc,
    TransitionRequest, VertexInputLayout,
};

use crate::pass::{
    record_pass, AttachmentOp, DrawOp, ImageCopyOp, PassPipeline, PassRecipe, PassReport,
    RenderRegion, TargetView,
};
use crate::uniforms::{block_size, ExtentUniforms};

const CUBE_VIEWS: u32 = GpuCapabilities::CUBE_VIEWS;

/// Format of the intermediate faces and the output cubemap.
pub const FACE_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// One view per cube face.
pub const CUBE_VIEW_MASK: u32 = (1 << CUBE_VIEWS) - 1;

/// Color the output is cleared to before the draw.
pub const CLEAR_COLOR: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

/// Vertices of the full-screen draw, generated in the vertex shader.
pub const FULLSCREEN_VERTICES: u32 = 6;

/// A tracked cube render target to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubemapSource {
    pub image: ImageId,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub layers: u32,
}

impl CubemapSource {
    /// Check the source can be copied into faces of `face_size`.
    pub fn validate(&self, face_size: u32) -> Result<()> {
        if self.format != FACE_FORMAT {
            return Err(GpuError::InvalidUsageCombination(format!(
                "cubemap source format {:?}, expected {FACE_FORMAT:?}",
                self.format
            )));
        }
        if self.layers != CUBE_VIEWS {
            return Err(GpuError::InvalidUsageCombination(format!(
                "cubemap source has {} layers, expected {CUBE_VIEWS}",
                self.layers
            )));
        }
        if self.extent.width != face_size || self.extent.height != face_size {
            return Err(GpuError::InvalidUsageCombination(format!(
                "cubemap source is {}x{}, expected {face_size}x{face_size}",
                self.extent.width, self.extent.height
            )));
        }
        Ok(())
    }
}

/// Copy of all six layers at mip 0.
pub fn face_copy_region(face_size: u32) -> vk::ImageCopy {
    let layers = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: CUBE_VIEWS,
    };
    vk::ImageCopy {
        src_subresource: layers,
        src_offset: vk::Offset3D::default(),
        dst_subresource: layers,
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: face_size,
            height: face_size,
            depth: 1,
        },
    }
}

/// Everything one transform records.
pub fn cubemap_transform_recipe(
    source: ImageId,
    faces: ImageId,
    output: TargetView,
    face_size: u32,
) -> PassRecipe {
    let mut region = RenderRegion::full(vk::Extent2D {
        width: face_size,
        height: face_size,
    });
    region.view_mask = CUBE_VIEW_MASK;
    region.color.push(AttachmentOp::cleared(
        output.image,
        output.view,
        ClearValue::Color(CLEAR_COLOR),
    ));

    let mut recipe = PassRecipe::new(region);
    recipe.transfer_barriers = vec![
        TransitionRequest::to(source, ImageAccess::TransferRead),
        TransitionRequest::to(faces, ImageAccess::TransferWrite),
    ];
    recipe.copies = vec![ImageCopyOp {
        src: source,
        dst: faces,
        regions: vec![face_copy_region(face_size)],
    }];
    recipe.pre_render = vec![
        TransitionRequest::to(faces, ImageAccess::FragmentSampled),
        TransitionRequest::to(output.image, ImageAccess::ColorAttachmentWrite),
    ];
    recipe.sampled = vec![faces];
    recipe.draws = vec![DrawOp::Draw {
        vertex_count: FULLSCREEN_VERTICES,
        instance_count: 1,
    }];
    recipe
}

/// Move the output to transfer-src for a following copy.
pub fn output_handoff(
    sink: &mut dyn CommandSink,
    sequencer: &mut BarrierSequencer,
    output: ImageId,
) -> Result<BarrierBatch> {
    let batch = sequencer.transition_batch(&[TransitionRequest::to(
        output,
        ImageAccess::TransferRead,
    )])?;
    if !batch.is_empty() {
        sink.pipeline_barrier(&batch);
    }
    Ok(batch)
}

/// Creation parameters of a [`CubemapFormatPass`].
#[derive(Debug, Clone, Copy)]
pub struct CubemapPassDesc<'a> {
    pub vertex_shader: &'a [u32],
    pub fragment_shader: &'a [u32],
    pub face_size: u32,
}

/// Images and the extent block of a [`CubemapFormatPass`].
struct CubemapResources {
    faces: DeviceImage,
    output: DeviceImage,
    extent_buffer: DeviceBuffer,
}

impl CubemapResources {
    /// Create both images and the extent block, or none of them.
    fn create(allocator: &mut DeviceAllocator, face_size: u32) -> Result<Self> {
        let extent = vk::Extent2D {
            width: face_size,
            height: face_size,
        };

        let faces = allocator.create_image(
            &ImageDesc::new_2d(
                FACE_FORMAT,
                extent,
                vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .with_layers(CUBE_VIEWS)
            .with_sampler(SamplerDesc::default()),
            "cubemap_faces",
        )?;

        let output = match allocator.create_image(
            &ImageDesc::new_2d(
                FACE_FORMAT,
                extent,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .with_layers(CUBE_VIEWS)
            .cube_compatible(),
            "cubemap_output",
        ) {
            Ok(output) => output,
            Err(e) => {
                allocator.release_images([faces]);
                return Err(e);
            }
        };

        let extent_buffer = match allocator.create_uploaded_buffer(
            block_size::<ExtentUniforms>(),
            BufferUsage::Uniform,
            bytemuck::bytes_of(&ExtentUniforms::from(extent)),
            "cubemap_extent",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                allocator.release_images([output, faces]);
                return Err(e);
            }
        };

        Ok(Self {
            faces,
            output,
            extent_buffer,
        })
    }

    /// Destroy after a later construction step failed.
    fn release(self, allocator: &mut DeviceAllocator) {
        allocator.release_buffers([self.extent_buffer]);
        allocator.release_images([self.output, self.faces]);
    }

    fn destroy(self, allocator: &mut DeviceAllocator) -> Result<()> {
        allocator.destroy_buffer(self.extent_buffer)?;
        allocator.destroy_image(self.output)?;
        allocator.destroy_image(self.faces)
    }
}

/// Room for the one shared set plus any extra sets the config asks for.
fn shared_set_capacity(extra_sets: u32, bindings: &[BindingDesc]) -> PoolCapacity {
    (0..extra_sets).fold(PoolCapacity::default().with_set(bindings), |capacity, _| {
        capacity.with_set(bindings)
    })
}

/// Pool and the single set every frame binds: the faces and the extent block
/// never change after creation.
unsafe fn create_descriptors(
    ctx: &DeviceContext,
    set_layout: &DescriptorSetLayout,
    resources: &CubemapResources,
) -> Result<(DescriptorPool, DescriptorSetInstance)> {
    let device = ctx.device();
    let sampler = resources.faces.sampler.ok_or_else(|| {
        GpuError::InvalidState("cubemap faces were created without a sampler".to_string())
    })?;

    let capacity = shared_set_capacity(ctx.config().extra_descriptor_sets, set_layout.bindings());
    let mut pool = DescriptorPool::new(device, capacity)?;

    let write_set = |pool: &mut DescriptorPool| -> Result<DescriptorSetInstance> {
        let set = pool.allocate(device, set_layout, None)?;
        let mut writer = DescriptorWriter::new(&set);
        writer
            .sampled_image(
                0,
                resources.faces.view,
                sampler,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )?
            .uniform_buffer(
                1,
                resources.extent_buffer.buffer,
                0,
                block_size::<ExtentUniforms>(),
            )?;
        // Nothing has been submitted yet.
        writer.commit(device, &FrameSlots::new(ctx.config().frames_in_flight))?;
        Ok(set)
    };

    match write_set(&mut pool) {
        Ok(set) => Ok((pool, set)),
        Err(e) => {
            pool.destroy(device);
            Err(e)
        }
    }
}

/// Cube render target to float cubemap transform.
pub struct CubemapFormatPass {
    pipeline: PassPipeline,
    descriptor_pool: DescriptorPool,
    /// Shared by every frame slot.
    descriptor_set: DescriptorSetInstance,
    resources: CubemapResources,
    faces_id: ImageId,
    output_id: ImageId,
    face_size: u32,
}

impl CubemapFormatPass {
    /// Create the pipeline, intermediate faces, output cubemap and descriptor set.
    ///
    /// Both images are registered with `sequencer`. On failure every object
    /// created so far is destroyed.
    ///
    /// # Safety
    /// The context must be valid and the shaders valid SPIR-V.
    pub unsafe fn new(
        ctx: &DeviceContext,
        sequencer: &mut BarrierSequencer,
        desc: &CubemapPassDesc<'_>,
    ) -> Result<Self> {
        let device = ctx.device();

        // 1. Pipeline over the sampler + extent set layout
        let set_layout = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
            .uniform_buffer(1, vk::ShaderStageFlags::FRAGMENT);
        let pipeline = PipelineBuilder::new()
            .vertex_shader(desc.vertex_shader)
            .fragment_shader(desc.fragment_shader)
            .vertex_input(VertexInputLayout::new())
            .depth_stencil(DepthStencilConfig::disabled())
            .color_formats(&[FACE_FORMAT])
            .view_mask(CUBE_VIEW_MASK)
            .cull_mode(vk::CullModeFlags::NONE);
        let pipeline = PassPipeline::new(device, set_layout, pipeline)?;

        // 2. Images and the extent block
        let resources = CubemapResources::create(&mut ctx.allocator().lock(), desc.face_size);
        let resources = match resources {
            Ok(resources) => resources,
            Err(e) => {
                pipeline.destroy(device);
                return Err(e);
            }
        };

        // 3. Shared descriptor set
        let (descriptor_pool, descriptor_set) =
            match create_descriptors(ctx, &pipeline.set_layout, &resources) {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    resources.release(&mut ctx.allocator().lock());
                    pipeline.destroy(device);
                    return Err(e);
                }
            };

        // 4. Track both images
        let faces_id = sequencer.register_image(&resources.faces);
        let output_id = sequencer.register_image(&resources.output);

        tracing::info!(
            face_size = desc.face_size,
            view_mask = CUBE_VIEW_MASK,
            "Created cubemap format pass"
        );

        Ok(Self {
            pipeline,
            descriptor_pool,
            descriptor_set,
            resources,
            faces_id,
            output_id,
            face_size: desc.face_size,
        })
    }

    /// Record the copy and the multiview draw.
    ///
    /// The source must be a tracked `FACE_FORMAT` cube target of `face_size`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn record(
        &self,
        sink: &mut dyn CommandSink,
        sequencer: &mut BarrierSequencer,
        source: &CubemapSource,
    ) -> Result<PassReport> {
        source.validate(self.face_size)?;

        let recipe = cubemap_transform_recipe(
            source.image,
            self.faces_id,
            self.output_target(),
            self.face_size,
        );
        record_pass(
            sink,
            sequencer,
            &self.pipeline.pipeline,
            &[self.descriptor_set.handle()],
            &recipe,
        )
    }

    /// Move the output cubemap to transfer-src.
    pub fn record_output_handoff(
        &self,
        sink: &mut dyn CommandSink,
        sequencer: &mut BarrierSequencer,
    ) -> Result<BarrierBatch> {
        output_handoff(sink, sequencer, self.output_id)
    }

    pub fn pipeline(&self) -> &GraphicsPipeline {
        &self.pipeline.pipeline
    }

    pub fn pipeline_layout(&self) -> &PipelineLayout {
        &self.pipeline.layout
    }

    pub fn descriptor_set(&self) -> &DescriptorSetInstance {
        &self.descriptor_set
    }

    /// Tracked id of the intermediate face array.
    pub fn faces(&self) -> ImageId {
        self.faces_id
    }

    pub fn output_target(&self) -> TargetView {
        TargetView {
            image: self.output_id,
            view: self.resources.output.view,
        }
    }

    /// The output cubemap image.
    pub fn output_image(&self) -> &DeviceImage {
        &self.resources.output
    }

    pub fn face_size(&self) -> u32 {
        self.face_size
    }

    /// Subresource range covering every face.
    pub fn face_range() -> vk::ImageSubresourceRange {
        color_range(CUBE_VIEWS)
    }

    /// Destroy every object the pass owns.
    ///
    /// # Safety
    /// No submission recorded by this pass may still be executing.
    pub unsafe fn destroy(self, ctx: &DeviceContext, sequencer: &mut BarrierSequencer) -> Result<()> {
        let device = ctx.device();
        sequencer.unregister(self.faces_id)?;
        sequencer.unregister(self.output_id)?;

        self.descriptor_pool.destroy(device);
        self.pipeline.destroy(device);

        self.resources.destroy(&mut ctx.allocator().lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use lumen_gpu::{CommandLog, ImageState, PoolBudget, RecordedCommand};
    use std::collections::HashMap;

    const FACE: u32 = 512;

    struct Fixture {
        seq: BarrierSequencer,
        source: ImageId,
        faces: ImageId,
        output: ImageId,
        pipeline: GraphicsPipeline,
    }

    fn fixture() -> Fixture {
        let mut seq = BarrierSequencer::new();
        let source = seq.register(
            vk::Image::from_raw(1),
            CubemapFormatPass::face_range(),
            ImageState::after(ImageAccess::ColorAttachmentWrite),
        );
        let faces = seq.register(
            vk::Image::from_raw(2),
            CubemapFormatPass::face_range(),
            ImageState::UNDEFINED,
        );
        let output = seq.register(
            vk::Image::from_raw(3),
            CubemapFormatPass::face_range(),
            ImageState::UNDEFINED,
        );
        let pipeline = GraphicsPipeline::from_raw(
            vk::Pipeline::from_raw(10),
            vk::PipelineLayout::from_raw(11),
            CUBE_VIEW_MASK,
            true,
        );
        Fixture {
            seq,
            source,
            faces,
            output,
            pipeline,
        }
    }

    fn recipe(f: &Fixture) -> PassRecipe {
        cubemap_transform_recipe(
            f.source,
            f.faces,
            TargetView {
                image: f.output,
                view: vk::ImageView::from_raw(4),
            },
            FACE,
        )
    }

    #[test]
    fn view_mask_covers_six_faces() {
        assert_eq!(CUBE_VIEW_MASK, 0x3F);
        assert_eq!(CUBE_VIEW_MASK.count_ones(), 6);
    }

    #[test]
    fn transform_end_to_end() {
        let mut f = fixture();
        let recipe = recipe(&f);
        let mut log = CommandLog::new();
        let report = record_pass(
            &mut log,
            &mut f.seq,
            &f.pipeline,
            &[vk::DescriptorSet::from_raw(12)],
            &recipe,
        )
        .unwrap();

        assert_eq!(report.barrier_batches, 2);
        assert_eq!(report.barriers, 4);
        assert_eq!(report.copies, 1);
        assert_eq!(report.draws, 1);
        assert_eq!(report.views, 6);
        assert_eq!(log.draw_count(), 1);

        assert_eq!(
            f.seq.layout(f.output).unwrap(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            f.seq.layout(f.faces).unwrap(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            f.seq.layout(f.source).unwrap(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );

        let rendering = log
            .commands()
            .iter()
            .find_map(|c| match c {
                RecordedCommand::BeginRendering(desc) => Some(desc.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(rendering.view_mask, 0x3F);
        assert_eq!(rendering.view_count(), 6);
        assert_eq!(rendering.area.extent.width, FACE);

        let initial = HashMap::from([(
            vk::Image::from_raw(1),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )]);
        let finals = log.replay_layouts(&initial).unwrap();
        assert_eq!(
            finals[&vk::Image::from_raw(3)],
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn batches_follow_cube_state_machine() {
        let mut f = fixture();
        let recipe = recipe(&f);
        let mut log = CommandLog::new();
        record_pass(&mut log, &mut f.seq, &f.pipeline, &[], &recipe).unwrap();

        let batches: Vec<_> = log.barrier_batches().collect();
        let first = batches[0];
        assert_eq!(
            first.step_for(f.source).unwrap().old.layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            first.step_for(f.faces).unwrap().new.layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );

        let second = batches[1];
        assert_eq!(
            second.step_for(f.faces).unwrap().old.layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            second.step_for(f.output).unwrap().old.layout,
            vk::ImageLayout::UNDEFINED
        );

        let names = log.names();
        let copy = names.iter().position(|n| *n == "copy_image").unwrap();
        let begin = names.iter().position(|n| *n == "begin_rendering").unwrap();
        assert!(copy < begin);
    }

    #[test]
    fn one_shared_set_is_budgeted() {
        let bindings = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
            .uniform_buffer(1, vk::ShaderStageFlags::FRAGMENT)
            .bindings()
            .to_vec();

        let capacity = shared_set_capacity(0, &bindings);
        assert_eq!(capacity.max_sets, 1);
        assert_eq!(capacity.combined_image_samplers, 1);
        assert_eq!(capacity.uniform_buffers, 1);

        let mut budget = PoolBudget::new(capacity);
        assert!(budget.reserve(&bindings).is_ok());
        assert!(matches!(
            budget.reserve(&bindings),
            Err(GpuError::PoolExhausted(_))
        ));

        assert_eq!(shared_set_capacity(2, &bindings).max_sets, 3);
    }

    #[test]
    fn faces_are_declared_shader_readable_before_the_draw() {
        let mut f = fixture();
        let recipe = recipe(&f);
        let mut log = CommandLog::new();
        record_pass(&mut log, &mut f.seq, &f.pipeline, &[], &recipe).unwrap();

        let names = log.names();
        let sampled = names.iter().position(|n| *n == "sampled_images").unwrap();
        let draw = names.iter().position(|n| *n == "draw").unwrap();
        assert!(sampled < draw);
        assert!(log.commands().iter().any(|c| matches!(
            c,
            RecordedCommand::SampledImages(images)
                if images == &[(vk::Image::from_raw(2), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
        )));
    }

    #[test]
    fn copy_covers_every_layer() {
        let region = face_copy_region(FACE);
        assert_eq!(region.src_subresource.layer_count, 6);
        assert_eq!(region.dst_subresource.layer_count, 6);
        assert_eq!(region.extent.width, FACE);
        assert_eq!(region.extent.depth, 1);
    }

    #[test]
    fn handoff_moves_output_to_transfer_src() {
        let mut f = fixture();
        let recipe = recipe(&f);
        let mut log = CommandLog::new();
        record_pass(&mut log, &mut f.seq, &f.pipeline, &[], &recipe).unwrap();

        let batch = output_handoff(&mut log, &mut f.seq, f.output).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(
            f.seq.layout(f.output).unwrap(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(log.barrier_batches().count(), 3);
    }

    #[test]
    fn source_must_be_a_matching_cube() {
        let mut source = CubemapSource {
            image: fixture().source,
            format: FACE_FORMAT,
            extent: vk::Extent2D {
                width: FACE,
                height: FACE,
            },
            layers: 6,
        };
        assert!(source.validate(FACE).is_ok());

        source.layers = 1;
        assert!(matches!(
            source.validate(FACE),
            Err(GpuError::InvalidUsageCombination(_))
        ));

        source.layers = 6;
        source.format = vk::Format::R8G8B8A8_UNORM;
        assert!(source.validate(FACE).is_err());

        source.format = FACE_FORMAT;
        assert!(source.validate(256).is_err());
    }
}
