//! Forward-lit mesh pass.
//!
//! Draws an indexed triangle mesh with a depth buffer. Each frame slot has
//! its own transform buffer and descriptor set; the light block is shared.

use ash::vk;
use lumen_gpu::{
    BarrierSequencer, BufferUsage, ClearValue, CommandSink, DepthStencilConfig, DescriptorPool,
    DescriptorSetInstance, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    DeviceAllocator, DeviceBuffer, DeviceContext, DeviceImage, FrameSlots, GpuError,
    GraphicsPipeline, ImageAccess, ImageDesc, ImageId, PipelineBuilder, PipelineLayout,
    PoolCapacity, Result, TransitionRequest, VertexInputLayout,
};

use crate::mesh::{MeshData, NORMAL_OFFSET, VERTEX_STRIDE};
use crate::pass::{
    record_pass, AttachmentOp, DrawOp, IndexBinding, PassPipeline, PassRecipe, PassReport,
    RenderRegion, TargetView, VertexBinding,
};
use crate::uniforms::{block_size, LightUniforms, MvpUniforms};

/// Depth buffer format.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Color the target is cleared to.
pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Position at location 0, normal at location 1, one interleaved buffer.
pub fn vertex_layout() -> VertexInputLayout {
    VertexInputLayout::new()
        .binding(0, VERTEX_STRIDE)
        .attribute(0, 0, vk::Format::R32G32B32_SFLOAT, 0)
        .attribute(1, 0, vk::Format::R32G32B32_SFLOAT, NORMAL_OFFSET)
}

/// Mesh buffers as bound at draw time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshBuffers {
    pub vertex: vk::Buffer,
    pub index: vk::Buffer,
    pub index_count: u32,
}

/// Everything one forward frame records.
pub fn forward_recipe(
    target: TargetView,
    depth: TargetView,
    extent: vk::Extent2D,
    mesh: MeshBuffers,
    post_render: &[TransitionRequest],
) -> PassRecipe {
    let mut region = RenderRegion::full(extent);
    region.color.push(AttachmentOp::cleared(
        target.image,
        target.view,
        ClearValue::Color(CLEAR_COLOR),
    ));
    region.depth = Some(
        AttachmentOp::cleared(
            depth.image,
            depth.view,
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
        )
        .transient(),
    );

    let mut recipe = PassRecipe::new(region);
    recipe.pre_render = vec![
        TransitionRequest::to(target.image, ImageAccess::ColorAttachmentWrite),
        TransitionRequest::to(depth.image, ImageAccess::DepthAttachmentWrite),
    ];
    recipe.vertex_buffer = Some(VertexBinding {
        buffer: mesh.vertex,
        offset: 0,
    });
    recipe.index_buffer = Some(IndexBinding {
        buffer: mesh.index,
        offset: 0,
        index_type: vk::IndexType::UINT32,
    });
    recipe.draws = vec![DrawOp::Indexed {
        index_count: mesh.index_count,
        instance_count: 1,
    }];
    recipe.post_render = post_render.to_vec();
    recipe
}

/// Creation parameters of a [`ForwardPass`].
#[derive(Debug, Clone, Copy)]
pub struct ForwardPassDesc<'a> {
    pub vertex_shader: &'a [u32],
    pub fragment_shader: &'a [u32],
    pub mesh: &'a MeshData,
    pub color_format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Buffers and the depth image of a [`ForwardPass`].
struct ForwardResources {
    vertex_buffer: DeviceBuffer,
    index_buffer: DeviceBuffer,
    light_buffer: DeviceBuffer,
    /// One per frame slot.
    mvp_buffers: Vec<DeviceBuffer>,
    depth: DeviceImage,
}

impl ForwardResources {
    /// Create every buffer and the depth image, or none of them.
    fn create(
        allocator: &mut DeviceAllocator,
        desc: &ForwardPassDesc<'_>,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let vertex_bytes = desc.mesh.vertex_bytes();
        let vertex_buffer = allocator.create_uploaded_buffer(
            vertex_bytes.len() as u64,
            BufferUsage::Vertex,
            vertex_bytes,
            "forward_vertices",
        )?;

        let index_bytes = desc.mesh.index_bytes();
        let index_buffer = match allocator.create_uploaded_buffer(
            index_bytes.len() as u64,
            BufferUsage::Index,
            index_bytes,
            "forward_indices",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                allocator.release_buffers([vertex_buffer]);
                return Err(e);
            }
        };

        let light_buffer = match allocator.create_uploaded_buffer(
            block_size::<LightUniforms>(),
            BufferUsage::Uniform,
            bytemuck::bytes_of(&LightUniforms::default()),
            "forward_lights",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                allocator.release_buffers([index_buffer, vertex_buffer]);
                return Err(e);
            }
        };

        let mut mvp_buffers = Vec::with_capacity(frames_in_flight);
        for i in 0..frames_in_flight {
            match allocator.create_uploaded_buffer(
                block_size::<MvpUniforms>(),
                BufferUsage::Uniform,
                bytemuck::bytes_of(&MvpUniforms::default()),
                &format!("forward_mvp_{i}"),
            ) {
                Ok(buffer) => mvp_buffers.push(buffer),
                Err(e) => {
                    allocator.release_buffers(mvp_buffers);
                    allocator.release_buffers([light_buffer, index_buffer, vertex_buffer]);
                    return Err(e);
                }
            }
        }

        let depth = match allocator.create_image(
            &ImageDesc::new_2d(
                DEPTH_FORMAT,
                desc.extent,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ),
            "forward_depth",
        ) {
            Ok(depth) => depth,
            Err(e) => {
                allocator.release_buffers(mvp_buffers);
                allocator.release_buffers([light_buffer, index_buffer, vertex_buffer]);
                return Err(e);
            }
        };

        Ok(Self {
            vertex_buffer,
            index_buffer,
            light_buffer,
            mvp_buffers,
            depth,
        })
    }

    /// Destroy after a later construction step failed.
    fn release(self, allocator: &mut DeviceAllocator) {
        allocator.release_images([self.depth]);
        allocator.release_buffers(self.mvp_buffers);
        allocator.release_buffers([self.light_buffer, self.index_buffer, self.vertex_buffer]);
    }

    fn destroy(self, allocator: &mut DeviceAllocator) -> Result<()> {
        allocator.destroy_image(self.depth)?;
        for buffer in self.mvp_buffers {
            allocator.destroy_buffer(buffer)?;
        }
        allocator.destroy_buffer(self.light_buffer)?;
        allocator.destroy_buffer(self.index_buffer)?;
        allocator.destroy_buffer(self.vertex_buffer)
    }
}

/// Pool and per-frame sets, each pointing at its slot's transforms and the
/// shared lights.
unsafe fn create_descriptors(
    ctx: &DeviceContext,
    set_layout: &DescriptorSetLayout,
    resources: &ForwardResources,
) -> Result<(DescriptorPool, Vec<DescriptorSetInstance>)> {
    let device = ctx.device();
    let frames_in_flight = resources.mvp_buffers.len();

    let capacity = (0..ctx.config().extra_descriptor_sets).fold(
        PoolCapacity::for_layouts(frames_in_flight as u32, &[set_layout.bindings()]),
        |capacity, _| capacity.with_set(set_layout.bindings()),
    );
    let mut pool = DescriptorPool::new(device, capacity)?;

    let write_sets = |pool: &mut DescriptorPool| -> Result<Vec<DescriptorSetInstance>> {
        let sets = pool.allocate_per_frame(device, set_layout, frames_in_flight)?;
        // Nothing has been submitted yet.
        let idle = FrameSlots::new(frames_in_flight);
        for (set, mvp) in sets.iter().zip(&resources.mvp_buffers) {
            let mut writer = DescriptorWriter::new(set);
            writer
                .uniform_buffer(0, mvp.buffer, 0, block_size::<MvpUniforms>())?
                .uniform_buffer(
                    1,
                    resources.light_buffer.buffer,
                    0,
                    block_size::<LightUniforms>(),
                )?;
            writer.commit(device, &idle)?;
        }
        Ok(sets)
    };

    match write_sets(&mut pool) {
        Ok(sets) => Ok((pool, sets)),
        Err(e) => {
            pool.destroy(device);
            Err(e)
        }
    }
}

/// Record `recipe`, then write the uniforms it reads.
///
/// A pass that fails to record leaves the uniforms untouched.
fn record_with_uniforms(
    sink: &mut dyn CommandSink,
    sequencer: &mut BarrierSequencer,
    pipeline: &GraphicsPipeline,
    descriptor_sets: &[vk::DescriptorSet],
    recipe: &PassRecipe,
    write_uniforms: impl FnOnce() -> Result<()>,
) -> Result<PassReport> {
    let report = record_pass(sink, sequencer, pipeline, descriptor_sets, recipe)?;
    write_uniforms()?;
    Ok(report)
}

/// Forward-lit mesh pass.
pub struct ForwardPass {
    pipeline: PassPipeline,
    descriptor_pool: DescriptorPool,
    /// One per frame slot.
    descriptor_sets: Vec<DescriptorSetInstance>,
    resources: ForwardResources,
    depth_id: ImageId,
    index_count: u32,
    extent: vk::Extent2D,
}

impl ForwardPass {
    /// Create the pipeline, buffers, depth image and descriptor sets.
    ///
    /// The depth image is registered with `sequencer`. On failure every
    /// object created so far is destroyed.
    ///
    /// # Safety
    /// The context must be valid and the shaders valid SPIR-V.
    pub unsafe fn new(
        ctx: &DeviceContext,
        sequencer: &mut BarrierSequencer,
        desc: &ForwardPassDesc<'_>,
    ) -> Result<Self> {
        let device = ctx.device();
        let frames_in_flight = ctx.config().frames_in_flight;

        // Binding 0: per-frame transforms
        // Binding 1: shared lights
        let set_layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .uniform_buffer(1, vk::ShaderStageFlags::FRAGMENT);

        let pipeline = PipelineBuilder::new()
            .vertex_shader(desc.vertex_shader)
            .fragment_shader(desc.fragment_shader)
            .vertex_input(vertex_layout())
            .depth_stencil(DepthStencilConfig::read_write(vk::CompareOp::LESS_OR_EQUAL))
            .color_formats(&[desc.color_format])
            .depth_format(DEPTH_FORMAT)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE);

        let pipeline = PassPipeline::new(device, set_layout, pipeline)?;

        let resources =
            ForwardResources::create(&mut ctx.allocator().lock(), desc, frames_in_flight);
        let resources = match resources {
            Ok(resources) => resources,
            Err(e) => {
                pipeline.destroy(device);
                return Err(e);
            }
        };

        let (descriptor_pool, descriptor_sets) =
            match create_descriptors(ctx, &pipeline.set_layout, &resources) {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    resources.release(&mut ctx.allocator().lock());
                    pipeline.destroy(device);
                    return Err(e);
                }
            };

        let depth_id = sequencer.register_image(&resources.depth);

        tracing::info!(
            vertices = desc.mesh.vertex_count(),
            indices = desc.mesh.index_count(),
            width = desc.extent.width,
            height = desc.extent.height,
            frames_in_flight,
            "Created forward pass"
        );

        Ok(Self {
            pipeline,
            descriptor_pool,
            descriptor_sets,
            resources,
            depth_id,
            index_count: desc.mesh.index_count(),
            extent: desc.extent,
        })
    }

    fn check_slot(&self, frame_slot: usize) -> Result<()> {
        if frame_slot < self.descriptor_sets.len() {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "frame slot {frame_slot} out of range ({} slots)",
                self.descriptor_sets.len()
            )))
        }
    }

    /// Replace the shared light block. Every frame slot must be idle.
    pub fn set_lights(&mut self, slots: &FrameSlots, lights: &LightUniforms) -> Result<()> {
        if let Some(slot) = slots.first_in_flight() {
            return Err(GpuError::InvalidState(format!(
                "light buffer is read by frame slot {slot}, still in flight"
            )));
        }
        self.resources
            .light_buffer
            .upload(std::slice::from_ref(lights))
    }

    /// Record the pass, then upload this slot's transforms.
    ///
    /// `frame_slot` must be the slot returned by the current `begin_frame`.
    /// `post_render` transitions run after rendering, e.g. to hand the target
    /// to presentation.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn record(
        &mut self,
        sink: &mut dyn CommandSink,
        sequencer: &mut BarrierSequencer,
        frame_slot: usize,
        target: TargetView,
        mvp: &MvpUniforms,
        post_render: &[TransitionRequest],
    ) -> Result<PassReport> {
        self.check_slot(frame_slot)?;

        let recipe = forward_recipe(
            target,
            self.depth_target(),
            self.extent,
            self.mesh_buffers(),
            post_render,
        );
        let sets = [self.descriptor_sets[frame_slot].handle()];
        let mvp_buffer = &mut self.resources.mvp_buffers[frame_slot];
        record_with_uniforms(
            sink,
            sequencer,
            &self.pipeline.pipeline,
            &sets,
            &recipe,
            || mvp_buffer.upload(std::slice::from_ref(mvp)),
        )
    }

    pub fn pipeline(&self) -> &GraphicsPipeline {
        &self.pipeline.pipeline
    }

    pub fn pipeline_layout(&self) -> &PipelineLayout {
        &self.pipeline.layout
    }

    /// Descriptor set of a frame slot.
    pub fn descriptor_set(&self, frame_slot: usize) -> Option<&DescriptorSetInstance> {
        self.descriptor_sets.get(frame_slot)
    }

    /// The depth attachment.
    pub fn depth_target(&self) -> TargetView {
        TargetView {
            image: self.depth_id,
            view: self.resources.depth.view,
        }
    }

    pub fn mesh_buffers(&self) -> MeshBuffers {
        MeshBuffers {
            vertex: self.resources.vertex_buffer.buffer,
            index: self.resources.index_buffer.buffer,
            index_count: self.index_count,
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Destroy every object the pass owns.
    ///
    /// # Safety
    /// No submission recorded by this pass may still be executing.
    pub unsafe fn destroy(self, ctx: &DeviceContext, sequencer: &mut BarrierSequencer) -> Result<()> {
        let device = ctx.device();
        sequencer.unregister(self.depth_id)?;

        self.descriptor_pool.destroy(device);
        self.pipeline.destroy(device);

        self.resources.destroy(&mut ctx.allocator().lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use lumen_gpu::memory::color_range;
    use lumen_gpu::{CommandLog, ImageState, RecordedCommand};
    use std::collections::HashMap;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    fn depth_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            ..color_range(1)
        }
    }

    #[test]
    fn vertex_layout_matches_mesh() {
        let layout = vertex_layout();
        assert_eq!(layout.bindings()[0].stride, 24);
        assert_eq!(layout.attributes()[0].location, 0);
        assert_eq!(layout.attributes()[1].location, 1);
        assert_eq!(layout.attributes()[1].offset, 12);
    }

    #[test]
    fn sphere_frame_records_indexed_draw() {
        let color_handle = vk::Image::from_raw(1);
        let depth_handle = vk::Image::from_raw(2);
        let mut seq = BarrierSequencer::new();
        let color = seq.register(color_handle, color_range(1), ImageState::UNDEFINED);
        let depth = seq.register(depth_handle, depth_range(), ImageState::UNDEFINED);

        let sphere = MeshData::icosphere(1);
        let recipe = forward_recipe(
            TargetView {
                image: color,
                view: vk::ImageView::from_raw(3),
            },
            TargetView {
                image: depth,
                view: vk::ImageView::from_raw(4),
            },
            EXTENT,
            MeshBuffers {
                vertex: vk::Buffer::from_raw(5),
                index: vk::Buffer::from_raw(6),
                index_count: sphere.index_count(),
            },
            &[TransitionRequest::to(color, ImageAccess::Present)],
        );

        let pipeline = GraphicsPipeline::from_raw(
            vk::Pipeline::from_raw(7),
            vk::PipelineLayout::from_raw(8),
            0,
            true,
        );
        let mut log = CommandLog::new();
        let report = record_pass(
            &mut log,
            &mut seq,
            &pipeline,
            &[vk::DescriptorSet::from_raw(9)],
            &recipe,
        )
        .unwrap();

        assert_eq!(report.barrier_batches, 2);
        assert_eq!(report.barriers, 3);
        assert_eq!(report.views, 1);
        assert!(log.commands().iter().any(|c| matches!(
            c,
            RecordedCommand::DrawIndexed {
                index_count: 240,
                instance_count: 1
            }
        )));
        assert!(log.names().contains(&"bind_vertex_buffer"));
        assert!(log.names().contains(&"bind_index_buffer"));

        let depth_step = log
            .barrier_batches()
            .next()
            .and_then(|b| b.step_for(depth))
            .copied()
            .unwrap();
        assert_eq!(
            depth_step.new.layout,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            depth_step.range.aspect_mask,
            vk::ImageAspectFlags::DEPTH
        );

        let finals = log.replay_layouts(&HashMap::new()).unwrap();
        assert_eq!(finals[&color_handle], vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            finals[&depth_handle],
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn transforms_written_only_after_pass_records() {
        let mut seq = BarrierSequencer::new();
        let color = seq.register(vk::Image::from_raw(1), color_range(1), ImageState::UNDEFINED);
        let depth = seq.register(vk::Image::from_raw(2), depth_range(), ImageState::UNDEFINED);
        let recipe = forward_recipe(
            TargetView {
                image: color,
                view: vk::ImageView::from_raw(3),
            },
            TargetView {
                image: depth,
                view: vk::ImageView::from_raw(4),
            },
            EXTENT,
            MeshBuffers {
                vertex: vk::Buffer::from_raw(5),
                index: vk::Buffer::from_raw(6),
                index_count: 240,
            },
            &[],
        );

        let mvp = MvpUniforms::default();
        let mut mapped = vec![0_u8; 256];

        // A multiview pipeline cannot record a single-view region.
        let multiview = GraphicsPipeline::from_raw(
            vk::Pipeline::from_raw(7),
            vk::PipelineLayout::from_raw(8),
            0x3F,
            true,
        );
        let mut log = CommandLog::new();
        let result = record_with_uniforms(&mut log, &mut seq, &multiview, &[], &recipe, || {
            lumen_gpu::memory::write_mapped(&mut mapped, bytemuck::bytes_of(&mvp))
        });
        assert!(result.is_err());
        assert!(log.commands().is_empty());
        assert!(mapped.iter().all(|&b| b == 0));

        let pipeline = GraphicsPipeline::from_raw(
            vk::Pipeline::from_raw(7),
            vk::PipelineLayout::from_raw(8),
            0,
            true,
        );
        record_with_uniforms(&mut log, &mut seq, &pipeline, &[], &recipe, || {
            lumen_gpu::memory::write_mapped(&mut mapped, bytemuck::bytes_of(&mvp))
        })
        .unwrap();
        assert_eq!(&mapped[..std::mem::size_of::<MvpUniforms>()], bytemuck::bytes_of(&mvp));
        assert_eq!(log.draw_count(), 1);
    }

    #[test]
    fn depth_is_cleared_and_discarded() {
        let mut seq = BarrierSequencer::new();
        let color = seq.register(vk::Image::from_raw(1), color_range(1), ImageState::UNDEFINED);
        let depth = seq.register(vk::Image::from_raw(2), depth_range(), ImageState::UNDEFINED);
        let recipe = forward_recipe(
            TargetView {
                image: color,
                view: vk::ImageView::null(),
            },
            TargetView {
                image: depth,
                view: vk::ImageView::null(),
            },
            EXTENT,
            MeshBuffers {
                vertex: vk::Buffer::null(),
                index: vk::Buffer::null(),
                index_count: 3,
            },
            &[],
        );

        let depth_op = recipe.region.depth.unwrap();
        assert_eq!(depth_op.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(depth_op.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(
            depth_op.clear,
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0
            }
        );
        assert_eq!(recipe.region.color[0].store_op, vk::AttachmentStoreOp::STORE);
        assert!(recipe.post_render.is_empty());
    }
}
