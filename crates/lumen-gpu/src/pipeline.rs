//! Graphics pipeline construction for dynamic rendering (Vulkan 1.3).

use crate::error::{GpuError, Result};
use crate::shader::create_shader_module;
use ash::vk;

/// Vertex buffer bindings and the attributes read from them.
#[derive(Debug, Clone, Default)]
pub struct VertexInputLayout {
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexInputLayout {
    /// Layout with no vertex buffers (vertices generated in the shader).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a per-vertex buffer binding.
    pub fn binding(mut self, binding: u32, stride: u32) -> Self {
        self.bindings.push(vk::VertexInputBindingDescription {
            binding,
            stride,
            input_rate: vk::VertexInputRate::VERTEX,
        });
        self
    }

    /// Add an attribute read from `binding` at `offset`.
    pub fn attribute(mut self, location: u32, binding: u32, format: vk::Format, offset: u32) -> Self {
        self.attributes.push(vk::VertexInputAttributeDescription {
            location,
            binding,
            format,
            offset,
        });
        self
    }

    pub fn bindings(&self) -> &[vk::VertexInputBindingDescription] {
        &self.bindings
    }

    pub fn attributes(&self) -> &[vk::VertexInputAttributeDescription] {
        &self.attributes
    }

    fn validate(&self) -> Result<()> {
        let declared = |b: u32| self.bindings.iter().any(|d| d.binding == b);
        if self.attributes.iter().all(|a| declared(a.binding)) {
            Ok(())
        } else {
            Err(GpuError::IncompletePipelineState("vertex binding"))
        }
    }
}

/// Depth test configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilConfig {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthStencilConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl DepthStencilConfig {
    /// No depth test, no depth writes.
    pub fn disabled() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            compare_op: vk::CompareOp::ALWAYS,
        }
    }

    /// Test and write depth with `compare_op`.
    pub fn read_write(compare_op: vk::CompareOp) -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare_op,
        }
    }
}

/// Descriptor set layouts and push-constant ranges shared by pipelines.
#[derive(Debug)]
pub struct PipelineLayout {
    handle: vk::PipelineLayout,
}

impl PipelineLayout {
    /// Create a pipeline layout.
    ///
    /// # Safety
    /// The device and set layouts must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let handle = device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

        Ok(Self { handle })
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    /// Destroy the layout.
    ///
    /// # Safety
    /// No pipeline created with this layout may still be in use.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_pipeline_layout(self.handle, None);
    }
}

/// A built graphics pipeline.
#[derive(Debug)]
pub struct GraphicsPipeline {
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    view_mask: u32,
    dynamic_viewport: bool,
}

impl GraphicsPipeline {
    /// Wrap a pipeline created outside the builder.
    pub fn from_raw(
        handle: vk::Pipeline,
        layout: vk::PipelineLayout,
        view_mask: u32,
        dynamic_viewport: bool,
    ) -> Self {
        Self {
            handle,
            layout,
            view_mask,
            dynamic_viewport,
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    /// Layout the pipeline was built against. Owned by the caller's [`PipelineLayout`].
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Multiview mask the pipeline was built for.
    pub fn view_mask(&self) -> u32 {
        self.view_mask
    }

    /// Whether viewport and scissor must be set at record time.
    pub fn dynamic_viewport(&self) -> bool {
        self.dynamic_viewport
    }

    /// Destroy the pipeline. The layout is left alone.
    ///
    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_pipeline(self.handle, None);
    }
}

/// Accumulates graphics pipeline state.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    vertex_shader: Vec<u32>,
    fragment_shader: Vec<u32>,
    vertex_input: VertexInputLayout,
    depth_stencil: DepthStencilConfig,
    color_formats: Vec<vk::Format>,
    depth_format: Option<vk::Format>,
    view_mask: u32,
    topology: vk::PrimitiveTopology,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    dynamic_viewport: bool,
    viewport_extent: Option<vk::Extent2D>,
    layout: Option<vk::PipelineLayout>,
    built: bool,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            vertex_input: VertexInputLayout::new(),
            depth_stencil: DepthStencilConfig::disabled(),
            color_formats: Vec::new(),
            depth_format: None,
            view_mask: 0,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            dynamic_viewport: true,
            viewport_extent: None,
            layout: None,
            built: false,
        }
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vertex stage SPIR-V, entry point `main`.
    pub fn vertex_shader(mut self, code: &[u32]) -> Self {
        self.vertex_shader = code.to_vec();
        self
    }

    /// Fragment stage SPIR-V, entry point `main`.
    pub fn fragment_shader(mut self, code: &[u32]) -> Self {
        self.fragment_shader = code.to_vec();
        self
    }

    pub fn vertex_input(mut self, layout: VertexInputLayout) -> Self {
        self.vertex_input = layout;
        self
    }

    pub fn depth_stencil(mut self, config: DepthStencilConfig) -> Self {
        self.depth_stencil = config;
        self
    }

    pub fn color_formats(mut self, formats: &[vk::Format]) -> Self {
        self.color_formats = formats.to_vec();
        self
    }

    pub fn depth_format(mut self, format: vk::Format) -> Self {
        self.depth_format = Some(format);
        self
    }

    /// Multiview mask; bit `n` renders view `n`.
    pub fn view_mask(mut self, mask: u32) -> Self {
        self.view_mask = mask;
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn front_face(mut self, front_face: vk::FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    /// Whether viewport and scissor are dynamic state. Defaults to `true`.
    pub fn dynamic_viewport(mut self, dynamic: bool) -> Self {
        self.dynamic_viewport = dynamic;
        self
    }

    /// Baked viewport and scissor, used when the viewport is not dynamic.
    pub fn viewport_extent(mut self, extent: vk::Extent2D) -> Self {
        self.viewport_extent = Some(extent);
        self
    }

    pub fn layout(mut self, layout: &PipelineLayout) -> Self {
        self.layout = Some(layout.handle());
        self
    }

    /// Allow the builder to build again.
    pub fn reset(&mut self) {
        self.built = false;
    }

    /// Check that every required field is set.
    pub fn validate(&self) -> Result<()> {
        if self.vertex_shader.is_empty() {
            return Err(GpuError::IncompletePipelineState("vertex shader"));
        }
        if self.fragment_shader.is_empty() {
            return Err(GpuError::IncompletePipelineState("fragment shader"));
        }
        if self.layout.is_none() {
            return Err(GpuError::IncompletePipelineState("pipeline layout"));
        }
        if self.color_formats.is_empty() && self.depth_format.is_none() {
            return Err(GpuError::IncompletePipelineState("render target formats"));
        }
        if self.depth_stencil.depth_test && self.depth_format.is_none() {
            return Err(GpuError::IncompletePipelineState("depth format"));
        }
        if !self.dynamic_viewport && self.viewport_extent.is_none() {
            return Err(GpuError::IncompletePipelineState("viewport extent"));
        }
        self.vertex_input.validate()
    }

    fn check_buildable(&self) -> Result<vk::PipelineLayout> {
        if self.built {
            return Err(GpuError::InvalidState(
                "pipeline builder already built; call reset() first".to_string(),
            ));
        }
        self.validate()?;
        self.layout
            .ok_or(GpuError::IncompletePipelineState("pipeline layout"))
    }

    /// Create the pipeline.
    ///
    /// # Safety
    /// The device must be valid, the shaders valid SPIR-V and the layout alive.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn build(&mut self, device: &ash::Device) -> Result<GraphicsPipeline> {
        let layout = self.check_buildable()?;

        let vert_module = create_shader_module(device, &self.vertex_shader)?;
        let frag_module = match create_shader_module(device, &self.fragment_shader) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_shader_module(vert_module, None);
                return Err(e);
            }
        };

        let result = self.create_pipeline(device, layout, vert_module, frag_module);

        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);

        let handle = result?;
        self.built = true;

        tracing::info!(
            colors = self.color_formats.len(),
            depth = self.depth_format.is_some(),
            view_mask = self.view_mask,
            "Created graphics pipeline"
        );

        Ok(GraphicsPipeline {
            handle,
            layout,
            view_mask: self.view_mask,
            dynamic_viewport: self.dynamic_viewport,
        })
    }

    unsafe fn create_pipeline(
        &self,
        device: &ash::Device,
        layout: vk::PipelineLayout,
        vert_module: vk::ShaderModule,
        frag_module: vk::ShaderModule,
    ) -> Result<vk::Pipeline> {
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(self.vertex_input.bindings())
            .vertex_attribute_descriptions(self.vertex_input.attributes());

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(self.topology)
            .primitive_restart_enable(false);

        let extent = self.viewport_extent.unwrap_or_default();
        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        }];
        let viewport_state = if self.dynamic_viewport {
            vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1)
        } else {
            vk::PipelineViewportStateCreateInfo::default()
                .viewports(&viewports)
                .scissors(&scissors)
        };

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_stencil.depth_test)
            .depth_write_enable(self.depth_stencil.depth_write)
            .depth_compare_op(self.depth_stencil.compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);

        let color_blend_attachments: Vec<_> = self
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(false)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states: &[vk::DynamicState] = if self.dynamic_viewport {
            &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        } else {
            &[]
        };
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .view_mask(self.view_mask)
            .color_attachment_formats(&self.color_formats);
        if let Some(depth_format) = self.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines = device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;

        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

    fn complete() -> PipelineBuilder {
        let mut builder = PipelineBuilder::new()
            .vertex_shader(&SPIRV)
            .fragment_shader(&SPIRV)
            .color_formats(&[vk::Format::R8G8B8A8_UNORM]);
        builder.layout = Some(vk::PipelineLayout::from_raw(7));
        builder
    }

    #[test]
    fn complete_builder_validates() {
        assert!(complete().validate().is_ok());
    }

    #[test]
    fn missing_stages_are_reported() {
        let mut builder = complete();
        builder.vertex_shader.clear();
        assert!(matches!(
            builder.validate(),
            Err(GpuError::IncompletePipelineState("vertex shader"))
        ));

        let mut builder = complete();
        builder.fragment_shader.clear();
        assert!(matches!(
            builder.validate(),
            Err(GpuError::IncompletePipelineState("fragment shader"))
        ));
    }

    #[test]
    fn missing_layout_and_targets_are_reported() {
        let mut builder = complete();
        builder.layout = None;
        assert!(matches!(
            builder.validate(),
            Err(GpuError::IncompletePipelineState("pipeline layout"))
        ));

        let mut builder = complete();
        builder.color_formats.clear();
        assert!(matches!(
            builder.validate(),
            Err(GpuError::IncompletePipelineState("render target formats"))
        ));

        // A depth-only pipeline is fine.
        let builder = builder.depth_format(vk::Format::D32_SFLOAT);
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn depth_test_needs_depth_format() {
        let builder = complete().depth_stencil(DepthStencilConfig::read_write(
            vk::CompareOp::LESS_OR_EQUAL,
        ));
        assert!(matches!(
            builder.validate(),
            Err(GpuError::IncompletePipelineState("depth format"))
        ));
        assert!(builder.depth_format(vk::Format::D32_SFLOAT).validate().is_ok());
    }

    #[test]
    fn static_viewport_needs_extent() {
        let builder = complete().dynamic_viewport(false);
        assert!(builder.validate().is_err());
        let builder = builder.viewport_extent(vk::Extent2D {
            width: 512,
            height: 512,
        });
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn attribute_needs_declared_binding() {
        let layout = VertexInputLayout::new().attribute(0, 0, vk::Format::R32G32B32_SFLOAT, 0);
        assert!(complete().vertex_input(layout).validate().is_err());

        let layout = VertexInputLayout::new()
            .binding(0, 24)
            .attribute(0, 0, vk::Format::R32G32B32_SFLOAT, 0)
            .attribute(1, 0, vk::Format::R32G32B32_SFLOAT, 12);
        let builder = complete().vertex_input(layout);
        assert!(builder.validate().is_ok());
        assert_eq!(builder.vertex_input.bindings()[0].stride, 24);
        assert_eq!(builder.vertex_input.attributes()[1].offset, 12);
    }

    #[test]
    fn second_build_requires_reset() {
        let mut builder = complete();
        assert!(builder.check_buildable().is_ok());

        builder.built = true;
        assert!(matches!(
            builder.check_buildable(),
            Err(GpuError::InvalidState(_))
        ));

        builder.reset();
        assert!(builder.check_buildable().is_ok());
    }

    #[test]
    fn defaults_match_forward_rendering() {
        let builder = PipelineBuilder::new();
        assert!(builder.dynamic_viewport);
        assert_eq!(builder.view_mask, 0);
        assert_eq!(builder.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(DepthStencilConfig::default(), DepthStencilConfig::disabled());
    }
}
