use crate::device::AshDevice;
use crate::render_pass::{RenderPass, ResolvedSubpass};
use crate::{
    ConfigError, DescriptorLayoutHandle, PipelineKey, RenderPassKey, Result, ResultExt, ShaderKey,
    ShaderRef,
};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

#[derive(Debug, Clone)]
pub struct PipelineDesc {
    key: PipelineKey,
    pub name: String,
    pub render_pass: RenderPassKey,
    pub subpass: u32,
    pub shaders: Vec<ShaderRef>,

    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,

    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub depth_clamp: bool,
    pub depth_bias: Option<DepthBias>,

    /// Requires the `sampleRateShading` feature, dropped when the device lacks it.
    pub multisample_shading: bool,
    pub min_sample_shading: f32,
    pub alpha_to_coverage: bool,

    /// `None` tests and writes depth whenever the subpass has a depth-stencil attachment.
    pub depth_stencil: Option<DepthStencilState>,
    /// Empty gives every color attachment of the subpass an opaque write.
    pub color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub blend_constants: [f32; 4],
    pub dynamic_states: Vec<vk::DynamicState>,

    pub descriptor_layouts: Vec<DescriptorLayoutHandle>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
    /// Fixed viewport and scissor, needed when they aren't dynamic.
    pub extent: Option<vk::Extent2D>,
}

impl PipelineDesc {
    pub(crate) fn new(key: PipelineKey, name: String, render_pass: RenderPassKey, subpass: u32) -> Self {
        Self {
            key,
            name,
            render_pass,
            subpass,
            shaders: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            depth_clamp: false,
            depth_bias: None,
            multisample_shading: false,
            min_sample_shading: 1.0,
            alpha_to_coverage: false,
            depth_stencil: None,
            color_blend_attachments: Vec::new(),
            blend_constants: [0.0; 4],
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            descriptor_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
            extent: None,
        }
    }

    pub fn key(&self) -> PipelineKey {
        self.key
    }

    pub fn add_shader(&mut self, shader: ShaderKey, stage: vk::ShaderStageFlags) -> &mut Self {
        self.shaders.push(ShaderRef::new(shader, stage));
        self
    }
}

/// Fixed-function state that depends on the subpass the pipeline renders in.
#[derive(Debug, Clone)]
pub struct FixedFunction {
    pub samples: vk::SampleCountFlags,
    pub depth_stencil: DepthStencilState,
    pub has_depth_stencil: bool,
    pub blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub viewport: Option<(vk::Viewport, vk::Rect2D)>,
}

fn opaque_blend() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()
}

pub fn resolve_fixed_function(
    desc: &PipelineDesc,
    subpass: &ResolvedSubpass,
) -> Result<FixedFunction> {
    let has_depth_stencil = subpass.depth_stencil.is_some();
    let depth_stencil = match (desc.depth_stencil, has_depth_stencil) {
        (Some(state), true) => state,
        (None, true) => DepthStencilState::default(),
        (_, false) => DepthStencilState {
            depth_test: false,
            depth_write: false,
            compare_op: vk::CompareOp::ALWAYS,
        },
    };

    let blend_attachments = if desc.color_blend_attachments.is_empty() {
        vec![opaque_blend(); subpass.color.len()]
    } else {
        desc.color_blend_attachments.clone()
    };

    let dynamic_viewport = desc.dynamic_states.contains(&vk::DynamicState::VIEWPORT)
        && desc.dynamic_states.contains(&vk::DynamicState::SCISSOR);
    let viewport = match desc.extent {
        Some(extent) => Some((
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            },
        )),
        None if dynamic_viewport => None,
        None => return Err(ConfigError::PipelineExtentRequired.into()),
    };

    Ok(FixedFunction {
        samples: subpass.samples,
        depth_stencil,
        has_depth_stencil,
        blend_attachments,
        viewport,
    })
}

pub struct Pipeline {
    device: Arc<AshDevice>,
    declaration: PipelineDesc,
    layout: vk::PipelineLayout,
    handle: vk::Pipeline,
}

impl Pipeline {
    pub(crate) fn init(
        device: &Arc<AshDevice>,
        declaration: PipelineDesc,
        render_pass: &RenderPass,
        shader_module: impl Fn(ShaderKey) -> Option<vk::ShaderModule>,
        descriptor_layout: impl Fn(DescriptorLayoutHandle) -> Option<vk::DescriptorSetLayout>,
    ) -> Result<Self> {
        let subpass = render_pass.subpass(declaration.subpass)?;
        let fixed = resolve_fixed_function(&declaration, subpass)?;

        let set_layouts = declaration
            .descriptor_layouts
            .iter()
            .map(|&handle| descriptor_layout(handle).ok_or(ConfigError::UnknownHandle("descriptor layout")))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let entry_names = declaration
            .shaders
            .iter()
            .map(|shader| CString::new(shader.function_name.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|error| ConfigError::InvalidName(error.to_string()))?;
        let stages = declaration
            .shaders
            .iter()
            .zip(entry_names.iter())
            .map(|(shader, name)| -> Result<vk::PipelineShaderStageCreateInfo> {
                let module = shader_module(shader.shader).ok_or(ConfigError::UnknownHandle("shader"))?;
                Ok(vk::PipelineShaderStageCreateInfo::builder()
                    .stage(shader.stage)
                    .module(module)
                    .name(name)
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;

        let mut pipeline = Self {
            device: device.clone(),
            declaration,
            layout: vk::PipelineLayout::null(),
            handle: vk::Pipeline::null(),
        };
        let desc = &pipeline.declaration;

        pipeline.layout = unsafe {
            device.core.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder()
                    .set_layouts(&set_layouts)
                    .push_constant_ranges(&desc.push_constant_ranges),
                None,
            )
        }
        .with_context(|| format!("vkCreatePipelineLayout {}", desc.name))?;

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);
        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.topology)
            .primitive_restart_enable(desc.primitive_restart);

        // Dynamic viewports still need a count of one
        let (viewport, scissor) = fixed.viewport.unwrap_or_default();
        let viewports = [viewport];
        let scissors = [scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewports(&viewports)
            .scissors(&scissors);

        let depth_bias = desc.depth_bias;
        let rasterizer_state = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(desc.depth_clamp)
            .rasterizer_discard_enable(false)
            .polygon_mode(desc.polygon_mode)
            .line_width(desc.line_width)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .depth_bias_enable(depth_bias.is_some())
            .depth_bias_constant_factor(depth_bias.map_or(0.0, |bias| bias.constant_factor))
            .depth_bias_clamp(depth_bias.map_or(0.0, |bias| bias.clamp))
            .depth_bias_slope_factor(depth_bias.map_or(0.0, |bias| bias.slope_factor));

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(fixed.samples)
            .sample_shading_enable(desc.multisample_shading)
            .min_sample_shading(desc.min_sample_shading)
            .alpha_to_coverage_enable(desc.alpha_to_coverage)
            .alpha_to_one_enable(false);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(fixed.depth_stencil.depth_test)
            .depth_write_enable(fixed.depth_stencil.depth_write)
            .depth_compare_op(fixed.depth_stencil.compare_op)
            .depth_bounds_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(false);

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&fixed.blend_attachments)
            .blend_constants(desc.blend_constants);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&desc.dynamic_states);

        let mut create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(pipeline.layout)
            .render_pass(render_pass.handle())
            .subpass(desc.subpass);
        if fixed.has_depth_stencil {
            create_info = create_info.depth_stencil_state(&depth_stencil_state);
        }

        pipeline.handle = unsafe {
            device.core.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[create_info.build()],
                None,
            )
        }
        .map_err(|(_, error)| error)
        .with_context(|| format!("vkCreateGraphicsPipelines {}", desc.name))?
        .into_iter()
        .next()
        .unwrap_or_default();

        device.set_object_name(pipeline.handle, &desc.name);
        debug!(
            "Create Pipeline {}: {} stages, {:?}",
            desc.name,
            stages.len(),
            fixed.samples
        );
        Ok(pipeline)
    }

    pub fn key(&self) -> PipelineKey {
        self.declaration.key
    }

    pub fn declaration(&self) -> &PipelineDesc {
        &self.declaration
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.core.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.handle,
            )
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            if self.handle != vk::Pipeline::null() {
                self.device.core.destroy_pipeline(self.handle, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                self.device.core.destroy_pipeline_layout(self.layout, None);
            }
        }
        trace!("Destroy Pipeline {}", self.declaration.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn desc() -> PipelineDesc {
        let mut pipelines: SlotMap<PipelineKey, ()> = SlotMap::with_key();
        let mut render_passes: SlotMap<RenderPassKey, ()> = SlotMap::with_key();
        PipelineDesc::new(
            pipelines.insert(()),
            String::from("opaque"),
            render_passes.insert(()),
            0,
        )
    }

    fn subpass(colors: u32, depth: bool, samples: vk::SampleCountFlags) -> ResolvedSubpass {
        ResolvedSubpass {
            color: (0..colors)
                .map(|attachment| vk::AttachmentReference {
                    attachment,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                })
                .collect(),
            depth_stencil: depth.then_some(vk::AttachmentReference {
                attachment: colors,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }),
            samples,
            ..Default::default()
        }
    }

    #[test]
    fn subpass_drives_samples_blending_and_depth() {
        let fixed =
            resolve_fixed_function(&desc(), &subpass(3, true, vk::SampleCountFlags::TYPE_4)).unwrap();
        assert_eq!(fixed.samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(fixed.blend_attachments.len(), 3);
        assert_eq!(
            fixed.blend_attachments[0].color_write_mask,
            vk::ColorComponentFlags::RGBA
        );
        assert!(fixed.has_depth_stencil);
        assert_eq!(fixed.depth_stencil, DepthStencilState::default());
        assert!(fixed.viewport.is_none());

        let no_depth =
            resolve_fixed_function(&desc(), &subpass(1, false, vk::SampleCountFlags::TYPE_1)).unwrap();
        assert!(!no_depth.has_depth_stencil);
        assert!(!no_depth.depth_stencil.depth_test);
    }

    #[test]
    fn static_viewport_needs_an_extent() {
        let mut desc = desc();
        desc.dynamic_states.clear();
        let error = resolve_fixed_function(&desc, &subpass(1, false, vk::SampleCountFlags::TYPE_1))
            .unwrap_err();
        assert_eq!(error.config(), Some(&ConfigError::PipelineExtentRequired));

        desc.extent = Some(vk::Extent2D {
            width: 640,
            height: 480,
        });
        let fixed =
            resolve_fixed_function(&desc, &subpass(1, false, vk::SampleCountFlags::TYPE_1)).unwrap();
        let (viewport, scissor) = fixed.viewport.unwrap();
        assert_eq!(viewport.width, 640.0);
        assert_eq!(scissor.extent.height, 480);
    }

    #[test]
    fn explicit_blend_attachments_are_kept() {
        let mut desc = desc();
        desc.color_blend_attachments = vec![vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build()];
        desc.depth_stencil = Some(DepthStencilState {
            depth_write: false,
            ..Default::default()
        });

        let fixed =
            resolve_fixed_function(&desc, &subpass(1, true, vk::SampleCountFlags::TYPE_1)).unwrap();
        assert_eq!(fixed.blend_attachments[0].blend_enable, vk::TRUE);
        assert!(!fixed.depth_stencil.depth_write);
        assert!(fixed.depth_stencil.depth_test);
    }
}
