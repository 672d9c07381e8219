use crate::device::AshDevice;
use crate::{ConfigError, RenderPassKey, Result, ResultExt, SwapchainKey};
use ash::vk;
use std::sync::Arc;

bitflags::bitflags! {
    /// Image aspects a clear/load/keep policy applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttachmentAspects: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentRole {
    Color,
    DepthStencil,
    Resolve,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub(crate) fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// A declared image role. Expands into up to three native attachment descriptions.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    /// Color images come from this swapchain and are presented.
    pub swapchain: Option<SwapchainKey>,
    pub buffer_color: bool,
    pub buffer_depth_stencil: bool,
    pub format_color: vk::Format,
    pub format_depth_stencil: vk::Format,
    pub sample_count: vk::SampleCountFlags,
    pub resolve_color: bool,
    pub clear: AttachmentAspects,
    pub load: AttachmentAspects,
    pub keep: AttachmentAspects,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub initial_layout_color: vk::ImageLayout,
    pub initial_layout_depth_stencil: vk::ImageLayout,
}

impl Default for Attachment {
    fn default() -> Self {
        Self {
            name: String::new(),
            swapchain: None,
            buffer_color: true,
            buffer_depth_stencil: false,
            format_color: vk::Format::B8G8R8A8_UNORM,
            format_depth_stencil: vk::Format::D32_SFLOAT,
            sample_count: vk::SampleCountFlags::TYPE_1,
            resolve_color: false,
            clear: AttachmentAspects::all(),
            load: AttachmentAspects::empty(),
            keep: AttachmentAspects::empty(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
            initial_layout_color: vk::ImageLayout::UNDEFINED,
            initial_layout_depth_stencil: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl Attachment {
    pub fn swapchain(swapchain: SwapchainKey) -> Self {
        Self {
            swapchain: Some(swapchain),
            ..Default::default()
        }
    }

    pub fn color(format: vk::Format) -> Self {
        Self {
            format_color: format,
            ..Default::default()
        }
    }

    pub fn depth_stencil(format: vk::Format) -> Self {
        Self {
            buffer_color: false,
            buffer_depth_stencil: true,
            format_depth_stencil: format,
            ..Default::default()
        }
    }

    fn resolves(&self) -> bool {
        self.buffer_color && self.resolve_color
    }

    fn load_op(&self, aspect: AttachmentAspects) -> vk::AttachmentLoadOp {
        if self.load.contains(aspect) {
            vk::AttachmentLoadOp::LOAD
        } else if self.clear.contains(aspect) {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        }
    }

    fn store_op(&self, aspect: AttachmentAspects) -> vk::AttachmentStoreOp {
        if self.keep.contains(aspect) {
            vk::AttachmentStoreOp::STORE
        } else {
            vk::AttachmentStoreOp::DONT_CARE
        }
    }

    /// Expands into [multisample color] [resolve color] [depth-stencil], skipping absent roles.
    pub(crate) fn config(
        &self,
        index: usize,
        swapchain_format: Option<vk::Format>,
    ) -> Result<ExpandedAttachment> {
        if !self.buffer_color && !self.buffer_depth_stencil {
            return Err(ConfigError::EmptyAttachment { attachment: index }.into());
        }
        let multisampled = self.sample_count != vk::SampleCountFlags::TYPE_1;
        if self.resolves() && !multisampled {
            return Err(ConfigError::ResolveWithoutMultisample { attachment: index }.into());
        }
        let presented = self.buffer_color && self.swapchain.is_some();
        if presented && multisampled && !self.resolve_color {
            return Err(ConfigError::MultisampledPresent { attachment: index }.into());
        }

        let mut expanded = ExpandedAttachment::default();
        let color_format = swapchain_format.unwrap_or(self.format_color);

        if self.buffer_color {
            let presents_here = presented && !self.resolves();
            let initial_layout = if self.load.contains(AttachmentAspects::COLOR) {
                self.initial_layout_color
            } else {
                vk::ImageLayout::UNDEFINED
            };
            let final_layout = if presents_here {
                vk::ImageLayout::PRESENT_SRC_KHR
            } else if self.keep.contains(AttachmentAspects::COLOR) {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };
            let store_op = if presents_here {
                vk::AttachmentStoreOp::STORE
            } else {
                self.store_op(AttachmentAspects::COLOR)
            };

            expanded.local.color = Some(expanded.push(
                vk::AttachmentDescription {
                    format: color_format,
                    samples: self.sample_count,
                    load_op: self.load_op(AttachmentAspects::COLOR),
                    store_op,
                    stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                    stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                    initial_layout,
                    final_layout,
                    ..Default::default()
                },
                ClearValue::Color(self.clear_color),
                AttachmentImageKind::Color,
                presents_here.then_some(self.swapchain).flatten(),
            ));
        }

        if self.resolves() {
            let final_layout = if presented {
                vk::ImageLayout::PRESENT_SRC_KHR
            } else if self.keep.contains(AttachmentAspects::COLOR) {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };

            expanded.local.resolve = Some(expanded.push(
                vk::AttachmentDescription {
                    format: color_format,
                    samples: vk::SampleCountFlags::TYPE_1,
                    load_op: vk::AttachmentLoadOp::DONT_CARE,
                    store_op: vk::AttachmentStoreOp::STORE,
                    stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                    stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout,
                    ..Default::default()
                },
                ClearValue::Color(self.clear_color),
                AttachmentImageKind::Resolve,
                if presented { self.swapchain } else { None },
            ));
        }

        if self.buffer_depth_stencil {
            let keeps = self
                .keep
                .intersects(AttachmentAspects::DEPTH | AttachmentAspects::STENCIL);
            let initial_layout = if self
                .load
                .intersects(AttachmentAspects::DEPTH | AttachmentAspects::STENCIL)
            {
                self.initial_layout_depth_stencil
            } else {
                vk::ImageLayout::UNDEFINED
            };

            expanded.local.depth_stencil = Some(expanded.push(
                vk::AttachmentDescription {
                    format: self.format_depth_stencil,
                    samples: self.sample_count,
                    load_op: self.load_op(AttachmentAspects::DEPTH),
                    store_op: self.store_op(AttachmentAspects::DEPTH),
                    stencil_load_op: self.load_op(AttachmentAspects::STENCIL),
                    stencil_store_op: self.store_op(AttachmentAspects::STENCIL),
                    initial_layout,
                    final_layout: if keeps {
                        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                    } else {
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                    },
                    ..Default::default()
                },
                ClearValue::DepthStencil {
                    depth: self.clear_depth,
                    stencil: self.clear_stencil,
                },
                AttachmentImageKind::DepthStencil,
                None,
            ));
        }

        Ok(expanded)
    }
}

/// Sub-indices of an attachment's descriptions, local to the attachment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentIndices {
    pub color: Option<u32>,
    pub resolve: Option<u32>,
    pub depth_stencil: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentImageKind {
    Color,
    Resolve,
    DepthStencil,
}

/// What backs one native attachment description.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentImage {
    pub attachment: usize,
    pub kind: AttachmentImageKind,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    /// Set when the description is a presented swapchain image.
    pub swapchain: Option<SwapchainKey>,
}

#[derive(Debug, Default)]
pub(crate) struct ExpandedAttachment {
    pub(crate) descriptions: Vec<vk::AttachmentDescription>,
    pub(crate) clear_values: Vec<ClearValue>,
    pub(crate) kinds: Vec<(AttachmentImageKind, Option<SwapchainKey>)>,
    pub(crate) local: AttachmentIndices,
}

impl ExpandedAttachment {
    fn push(
        &mut self,
        description: vk::AttachmentDescription,
        clear_value: ClearValue,
        kind: AttachmentImageKind,
        swapchain: Option<SwapchainKey>,
    ) -> u32 {
        self.descriptions.push(description);
        self.clear_values.push(clear_value);
        self.kinds.push((kind, swapchain));
        self.descriptions.len() as u32 - 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttachmentUsage {
    pub attachment: usize,
    pub role: AttachmentRole,
    pub access: vk::AccessFlags,
}

#[derive(Debug, Clone, Default)]
pub struct Subpass {
    pub name: String,
    pub usages: Vec<AttachmentUsage>,
}

impl Subpass {
    pub fn use_attachment(
        &mut self,
        attachment: usize,
        role: AttachmentRole,
        access: vk::AccessFlags,
    ) -> &mut Self {
        self.usages.push(AttachmentUsage {
            attachment,
            role,
            access,
        });
        self
    }
}

/// Access and stage on the external side of an entry or exit dependency.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub access: vk::AccessFlags,
    pub stage: vk::PipelineStageFlags,
}

impl Default for Transition {
    fn default() -> Self {
        Self {
            access: vk::AccessFlags::MEMORY_READ,
            stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderPassDesc {
    key: RenderPassKey,
    pub name: String,
    attachments: Vec<Attachment>,
    subpasses: Vec<Subpass>,
    dependencies: Vec<vk::SubpassDependency>,
    /// `None` disables the synthesized entry dependency.
    pub initial_transition: Option<Transition>,
    /// `None` disables the synthesized exit dependency.
    pub final_transition: Option<Transition>,
}

impl RenderPassDesc {
    pub(crate) fn new(key: RenderPassKey, name: String) -> Self {
        Self {
            key,
            name,
            attachments: Vec::new(),
            subpasses: Vec::new(),
            dependencies: Vec::new(),
            initial_transition: Some(Transition::default()),
            final_transition: Some(Transition::default()),
        }
    }

    pub fn key(&self) -> RenderPassKey {
        self.key
    }

    pub fn add_attachment(&mut self, attachment: Attachment) -> usize {
        self.attachments.push(attachment);
        self.attachments.len() - 1
    }

    pub fn add_subpass(&mut self) -> usize {
        self.subpasses.push(Subpass::default());
        self.subpasses.len() - 1
    }

    /// Dependencies between subpasses are never inferred and must be added here.
    pub fn add_dependency(&mut self, dependency: vk::SubpassDependency) {
        self.dependencies.push(dependency);
    }

    pub fn attachment_mut(&mut self, index: usize) -> Option<&mut Attachment> {
        self.attachments.get_mut(index)
    }

    pub fn subpass_mut(&mut self, index: usize) -> Option<&mut Subpass> {
        self.subpasses.get_mut(index)
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn subpasses(&self) -> &[Subpass] {
        &self.subpasses
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedSubpass {
    pub color: Vec<vk::AttachmentReference>,
    /// Empty, or parallel to `color`.
    pub resolve: Vec<vk::AttachmentReference>,
    pub depth_stencil: Option<vk::AttachmentReference>,
    pub input: Vec<vk::AttachmentReference>,
    pub preserve: Vec<u32>,
    pub samples: vk::SampleCountFlags,
}

impl ResolvedSubpass {
    fn references(&self) -> impl Iterator<Item = u32> + '_ {
        self.color
            .iter()
            .chain(self.resolve.iter())
            .chain(self.depth_stencil.iter())
            .chain(self.input.iter())
            .map(|reference| reference.attachment)
            .filter(|&attachment| attachment != vk::ATTACHMENT_UNUSED)
    }

    fn touches(&self) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        let mut stage = vk::PipelineStageFlags::empty();
        let mut access = vk::AccessFlags::empty();
        if !self.color.is_empty() {
            stage |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
            access |= vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        }
        if self.depth_stencil.is_some() {
            stage |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        if !self.input.is_empty() {
            stage |= vk::PipelineStageFlags::FRAGMENT_SHADER;
            access |= vk::AccessFlags::INPUT_ATTACHMENT_READ;
        }
        if stage.is_empty() {
            stage = vk::PipelineStageFlags::ALL_GRAPHICS;
        }
        (stage, access)
    }
}

/// Native render pass layout computed from declared attachments and subpasses.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRenderPass {
    pub descriptions: Vec<vk::AttachmentDescription>,
    pub images: Vec<AttachmentImage>,
    pub clear_values: Vec<ClearValue>,
    /// First global description of each attachment.
    pub first_index: Vec<u32>,
    pub local: Vec<AttachmentIndices>,
    pub subpasses: Vec<ResolvedSubpass>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

const COLOR_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::COLOR_ATTACHMENT_READ.as_raw() | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw(),
);
const DEPTH_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
);

fn reference(attachment: u32, layout: vk::ImageLayout) -> vk::AttachmentReference {
    vk::AttachmentReference { attachment, layout }
}

fn resolve_subpass(
    subpass_index: usize,
    subpass: &Subpass,
    first_index: &[u32],
    local: &[AttachmentIndices],
    descriptions: &[vk::AttachmentDescription],
) -> Result<ResolvedSubpass> {
    let mut resolved = ResolvedSubpass {
        samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let mut resolve_slots: Vec<u32> = Vec::new();

    for usage in subpass.usages.iter() {
        let attachment = usage.attachment;
        if attachment >= local.len() {
            return Err(ConfigError::AttachmentOutOfRange {
                subpass: subpass_index,
                attachment,
                count: local.len(),
            }
            .into());
        }
        if !usage
            .access
            .intersects(COLOR_ACCESS | DEPTH_ACCESS | vk::AccessFlags::INPUT_ATTACHMENT_READ)
        {
            return Err(ConfigError::NoAttachmentAccess {
                subpass: subpass_index,
                attachment,
            }
            .into());
        }

        let indices = local[attachment];
        let base = first_index[attachment];
        let provided = match usage.role {
            AttachmentRole::Color => indices.color.is_some(),
            AttachmentRole::Resolve => indices.resolve.is_some(),
            AttachmentRole::DepthStencil => indices.depth_stencil.is_some(),
            AttachmentRole::All => true,
        };
        if !provided {
            return Err(ConfigError::RoleUnavailable {
                subpass: subpass_index,
                attachment,
                role: usage.role,
            }
            .into());
        }
        let no_target = |access: vk::AccessFlags| ConfigError::AccessWithoutTarget {
            subpass: subpass_index,
            attachment,
            access: usage.access & access,
        };

        if usage.access.intersects(COLOR_ACCESS) {
            let (color, resolve) = match usage.role {
                AttachmentRole::Color => (indices.color, None),
                AttachmentRole::Resolve => (indices.resolve, None),
                AttachmentRole::All => (indices.color, indices.resolve),
                AttachmentRole::DepthStencil => (None, None),
            };
            let color = color.ok_or_else(|| no_target(COLOR_ACCESS))?;
            resolved.color.push(reference(
                base + color,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ));
            resolve_slots.push(resolve.map_or(vk::ATTACHMENT_UNUSED, |resolve| base + resolve));
        }

        if usage.access.intersects(DEPTH_ACCESS) {
            let depth_stencil = match usage.role {
                AttachmentRole::DepthStencil | AttachmentRole::All => indices.depth_stencil,
                _ => None,
            }
            .ok_or_else(|| no_target(DEPTH_ACCESS))?;
            // One depth-stencil reference per subpass, whether it writes or only reads
            if resolved.depth_stencil.is_some() {
                return Err(ConfigError::DuplicateDepthStencil {
                    subpass: subpass_index,
                    attachment,
                }
                .into());
            }
            let layout = if usage
                .access
                .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            };
            resolved.depth_stencil = Some(reference(base + depth_stencil, layout));
        }

        if usage.access.contains(vk::AccessFlags::INPUT_ATTACHMENT_READ) {
            let input = match usage.role {
                AttachmentRole::Color => indices.color,
                AttachmentRole::Resolve => indices.resolve,
                AttachmentRole::DepthStencil => indices.depth_stencil,
                AttachmentRole::All => {
                    let mut present = [indices.color, indices.resolve, indices.depth_stencil]
                        .into_iter()
                        .flatten();
                    match (present.next(), present.next()) {
                        (Some(only), None) => Some(only),
                        _ => {
                            return Err(ConfigError::AmbiguousInputAttachment {
                                subpass: subpass_index,
                                attachment,
                            }
                            .into())
                        }
                    }
                }
            }
            .ok_or_else(|| no_target(vk::AccessFlags::INPUT_ATTACHMENT_READ))?;
            let layout = if Some(input) == indices.depth_stencil {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            };
            resolved.input.push(reference(base + input, layout));
        }
    }

    if resolve_slots
        .iter()
        .any(|&slot| slot != vk::ATTACHMENT_UNUSED)
    {
        resolved.resolve = resolve_slots
            .into_iter()
            .map(|slot| reference(slot, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
            .collect();
    }

    // An image read as an input while also written in the same subpass needs the general layout
    let written: Vec<u32> = resolved
        .color
        .iter()
        .chain(resolved.depth_stencil.iter())
        .map(|reference| reference.attachment)
        .collect();
    let feedback: Vec<u32> = resolved
        .input
        .iter()
        .map(|reference| reference.attachment)
        .filter(|attachment| written.contains(attachment))
        .collect();
    for reference in resolved
        .color
        .iter_mut()
        .chain(resolved.depth_stencil.iter_mut())
        .chain(resolved.input.iter_mut())
    {
        if feedback.contains(&reference.attachment) {
            reference.layout = vk::ImageLayout::GENERAL;
        }
    }

    if let Some(samples) = resolved
        .color
        .iter()
        .chain(resolved.depth_stencil.iter())
        .map(|reference| descriptions[reference.attachment as usize].samples)
        .max_by_key(|samples| samples.as_raw())
    {
        resolved.samples = samples;
    }

    Ok(resolved)
}

fn infer_preserves(subpasses: &mut [ResolvedSubpass]) {
    let used: Vec<Vec<u32>> = subpasses
        .iter()
        .map(|subpass| subpass.references().collect())
        .collect();

    for (index, subpass) in subpasses.iter_mut().enumerate() {
        let mut preserve: Vec<u32> = used[..index]
            .iter()
            .flatten()
            .copied()
            .filter(|attachment| !used[index].contains(attachment))
            .filter(|attachment| used[index + 1..].iter().any(|later| later.contains(attachment)))
            .collect();
        preserve.sort_unstable();
        preserve.dedup();
        subpass.preserve = preserve;
    }
}

fn validate_dependency(dependency: &vk::SubpassDependency, count: usize) -> Result<()> {
    for subpass in [dependency.src_subpass, dependency.dst_subpass] {
        if subpass != vk::SUBPASS_EXTERNAL && subpass as usize >= count {
            return Err(ConfigError::SubpassOutOfRange { subpass, count }.into());
        }
    }
    Ok(())
}

/// Flattens attachments, resolves every subpass and synthesizes entry/exit dependencies.
pub fn resolve_render_pass(
    desc: &RenderPassDesc,
    swapchain_format: impl Fn(SwapchainKey) -> Option<vk::Format>,
) -> Result<ResolvedRenderPass> {
    if desc.subpasses.is_empty() {
        return Err(ConfigError::NoSubpasses.into());
    }

    let mut resolved = ResolvedRenderPass::default();
    for (index, attachment) in desc.attachments.iter().enumerate() {
        let format = match attachment.swapchain {
            Some(swapchain) => Some(
                swapchain_format(swapchain).ok_or(ConfigError::UnknownHandle("swapchain"))?,
            ),
            None => None,
        };
        let expanded = attachment
            .config(index, format)
            .with_context(|| format!("Attachment {} {}", index, attachment.name))?;

        resolved.first_index.push(resolved.descriptions.len() as u32);
        resolved.local.push(expanded.local);
        for (description, (kind, swapchain)) in
            expanded.descriptions.iter().zip(expanded.kinds.iter())
        {
            resolved.images.push(AttachmentImage {
                attachment: index,
                kind: *kind,
                format: description.format,
                samples: description.samples,
                swapchain: *swapchain,
            });
        }
        resolved.descriptions.extend(expanded.descriptions);
        resolved.clear_values.extend(expanded.clear_values);
    }

    for (index, subpass) in desc.subpasses.iter().enumerate() {
        resolved.subpasses.push(resolve_subpass(
            index,
            subpass,
            &resolved.first_index,
            &resolved.local,
            &resolved.descriptions,
        )?);
    }
    infer_preserves(&mut resolved.subpasses);

    if let Some(initial) = desc.initial_transition {
        let (stage, access) = resolved.subpasses[0].touches();
        resolved.dependencies.push(vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: initial.stage,
            dst_stage_mask: stage,
            src_access_mask: initial.access,
            dst_access_mask: access,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });
    }

    for dependency in desc.dependencies.iter() {
        validate_dependency(dependency, desc.subpasses.len())?;
        resolved.dependencies.push(*dependency);
    }

    if let Some(last) = desc.final_transition {
        let last_index = resolved.subpasses.len() - 1;
        let (stage, access) = resolved.subpasses[last_index].touches();
        resolved.dependencies.push(vk::SubpassDependency {
            src_subpass: last_index as u32,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: stage,
            dst_stage_mask: last.stage,
            src_access_mask: access,
            dst_access_mask: last.access,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });
    }

    Ok(resolved)
}

pub struct RenderPass {
    device: Arc<AshDevice>,
    handle: vk::RenderPass,
    name: String,
    resolved: ResolvedRenderPass,
}

impl RenderPass {
    pub(crate) fn init(
        device: &Arc<AshDevice>,
        desc: RenderPassDesc,
        swapchain_format: impl Fn(SwapchainKey) -> Option<vk::Format>,
    ) -> Result<Self> {
        // Fails before any native call when the declaration is inconsistent
        let resolved = resolve_render_pass(&desc, swapchain_format)?;

        let subpasses: Vec<vk::SubpassDescription> = resolved
            .subpasses
            .iter()
            .map(|subpass| {
                let mut builder = vk::SubpassDescription::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&subpass.color)
                    .input_attachments(&subpass.input)
                    .preserve_attachments(&subpass.preserve);
                if !subpass.resolve.is_empty() {
                    builder = builder.resolve_attachments(&subpass.resolve);
                }
                if let Some(depth_stencil) = subpass.depth_stencil.as_ref() {
                    builder = builder.depth_stencil_attachment(depth_stencil);
                }
                builder.build()
            })
            .collect();

        let handle = unsafe {
            device.core.create_render_pass(
                &vk::RenderPassCreateInfo::builder()
                    .attachments(&resolved.descriptions)
                    .subpasses(&subpasses)
                    .dependencies(&resolved.dependencies),
                None,
            )
        }
        .with_context(|| format!("vkCreateRenderPass {}", desc.name))?;
        device.set_object_name(handle, &desc.name);
        debug!(
            "Create RenderPass {}: {} attachments, {} subpasses",
            desc.name,
            resolved.descriptions.len(),
            resolved.subpasses.len()
        );

        Ok(Self {
            device: device.clone(),
            handle,
            name: desc.name,
            resolved,
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn resolved(&self) -> &ResolvedRenderPass {
        &self.resolved
    }

    pub fn subpass(&self, index: u32) -> Result<&ResolvedSubpass> {
        self.resolved.subpasses.get(index as usize).ok_or_else(|| {
            ConfigError::SubpassOutOfRange {
                subpass: index,
                count: self.resolved.subpasses.len(),
            }
            .into()
        })
    }

    /// Records the begin of this render pass with every attachment's clear value.
    pub fn begin(
        &self,
        command_buffer: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        contents: vk::SubpassContents,
    ) {
        let clear_values: Vec<vk::ClearValue> = self
            .resolved
            .clear_values
            .iter()
            .map(|clear_value| clear_value.to_vk())
            .collect();
        unsafe {
            self.device.core.cmd_begin_render_pass(
                command_buffer,
                &vk::RenderPassBeginInfo::builder()
                    .render_pass(self.handle)
                    .framebuffer(framebuffer)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent,
                    })
                    .clear_values(&clear_values),
                contents,
            );
        }
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.core.destroy_render_pass(self.handle, None) };
        trace!("Destroy RenderPass {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn keys() -> (RenderPassKey, SwapchainKey) {
        let mut render_passes: SlotMap<RenderPassKey, ()> = SlotMap::with_key();
        let mut swapchains: SlotMap<SwapchainKey, ()> = SlotMap::with_key();
        (render_passes.insert(()), swapchains.insert(()))
    }

    fn no_swapchains(_: SwapchainKey) -> Option<vk::Format> {
        None
    }

    fn multisampled(samples: vk::SampleCountFlags) -> Attachment {
        Attachment {
            sample_count: samples,
            resolve_color: true,
            ..Attachment::color(vk::Format::R16G16B16A16_SFLOAT)
        }
    }

    #[test]
    fn expansion_matches_role_table() {
        let color_depth = Attachment {
            buffer_depth_stencil: true,
            ..Default::default()
        };
        let all_three = Attachment {
            buffer_depth_stencil: true,
            ..multisampled(vk::SampleCountFlags::TYPE_4)
        };
        let cases = [
            (Attachment::default(), 1, AttachmentIndices { color: Some(0), resolve: None, depth_stencil: None }),
            (multisampled(vk::SampleCountFlags::TYPE_4), 2, AttachmentIndices { color: Some(0), resolve: Some(1), depth_stencil: None }),
            (color_depth, 2, AttachmentIndices { color: Some(0), resolve: None, depth_stencil: Some(1) }),
            (all_three, 3, AttachmentIndices { color: Some(0), resolve: Some(1), depth_stencil: Some(2) }),
            (Attachment::depth_stencil(vk::Format::D24_UNORM_S8_UINT), 1, AttachmentIndices { color: None, resolve: None, depth_stencil: Some(0) }),
        ];

        for (attachment, count, local) in cases.iter() {
            let expanded = attachment.config(0, None).unwrap();
            assert_eq!(expanded.descriptions.len(), *count);
            assert_eq!(expanded.clear_values.len(), *count);
            assert_eq!(expanded.local, *local);
        }

        let (key, _) = keys();
        let mut render_pass = RenderPassDesc::new(key, String::from("table"));
        for (attachment, _, _) in cases.iter() {
            render_pass.add_attachment(attachment.clone());
        }
        render_pass.add_subpass();
        let resolved = resolve_render_pass(&render_pass, no_swapchains).unwrap();
        let total: usize = cases.iter().map(|(_, count, _)| count).sum();
        assert_eq!(resolved.descriptions.len(), total);
        assert_eq!(resolved.first_index, vec![0, 1, 3, 5, 8]);
        assert_eq!(resolved.images.len(), total);
    }

    #[test]
    fn resolved_color_is_single_sampled() {
        let expanded = multisampled(vk::SampleCountFlags::TYPE_8).config(0, None).unwrap();
        assert_eq!(expanded.descriptions[0].samples, vk::SampleCountFlags::TYPE_8);
        assert_eq!(expanded.descriptions[1].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(expanded.descriptions[1].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(expanded.kinds[1].0, AttachmentImageKind::Resolve);
    }

    #[test]
    fn invalid_attachments_are_rejected() {
        let empty = Attachment {
            buffer_color: false,
            ..Default::default()
        };
        assert_eq!(
            empty.config(3, None).unwrap_err().config(),
            Some(&ConfigError::EmptyAttachment { attachment: 3 })
        );

        let resolve_single = Attachment {
            resolve_color: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_single.config(1, None).unwrap_err().config(),
            Some(&ConfigError::ResolveWithoutMultisample { attachment: 1 })
        );

        let (_, swapchain) = keys();
        let presented_multisample = Attachment {
            sample_count: vk::SampleCountFlags::TYPE_4,
            ..Attachment::swapchain(swapchain)
        };
        assert_eq!(
            presented_multisample
                .config(0, Some(vk::Format::B8G8R8A8_SRGB))
                .unwrap_err()
                .config(),
            Some(&ConfigError::MultisampledPresent { attachment: 0 })
        );
    }

    #[test]
    fn swapchain_color_attachment_end_to_end() {
        let (key, swapchain) = keys();
        let mut desc = RenderPassDesc::new(key, String::from("present"));
        let color = desc.add_attachment(Attachment::swapchain(swapchain));
        let subpass = desc.add_subpass();
        desc.subpass_mut(subpass).unwrap().use_attachment(
            color,
            AttachmentRole::All,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );

        let resolved = resolve_render_pass(&desc, |key| {
            (key == swapchain).then_some(vk::Format::B8G8R8A8_SRGB)
        })
        .unwrap();

        assert_eq!(resolved.descriptions.len(), 1);
        assert_eq!(
            resolved.descriptions[0].final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(resolved.descriptions[0].format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(resolved.descriptions[0].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(resolved.images[0].swapchain, Some(swapchain));

        let subpass = &resolved.subpasses[0];
        assert_eq!(subpass.color.len(), 1);
        assert_eq!(subpass.color[0].attachment, 0);
        assert_eq!(subpass.color[0].layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert!(subpass.resolve.is_empty());
        assert!(subpass.depth_stencil.is_none());

        let entries: Vec<&vk::SubpassDependency> = resolved
            .dependencies
            .iter()
            .filter(|dependency| dependency.src_subpass == vk::SUBPASS_EXTERNAL)
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dst_subpass, 0);
        assert!(entries[0].dst_access_mask.contains(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        ));
        assert_eq!(entries[0].src_access_mask, vk::AccessFlags::MEMORY_READ);
        assert_eq!(
            entries[0].src_stage_mask,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
    }

    #[test]
    fn second_depth_stencil_usage_is_a_config_error() {
        let (key, _) = keys();
        let mut desc = RenderPassDesc::new(key, String::from("depth"));
        let first = desc.add_attachment(Attachment::depth_stencil(vk::Format::D32_SFLOAT));
        let second = desc.add_attachment(Attachment::depth_stencil(vk::Format::D32_SFLOAT));
        let subpass = desc.add_subpass();

        for second_access in [
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        ] {
            let mut desc = desc.clone();
            desc.subpass_mut(subpass)
                .unwrap()
                .use_attachment(
                    first,
                    AttachmentRole::DepthStencil,
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
                .use_attachment(second, AttachmentRole::DepthStencil, second_access);

            let error = resolve_render_pass(&desc, no_swapchains).unwrap_err();
            assert_eq!(
                error.config(),
                Some(&ConfigError::DuplicateDepthStencil {
                    subpass: 0,
                    attachment: 1
                })
            );
        }

        let mut read_only = desc.clone();
        read_only.subpass_mut(subpass).unwrap().use_attachment(
            second,
            AttachmentRole::DepthStencil,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        );
        let resolved = resolve_render_pass(&read_only, no_swapchains).unwrap();
        assert_eq!(
            resolved.subpasses[0].depth_stencil.map(|reference| reference.layout),
            Some(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
        );
    }

    #[test]
    fn usage_errors() {
        let (key, _) = keys();
        let mut desc = RenderPassDesc::new(key, String::from("errors"));
        let color = desc.add_attachment(Attachment::default());
        let subpass = desc.add_subpass();

        let check = |desc: &RenderPassDesc, expected: ConfigError| {
            let error = resolve_render_pass(desc, no_swapchains).unwrap_err();
            assert_eq!(error.config(), Some(&expected));
        };

        let mut out_of_range = desc.clone();
        out_of_range.subpass_mut(subpass).unwrap().use_attachment(
            4,
            AttachmentRole::Color,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        check(
            &out_of_range,
            ConfigError::AttachmentOutOfRange {
                subpass: 0,
                attachment: 4,
                count: 1,
            },
        );

        let mut no_resolve = desc.clone();
        no_resolve.subpass_mut(subpass).unwrap().use_attachment(
            color,
            AttachmentRole::Resolve,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        check(
            &no_resolve,
            ConfigError::RoleUnavailable {
                subpass: 0,
                attachment: color,
                role: AttachmentRole::Resolve,
            },
        );

        let mut no_depth = desc.clone();
        no_depth.subpass_mut(subpass).unwrap().use_attachment(
            color,
            AttachmentRole::All,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );
        check(
            &no_depth,
            ConfigError::AccessWithoutTarget {
                subpass: 0,
                attachment: color,
                access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            },
        );

        let mut no_access = desc.clone();
        no_access.subpass_mut(subpass).unwrap().use_attachment(
            color,
            AttachmentRole::All,
            vk::AccessFlags::SHADER_READ,
        );
        check(
            &no_access,
            ConfigError::NoAttachmentAccess {
                subpass: 0,
                attachment: color,
            },
        );

        let mut no_subpasses = RenderPassDesc::new(key, String::from("empty"));
        no_subpasses.add_attachment(Attachment::default());
        check(&no_subpasses, ConfigError::NoSubpasses);
    }

    #[test]
    fn resolve_references_stay_parallel_to_color() {
        let (key, _) = keys();
        let mut desc = RenderPassDesc::new(key, String::from("msaa"));
        let plain = desc.add_attachment(Attachment::color(vk::Format::R8G8B8A8_UNORM));
        let msaa = desc.add_attachment(Attachment {
            buffer_depth_stencil: true,
            ..multisampled(vk::SampleCountFlags::TYPE_4)
        });
        let subpass = desc.add_subpass();
        desc.subpass_mut(subpass)
            .unwrap()
            .use_attachment(plain, AttachmentRole::Color, vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .use_attachment(
                msaa,
                AttachmentRole::All,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let resolved = resolve_render_pass(&desc, no_swapchains).unwrap();
        let subpass = &resolved.subpasses[0];
        assert_eq!(
            subpass.color.iter().map(|r| r.attachment).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(
            subpass.resolve.iter().map(|r| r.attachment).collect::<Vec<_>>(),
            vec![vk::ATTACHMENT_UNUSED, 2]
        );
        assert_eq!(subpass.depth_stencil.map(|r| r.attachment), Some(3));
        assert_eq!(subpass.samples, vk::SampleCountFlags::TYPE_4);

        let entry = resolved.dependencies[0];
        assert!(entry.dst_access_mask.contains(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        ));
        assert!(entry
            .dst_stage_mask
            .contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
    }

    #[test]
    fn depth_only_exit_dependency() {
        let (key, _) = keys();
        let mut desc = RenderPassDesc::new(key, String::from("shadow"));
        let depth = desc.add_attachment(Attachment {
            keep: AttachmentAspects::DEPTH,
            ..Attachment::depth_stencil(vk::Format::D32_SFLOAT)
        });
        let subpass = desc.add_subpass();
        desc.subpass_mut(subpass).unwrap().use_attachment(
            depth,
            AttachmentRole::All,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );
        desc.final_transition = Some(Transition {
            access: vk::AccessFlags::SHADER_READ,
            stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        });

        let resolved = resolve_render_pass(&desc, no_swapchains).unwrap();
        let exit = resolved.dependencies[1];
        assert_eq!(exit.src_subpass, 0);
        assert_eq!(exit.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(
            exit.src_access_mask,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
        assert!(!exit
            .src_stage_mask
            .contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        assert_eq!(exit.dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(
            resolved.descriptions[0].final_layout,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn transitions_can_be_disabled_and_manual_dependencies_checked() {
        let (key, _) = keys();
        let mut desc = RenderPassDesc::new(key, String::from("manual"));
        let color = desc.add_attachment(Attachment::default());
        for _ in 0..2 {
            let subpass = desc.add_subpass();
            desc.subpass_mut(subpass).unwrap().use_attachment(
                color,
                AttachmentRole::Color,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            );
        }
        desc.initial_transition = None;
        desc.final_transition = None;
        desc.add_dependency(vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: 1,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });

        let resolved = resolve_render_pass(&desc, no_swapchains).unwrap();
        assert_eq!(resolved.dependencies.len(), 1);
        assert_eq!(resolved.dependencies[0].dst_subpass, 1);

        desc.add_dependency(vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: 2,
            ..Default::default()
        });
        let error = resolve_render_pass(&desc, no_swapchains).unwrap_err();
        assert_eq!(
            error.config(),
            Some(&ConfigError::SubpassOutOfRange {
                subpass: 2,
                count: 2
            })
        );
    }

    #[test]
    fn inputs_and_preserves() {
        let (key, _) = keys();
        let mut desc = RenderPassDesc::new(key, String::from("deferred"));
        let gbuffer = desc.add_attachment(Attachment {
            buffer_depth_stencil: true,
            ..Attachment::color(vk::Format::R16G16B16A16_SFLOAT)
        });
        let lighting = desc.add_attachment(Attachment::color(vk::Format::R16G16B16A16_SFLOAT));
        let output = desc.add_attachment(Attachment::color(vk::Format::R8G8B8A8_UNORM));

        let geometry = desc.add_subpass();
        desc.subpass_mut(geometry).unwrap().use_attachment(
            gbuffer,
            AttachmentRole::All,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );
        let light = desc.add_subpass();
        desc.subpass_mut(light).unwrap().use_attachment(
            lighting,
            AttachmentRole::Color,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );
        let compose = desc.add_subpass();
        desc.subpass_mut(compose)
            .unwrap()
            .use_attachment(gbuffer, AttachmentRole::Color, vk::AccessFlags::INPUT_ATTACHMENT_READ)
            .use_attachment(lighting, AttachmentRole::All, vk::AccessFlags::INPUT_ATTACHMENT_READ)
            .use_attachment(output, AttachmentRole::Color, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

        let resolved = resolve_render_pass(&desc, no_swapchains).unwrap();
        let compose = &resolved.subpasses[2];
        assert_eq!(
            compose.input.iter().map(|r| (r.attachment, r.layout)).collect::<Vec<_>>(),
            vec![
                (0, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
                (2, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            ]
        );
        // The gbuffer color is written in subpass 0 and read in 2, so subpass 1 keeps it
        assert_eq!(resolved.subpasses[1].preserve, vec![0]);
        assert!(resolved.subpasses[0].preserve.is_empty());

        let mut ambiguous = desc.clone();
        ambiguous.subpass_mut(compose_index(&desc)).unwrap().use_attachment(
            gbuffer,
            AttachmentRole::All,
            vk::AccessFlags::INPUT_ATTACHMENT_READ,
        );
        let error = resolve_render_pass(&ambiguous, no_swapchains).unwrap_err();
        assert_eq!(
            error.config(),
            Some(&ConfigError::AmbiguousInputAttachment {
                subpass: 2,
                attachment: gbuffer
            })
        );
    }

    fn compose_index(desc: &RenderPassDesc) -> usize {
        desc.subpasses().len() - 1
    }

    #[test]
    fn input_of_written_attachment_uses_general_layout() {
        let (key, _) = keys();
        let mut desc = RenderPassDesc::new(key, String::from("feedback"));
        let color = desc.add_attachment(Attachment::default());
        let subpass = desc.add_subpass();
        desc.subpass_mut(subpass).unwrap().use_attachment(
            color,
            AttachmentRole::Color,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::INPUT_ATTACHMENT_READ,
        );

        let resolved = resolve_render_pass(&desc, no_swapchains).unwrap();
        assert_eq!(resolved.subpasses[0].color[0].layout, vk::ImageLayout::GENERAL);
        assert_eq!(resolved.subpasses[0].input[0].layout, vk::ImageLayout::GENERAL);
    }
}
