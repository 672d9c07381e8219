use crate::device::AshDevice;
use crate::render_pass::{AttachmentImage, AttachmentImageKind, ResolvedRenderPass};
use crate::{
    ConfigError, FramebufferKey, ImageDesc, ImageHandle, MemoryDesc, MemoryKey, RenderPassKey,
    Result, ResultExt, SwapchainKey,
};
use ash::vk;
use slotmap::SecondaryMap;
use std::sync::Arc;

/// Where one framebuffer attachment image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferImage {
    /// The swapchain image with the same index as the image set.
    Swapchain,
    Arena(ImageHandle),
}

/// Arenas that provisioned attachment images are declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramebufferMemory {
    /// A color and a depth arena created for this framebuffer alone.
    #[default]
    Owned,
    /// Arenas declared on the device builder, shared with other resources.
    External { color: MemoryKey, depth: MemoryKey },
}

#[derive(Debug, Clone)]
pub struct FramebufferDesc {
    key: FramebufferKey,
    pub name: String,
    pub render_pass: RenderPassKey,
    /// Gives one image set per swapchain image and the swapchain's extent.
    pub swapchain: Option<SwapchainKey>,
    /// Used when there is no swapchain.
    pub extent: vk::Extent2D,
    pub layers: u32,
    pub memory: FramebufferMemory,
    own_images: bool,
    image_sets: Vec<Vec<FramebufferImage>>,
    color_memory: Option<MemoryKey>,
    depth_memory: Option<MemoryKey>,
}

impl FramebufferDesc {
    pub(crate) fn new(key: FramebufferKey, name: String, render_pass: RenderPassKey) -> Self {
        Self {
            key,
            name,
            render_pass,
            swapchain: None,
            extent: vk::Extent2D::default(),
            layers: 1,
            memory: FramebufferMemory::Owned,
            own_images: true,
            image_sets: Vec::new(),
            color_memory: None,
            depth_memory: None,
        }
    }

    pub fn key(&self) -> FramebufferKey {
        self.key
    }

    /// Supplies every attachment image directly, one set per swapchain image or a single set.
    ///
    /// Nothing is provisioned for this framebuffer afterwards and `memory` is ignored.
    pub fn set_image_sets(&mut self, image_sets: Vec<Vec<FramebufferImage>>) -> &mut Self {
        self.image_sets = image_sets;
        self.own_images = false;
        self.color_memory = None;
        self.depth_memory = None;
        self
    }

    pub fn owns_images(&self) -> bool {
        self.own_images
    }

    pub fn image_sets(&self) -> &[Vec<FramebufferImage>] {
        &self.image_sets
    }

    /// Arenas created for this framebuffer alone, filled during provisioning.
    pub fn owned_memories(&self) -> impl Iterator<Item = MemoryKey> + '_ {
        let owned = self.own_images && self.memory == FramebufferMemory::Owned;
        self.color_memory
            .iter()
            .chain(self.depth_memory.iter())
            .copied()
            .filter(move |_| owned)
    }

    /// Every arena image referenced by the image sets.
    pub fn arena_images(&self) -> impl Iterator<Item = ImageHandle> + '_ {
        self.image_sets.iter().flatten().filter_map(|image| match *image {
            FramebufferImage::Arena(handle) => Some(handle),
            FramebufferImage::Swapchain => None,
        })
    }

    /// First phase: declares every non-swapchain image the render pass needs.
    ///
    /// Color and resolve images go to `color`, depth-stencil images to `depth`, both looked up
    /// in `arenas`. `image_count` is the swapchain's image count, or 1 without a swapchain.
    /// Nothing is changed when this fails.
    pub(crate) fn provision(
        &mut self,
        resolved: &ResolvedRenderPass,
        image_count: usize,
        extent: vk::Extent2D,
        color: MemoryKey,
        depth: MemoryKey,
        arenas: &mut SecondaryMap<MemoryKey, MemoryDesc>,
    ) -> Result<()> {
        if extent.width == 0 || extent.height == 0 {
            return Err(ConfigError::ZeroExtent.into());
        }

        let mut staged: SecondaryMap<MemoryKey, MemoryDesc> = SecondaryMap::new();
        for key in [color, depth] {
            let arena = arenas
                .get(key)
                .ok_or(ConfigError::UnknownHandle("framebuffer memory"))?;
            staged.insert(key, arena.clone());
        }

        let mut image_sets = Vec::with_capacity(image_count);
        for set in 0..image_count {
            let mut images = Vec::with_capacity(resolved.images.len());
            for image in resolved.images.iter() {
                if let Some(swapchain) = image.swapchain {
                    if self.swapchain != Some(swapchain) {
                        return Err(ConfigError::UnknownHandle("framebuffer swapchain").into());
                    }
                    images.push(FramebufferImage::Swapchain);
                    continue;
                }

                let desc = ImageDesc {
                    name: format!("{} {} {:?}", self.name, set, image.kind),
                    ..attachment_image_desc(image, extent)
                };
                let arena = match image.kind {
                    AttachmentImageKind::DepthStencil => depth,
                    _ => color,
                };
                let handle = staged
                    .get_mut(arena)
                    .ok_or(ConfigError::UnknownHandle("framebuffer memory"))?
                    .add_image(desc);
                images.push(FramebufferImage::Arena(handle));
            }
            image_sets.push(images);
        }

        for (key, arena) in staged {
            arenas.insert(key, arena);
        }
        self.image_sets = image_sets;
        self.color_memory = Some(color);
        self.depth_memory = Some(depth);
        Ok(())
    }
}

/// Plans the declarations a swapchain-bound framebuffer is rebuilt from after a resize.
///
/// Arena declarations are read from `arenas` first, then from `live`, and every changed one is
/// written back to `arenas`. When the image count is unchanged, or the images were supplied by
/// the caller, the referenced arena images are resized in place. Owned arenas are declared again
/// for a new image count. On failure `arenas` and `desc` are left as they were.
pub(crate) fn plan_resize(
    desc: &FramebufferDesc,
    resolved: &ResolvedRenderPass,
    image_count: usize,
    extent: vk::Extent2D,
    arenas: &mut SecondaryMap<MemoryKey, MemoryDesc>,
    live: impl Fn(MemoryKey) -> Option<MemoryDesc>,
) -> Result<FramebufferDesc> {
    let mut planned = desc.clone();
    let mut staged: SecondaryMap<MemoryKey, MemoryDesc> = SecondaryMap::new();
    let stage = |staged: &mut SecondaryMap<MemoryKey, MemoryDesc>, key: MemoryKey| {
        if !staged.contains_key(key) {
            let arena = arenas
                .get(key)
                .cloned()
                .or_else(|| live(key))
                .ok_or(ConfigError::UnknownHandle("framebuffer memory"))?;
            staged.insert(key, arena);
        }
        Ok::<_, crate::VulkanError>(())
    };

    if desc.own_images && desc.image_sets.len() != image_count {
        let (Some(color), Some(depth)) = (desc.color_memory, desc.depth_memory) else {
            return Err(ConfigError::UnknownHandle("framebuffer memory").into());
        };
        if desc.memory != FramebufferMemory::Owned {
            // Images in a shared arena can't be removed without moving its other resources
            return Err(ConfigError::FramebufferImageCount {
                expected: image_count,
                actual: desc.image_sets.len(),
            }
            .into());
        }

        for key in [color, depth] {
            stage(&mut staged, key)?;
            let name = staged[key].name.clone();
            staged.insert(key, MemoryDesc::new(key, name));
        }
        planned.provision(resolved, image_count, extent, color, depth, &mut staged)?;
    } else {
        for handle in desc.arena_images() {
            stage(&mut staged, handle.memory)?;
            staged[handle.memory]
                .image_mut(handle)
                .ok_or(ConfigError::UnknownHandle("framebuffer image"))?
                .extent = extent;
        }
    }

    for (key, arena) in staged {
        arenas.insert(key, arena);
    }
    Ok(planned)
}

fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    }
}

/// Image shape backing one attachment description.
pub(crate) fn attachment_image_desc(image: &AttachmentImage, extent: vk::Extent2D) -> ImageDesc {
    let (aspect, usage) = match image.kind {
        AttachmentImageKind::DepthStencil => (
            depth_aspect(image.format),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        ),
        AttachmentImageKind::Color | AttachmentImageKind::Resolve => (
            vk::ImageAspectFlags::COLOR,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        ),
    };
    let usage = if image.samples == vk::SampleCountFlags::TYPE_1 {
        usage | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::INPUT_ATTACHMENT
    } else {
        usage | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT
    };

    ImageDesc {
        name: String::new(),
        format: image.format,
        aspect,
        usage,
        samples: image.samples,
        tiling: vk::ImageTiling::OPTIMAL,
        extent,
        mip_levels: 1,
    }
}

/// Second phase: resolves image sets into native views, all sets sharing one length.
pub(crate) fn collect_views(
    image_sets: &[Vec<FramebufferImage>],
    expected_sets: usize,
    attachment_count: usize,
    swapchain_views: &[vk::ImageView],
    arena_view: impl Fn(ImageHandle) -> Option<vk::ImageView>,
) -> Result<Vec<Vec<vk::ImageView>>> {
    if image_sets.len() != expected_sets {
        return Err(ConfigError::FramebufferImageCount {
            expected: expected_sets,
            actual: image_sets.len(),
        }
        .into());
    }

    let mut views = Vec::with_capacity(image_sets.len());
    for (set, images) in image_sets.iter().enumerate() {
        if images.len() != attachment_count {
            return Err(ConfigError::FramebufferAttachmentCount {
                set,
                expected: attachment_count,
                actual: images.len(),
            }
            .into());
        }

        let mut set_views = Vec::with_capacity(images.len());
        for image in images.iter() {
            let view = match *image {
                FramebufferImage::Swapchain => swapchain_views.get(set).copied(),
                FramebufferImage::Arena(handle) => arena_view(handle),
            }
            .ok_or(ConfigError::UnknownHandle("framebuffer image"))?;
            set_views.push(view);
        }
        views.push(set_views);
    }
    Ok(views)
}

/// One native framebuffer per image set; `handle` follows the swapchain's current image.
pub struct Framebuffer {
    device: Arc<AshDevice>,
    declaration: FramebufferDesc,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    handles: Vec<vk::Framebuffer>,
    current: usize,
}

impl Framebuffer {
    pub(crate) fn init(
        device: &Arc<AshDevice>,
        declaration: FramebufferDesc,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        views: Vec<Vec<vk::ImageView>>,
    ) -> Result<Self> {
        let mut framebuffer = Self {
            device: device.clone(),
            declaration,
            render_pass,
            extent,
            handles: Vec::with_capacity(views.len()),
            current: 0,
        };

        for (set, attachments) in views.iter().enumerate() {
            let handle = unsafe {
                device.core.create_framebuffer(
                    &vk::FramebufferCreateInfo::builder()
                        .render_pass(render_pass)
                        .attachments(attachments)
                        .width(extent.width)
                        .height(extent.height)
                        .layers(framebuffer.declaration.layers),
                    None,
                )
            }
            .with_context(|| format!("vkCreateFramebuffer {} {}", framebuffer.declaration.name, set))?;
            device.set_object_name(handle, &framebuffer.declaration.name);
            framebuffer.handles.push(handle);
        }

        debug!(
            "Framebuffer {}: {} sets of {}x{}",
            framebuffer.declaration.name,
            framebuffer.handles.len(),
            extent.width,
            extent.height
        );
        Ok(framebuffer)
    }

    /// Destroys the native framebuffers and returns the provisioned declaration.
    pub fn deinit(mut self) -> FramebufferDesc {
        let name = self.declaration.name.clone();
        std::mem::replace(
            &mut self.declaration,
            FramebufferDesc::new(FramebufferKey::default(), name, RenderPassKey::default()),
        )
    }

    pub fn key(&self) -> FramebufferKey {
        self.declaration.key
    }

    pub fn declaration(&self) -> &FramebufferDesc {
        &self.declaration
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handles[self.current]
    }

    pub fn handle_at(&self, index: usize) -> Option<vk::Framebuffer> {
        self.handles.get(index).copied()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub(crate) fn set_current_index(&mut self, index: usize) {
        if index < self.handles.len() {
            self.current = index;
        }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        for &handle in self.handles.iter() {
            unsafe { self.device.core.destroy_framebuffer(handle, None) };
        }
        trace!("Destroy Framebuffer {}", self.declaration.name);
    }
}
