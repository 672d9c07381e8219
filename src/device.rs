use crate::command::{CommandBufferDesc, CommandPool, CommandPoolDesc, DynamicCommandBufferKey};
use crate::descriptor::{DescriptorResourceLookup, Descriptors, DescriptorsDesc};
use crate::framebuffer::{
    collect_views, plan_resize, Framebuffer, FramebufferDesc, FramebufferMemory,
};
use crate::instance::{AshInstance, WindowSurface};
use crate::lifecycle::{self, Children, Stage};
use crate::memory::{BufferHandle, ImageHandle, Memory, MemoryDesc};
use crate::physical_device::{
    missing_features, negotiate_features, select_physical_device, PhysicalDevice,
};
use crate::pipeline::{Pipeline, PipelineDesc};
use crate::queue::{assign_queue_families, family_priorities, Queue, QueueDesc, QueueType};
use crate::render_pass::{RenderPass, RenderPassDesc};
use crate::sampler::{Sampler, SamplerDesc};
use crate::shader::{Shader, ShaderDesc};
use crate::submission::{
    submit_batch, QueueSubmission, QueueSubmissionDesc, Semaphore, SubmissionLookup,
};
use crate::swapchain::{AcquireStatus, PresentStatus, ResizeStatus, Swapchain, SwapchainDesc};
use crate::{
    CommandBufferHandle, CommandPoolKey, ConfigError, DescriptorsKey, FramebufferKey, MemoryKey,
    PipelineKey, QueueKey, QueueSubmissionKey, RenderPassKey, Result, ResultExt, SamplerKey,
    SemaphoreKey, ShaderKey, SwapchainKey, WindowKey,
};
use ash::extensions::khr;
use ash::vk;
use slotmap::{SecondaryMap, SlotMap};
use std::ffi::{c_char, CString};
use std::sync::Arc;

fn swapchain_extension_name() -> String {
    khr::Swapchain::name().to_string_lossy().into_owned()
}

pub(crate) struct AshDevice {
    pub(crate) instance: Arc<AshInstance>,
    pub(crate) physical: vk::PhysicalDevice,
    pub(crate) core: ash::Device,
    pub(crate) swapchain: Option<khr::Swapchain>,
}

impl AshDevice {
    /// No-op unless validation enabled the debug utils extension.
    pub(crate) fn set_object_name<T: vk::Handle>(&self, object: T, name: &str) {
        if name.is_empty() {
            return;
        }

        if let Some(debug_utils) = &self.instance.debug_utils {
            debug_utils.set_object_name(self.core.handle(), object, name);
        }
    }

    pub(crate) fn swapchain_loader(&self) -> Result<&khr::Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| ConfigError::MissingExtensions(vec![swapchain_extension_name()]).into())
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        unsafe { self.core.destroy_device(None) };
        trace!("Destroy Device");
    }
}

/// The declared state of a device: requirements plus every child declaration.
#[derive(Debug, Clone, Default)]
pub struct DeviceBuilder {
    pub name: String,
    pub required_extensions: Vec<String>,
    pub required_features: vk::PhysicalDeviceFeatures,
    pub optional_features: vk::PhysicalDeviceFeatures,

    queues: SlotMap<QueueKey, QueueDesc>,
    swapchains: SlotMap<SwapchainKey, SwapchainDesc>,
    render_passes: SlotMap<RenderPassKey, RenderPassDesc>,
    framebuffers: SlotMap<FramebufferKey, FramebufferDesc>,
    memories: SlotMap<MemoryKey, MemoryDesc>,
    samplers: SlotMap<SamplerKey, SamplerDesc>,
    descriptors: SlotMap<DescriptorsKey, DescriptorsDesc>,
    shaders: SlotMap<ShaderKey, ShaderDesc>,
    pipelines: SlotMap<PipelineKey, PipelineDesc>,
    command_pools: SlotMap<CommandPoolKey, CommandPoolDesc>,
    semaphores: SlotMap<SemaphoreKey, String>,
    submissions: SlotMap<QueueSubmissionKey, QueueSubmissionDesc>,
}

impl DeviceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_queue(&mut self, desc: QueueDesc) -> QueueKey {
        self.queues.insert(desc)
    }

    pub fn queue_mut(&mut self, key: QueueKey) -> Option<&mut QueueDesc> {
        self.queues.get_mut(key)
    }

    pub fn add_swapchain(&mut self, window: WindowKey, present_queue: QueueKey) -> SwapchainKey {
        let name = format!("Swapchain {}", self.swapchains.len());
        self.swapchains
            .insert_with_key(|key| SwapchainDesc::new(key, name, window, present_queue))
    }

    pub fn swapchain_mut(&mut self, key: SwapchainKey) -> Option<&mut SwapchainDesc> {
        self.swapchains.get_mut(key)
    }

    pub fn add_render_pass(&mut self) -> RenderPassKey {
        let name = format!("RenderPass {}", self.render_passes.len());
        self.render_passes
            .insert_with_key(|key| RenderPassDesc::new(key, name))
    }

    pub fn render_pass_mut(&mut self, key: RenderPassKey) -> Option<&mut RenderPassDesc> {
        self.render_passes.get_mut(key)
    }

    /// Framebuffers render into a swapchain's images, or into one image set of `extent` without one.
    pub fn add_framebuffer(
        &mut self,
        render_pass: RenderPassKey,
        swapchain: Option<SwapchainKey>,
    ) -> FramebufferKey {
        let name = format!("Framebuffer {}", self.framebuffers.len());
        self.framebuffers.insert_with_key(|key| {
            let mut desc = FramebufferDesc::new(key, name, render_pass);
            desc.swapchain = swapchain;
            desc
        })
    }

    pub fn framebuffer_mut(&mut self, key: FramebufferKey) -> Option<&mut FramebufferDesc> {
        self.framebuffers.get_mut(key)
    }

    pub fn add_memory(&mut self) -> MemoryKey {
        let name = format!("Memory {}", self.memories.len());
        self.memories
            .insert_with_key(|key| MemoryDesc::new(key, name))
    }

    pub fn memory_mut(&mut self, key: MemoryKey) -> Option<&mut MemoryDesc> {
        self.memories.get_mut(key)
    }

    pub fn add_sampler(&mut self, desc: SamplerDesc) -> SamplerKey {
        self.samplers.insert(desc)
    }

    pub fn sampler_mut(&mut self, key: SamplerKey) -> Option<&mut SamplerDesc> {
        self.samplers.get_mut(key)
    }

    pub fn add_descriptors(&mut self) -> DescriptorsKey {
        let name = format!("Descriptors {}", self.descriptors.len());
        self.descriptors
            .insert_with_key(|key| DescriptorsDesc::new(key, name))
    }

    pub fn descriptors_mut(&mut self, key: DescriptorsKey) -> Option<&mut DescriptorsDesc> {
        self.descriptors.get_mut(key)
    }

    pub fn add_shader(&mut self, desc: ShaderDesc) -> ShaderKey {
        self.shaders.insert(desc)
    }

    pub fn add_pipeline(&mut self, render_pass: RenderPassKey, subpass: u32) -> PipelineKey {
        let name = format!("Pipeline {}", self.pipelines.len());
        self.pipelines
            .insert_with_key(|key| PipelineDesc::new(key, name, render_pass, subpass))
    }

    pub fn pipeline_mut(&mut self, key: PipelineKey) -> Option<&mut PipelineDesc> {
        self.pipelines.get_mut(key)
    }

    pub fn add_command_pool(&mut self, queue: QueueKey) -> CommandPoolKey {
        let name = format!("CommandPool {}", self.command_pools.len());
        self.command_pools
            .insert_with_key(|key| CommandPoolDesc::new(key, name, queue))
    }

    pub fn command_pool_mut(&mut self, key: CommandPoolKey) -> Option<&mut CommandPoolDesc> {
        self.command_pools.get_mut(key)
    }

    pub fn add_semaphore(&mut self, name: impl Into<String>) -> SemaphoreKey {
        self.semaphores.insert(name.into())
    }

    pub fn add_queue_submission(&mut self, queue: QueueKey) -> QueueSubmissionKey {
        let name = format!("QueueSubmission {}", self.submissions.len());
        self.submissions
            .insert_with_key(|key| QueueSubmissionDesc::new(key, name, queue))
    }

    pub fn queue_submission_mut(
        &mut self,
        key: QueueSubmissionKey,
    ) -> Option<&mut QueueSubmissionDesc> {
        self.submissions.get_mut(key)
    }

    /// Caller extensions plus the swapchain extension when a swapchain is declared.
    pub fn required_extension_names(&self) -> Vec<String> {
        let mut extensions = self.required_extensions.clone();
        let swapchain = swapchain_extension_name();
        if !self.swapchains.is_empty() && !extensions.contains(&swapchain) {
            extensions.push(swapchain);
        }
        extensions
    }

    /// Optional features plus the ones declared children would use if available.
    pub fn wanted_optional_features(&self) -> vk::PhysicalDeviceFeatures {
        let mut optional = self.optional_features;
        if self.samplers.values().any(SamplerDesc::wants_anisotropy) {
            optional.sampler_anisotropy = vk::TRUE;
        }
        if self
            .pipelines
            .values()
            .any(|pipeline| pipeline.multisample_shading)
        {
            optional.sample_rate_shading = vk::TRUE;
        }
        optional
    }

    fn downgrade_features(&mut self, enabled: &vk::PhysicalDeviceFeatures) {
        if enabled.sampler_anisotropy == vk::FALSE {
            for sampler in self.samplers.values_mut().filter(|sampler| sampler.wants_anisotropy()) {
                warn!(
                    "Sampler {}: samplerAnisotropy unavailable, anisotropy disabled",
                    sampler.name
                );
                sampler.anisotropy = 1;
            }
        }

        if enabled.sample_rate_shading == vk::FALSE {
            for pipeline in self
                .pipelines
                .values_mut()
                .filter(|pipeline| pipeline.multisample_shading)
            {
                warn!(
                    "Pipeline {}: sampleRateShading unavailable, sample shading disabled",
                    pipeline.name
                );
                pipeline.multisample_shading = false;
            }
        }
    }

    fn queue_requests(&self) -> Vec<QueueType> {
        self.queues.values().map(|queue| queue.queue_type).collect()
    }
}

struct LiveResources<'a> {
    memories: &'a Children<MemoryKey, Memory>,
    samplers: &'a Children<SamplerKey, Sampler>,
}

impl DescriptorResourceLookup for LiveResources<'_> {
    fn buffer(&self, handle: BufferHandle) -> Option<(vk::Buffer, vk::DeviceSize)> {
        let buffer = self.memories.get(handle.memory)?.buffer(handle)?;
        Some((buffer.handle(), buffer.desc().size))
    }

    fn image_view(&self, handle: ImageHandle) -> Option<vk::ImageView> {
        Some(self.memories.get(handle.memory)?.image(handle)?.view())
    }

    fn sampler(&self, key: SamplerKey) -> Option<vk::Sampler> {
        Some(self.samplers.get(key)?.handle())
    }
}

struct LiveHandles<'a> {
    command_pools: &'a Children<CommandPoolKey, CommandPool>,
    semaphores: &'a Children<SemaphoreKey, Semaphore>,
    swapchains: &'a Children<SwapchainKey, Swapchain>,
}

impl SubmissionLookup for LiveHandles<'_> {
    fn command_buffer(&self, handle: CommandBufferHandle) -> Option<vk::CommandBuffer> {
        Some(self.command_pools.get(handle.pool)?.buffer(handle)?.handle())
    }

    fn semaphore(&self, key: SemaphoreKey) -> Option<vk::Semaphore> {
        Some(self.semaphores.get(key)?.handle())
    }

    fn swapchain_semaphore(&self, key: SwapchainKey) -> Option<vk::Semaphore> {
        Some(self.swapchains.get(key)?.image_available())
    }
}

/// A live device and every child it brought up, torn down in reverse on drop.
pub struct Device {
    ash_device: Arc<AshDevice>,
    physical_device: PhysicalDevice,
    enabled_features: vk::PhysicalDeviceFeatures,
    surfaces: SecondaryMap<WindowKey, Arc<WindowSurface>>,
    queues: SecondaryMap<QueueKey, Queue>,

    declaration: DeviceBuilder,
    declared: DeviceBuilder,
    provisioned: Vec<(FramebufferKey, FramebufferDesc)>,

    swapchains: Children<SwapchainKey, Swapchain>,
    render_passes: Children<RenderPassKey, RenderPass>,
    memories: Children<MemoryKey, Memory>,
    samplers: Children<SamplerKey, Sampler>,
    descriptors: Children<DescriptorsKey, Descriptors>,
    shaders: Children<ShaderKey, Shader>,
    pipelines: Children<PipelineKey, Pipeline>,
    command_pools: Children<CommandPoolKey, CommandPool>,
    framebuffers: Children<FramebufferKey, Framebuffer>,
    semaphores: Children<SemaphoreKey, Semaphore>,
    submissions: Children<QueueSubmissionKey, QueueSubmission>,
}

/// Runs `init` and clears whatever it brought up if it fails part way.
fn atomic(
    device: &mut Device,
    init: fn(&mut Device) -> Result<()>,
    clear: fn(&mut Device),
) -> Result<()> {
    let result = init(device);
    if result.is_err() {
        clear(device);
    }
    result
}

const DEVICE_STAGES: &[Stage<Device>] = &[
    Stage {
        name: "Swapchains",
        bring_up: |device| atomic(device, init_swapchains, clear_swapchains),
        tear_down: clear_swapchains,
    },
    Stage {
        name: "RenderPasses",
        bring_up: |device| atomic(device, init_render_passes, clear_render_passes),
        tear_down: clear_render_passes,
    },
    Stage {
        name: "Framebuffer images",
        bring_up: |device| atomic(device, provision_framebuffers, release_framebuffer_images),
        tear_down: release_framebuffer_images,
    },
    Stage {
        name: "Memory",
        bring_up: |device| atomic(device, init_memories, clear_memories),
        tear_down: clear_memories,
    },
    Stage {
        name: "Samplers",
        bring_up: |device| atomic(device, init_samplers, clear_samplers),
        tear_down: clear_samplers,
    },
    Stage {
        name: "Descriptors",
        bring_up: |device| atomic(device, init_descriptors, clear_descriptors),
        tear_down: clear_descriptors,
    },
    Stage {
        name: "Shaders",
        bring_up: |device| atomic(device, init_shaders, clear_shaders),
        tear_down: clear_shaders,
    },
    Stage {
        name: "Pipelines",
        bring_up: |device| atomic(device, init_pipelines, clear_pipelines),
        tear_down: clear_pipelines,
    },
    Stage {
        name: "CommandPools",
        bring_up: |device| atomic(device, init_command_pools, clear_command_pools),
        tear_down: clear_command_pools,
    },
    Stage {
        name: "Framebuffers",
        bring_up: |device| atomic(device, init_framebuffers, clear_framebuffers),
        tear_down: clear_framebuffers,
    },
    Stage {
        name: "Semaphores",
        bring_up: |device| atomic(device, init_semaphores, clear_semaphores),
        tear_down: clear_semaphores,
    },
    Stage {
        name: "QueueSubmissions",
        bring_up: |device| atomic(device, config_submissions, clear_submissions),
        tear_down: clear_submissions,
    },
];

fn init_swapchains(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.declared.swapchains) {
        let name = desc.name.clone();
        let surface = device
            .surfaces
            .get(desc.window)
            .cloned()
            .ok_or(ConfigError::UnknownHandle("window"))
            .with_context(|| format!("Swapchain {}", name))?;
        let present_queue = device
            .queues
            .get(desc.present_queue)
            .map(Queue::handle)
            .ok_or(ConfigError::UnknownHandle("queue"))
            .with_context(|| format!("Swapchain {}", name))?;
        let swapchain = Swapchain::init(&device.ash_device, surface, present_queue, desc)
            .with_context(|| format!("Swapchain {}", name))?;
        device.swapchains.insert(key, swapchain);
    }
    Ok(())
}

fn clear_swapchains(device: &mut Device) {
    device.swapchains.clear();
}

fn init_render_passes(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.declared.render_passes) {
        let name = desc.name.clone();
        let swapchains = &device.swapchains;
        let render_pass = RenderPass::init(&device.ash_device, desc, |swapchain| {
            swapchains
                .get(swapchain)
                .map(|swapchain| swapchain.format().format)
        })
        .with_context(|| format!("RenderPass {}", name))?;
        device.render_passes.insert(key, render_pass);
    }
    Ok(())
}

fn clear_render_passes(device: &mut Device) {
    device.render_passes.clear();
}

/// Image count and extent a framebuffer is provisioned for.
fn framebuffer_target(device: &Device, desc: &FramebufferDesc) -> Result<(usize, vk::Extent2D)> {
    match desc.swapchain {
        Some(key) => {
            let swapchain = device
                .swapchains
                .get(key)
                .ok_or(ConfigError::UnknownHandle("swapchain"))?;
            Ok((swapchain.image_count(), swapchain.extent()))
        }
        None => Ok((1, desc.extent)),
    }
}

fn provision_framebuffers(device: &mut Device) -> Result<()> {
    for (key, mut desc) in std::mem::take(&mut device.declared.framebuffers) {
        if !desc.owns_images() {
            device.provisioned.push((key, desc));
            continue;
        }

        let name = desc.name.clone();
        let (image_count, extent) =
            framebuffer_target(device, &desc).with_context(|| format!("Framebuffer {}", name))?;
        let render_pass = device
            .render_passes
            .get(desc.render_pass)
            .ok_or(ConfigError::UnknownHandle("render pass"))
            .with_context(|| format!("Framebuffer {}", name))?;

        let mut arenas = SecondaryMap::new();
        let (color, depth) = match desc.memory {
            FramebufferMemory::Owned => {
                let color = device.declared.memories.insert(MemoryDesc::default());
                let depth = device.declared.memories.insert(MemoryDesc::default());
                arenas.insert(color, MemoryDesc::new(color, format!("{} color", name)));
                arenas.insert(depth, MemoryDesc::new(depth, format!("{} depth", name)));
                (color, depth)
            }
            FramebufferMemory::External { color, depth } => {
                for memory in [color, depth] {
                    if let Some(arena) = device.declared.memories.get(memory) {
                        arenas.insert(memory, arena.clone());
                    }
                }
                (color, depth)
            }
        };

        if let Err(error) = desc.provision(
            render_pass.resolved(),
            image_count,
            extent,
            color,
            depth,
            &mut arenas,
        ) {
            if desc.memory == FramebufferMemory::Owned {
                device.declared.memories.remove(color);
                device.declared.memories.remove(depth);
            }
            return Err(error).with_context(|| format!("Framebuffer {}", name));
        }

        for (memory, arena) in arenas {
            if let Some(declared) = device.declared.memories.get_mut(memory) {
                *declared = arena;
            }
        }
        device.provisioned.push((key, desc));
    }
    Ok(())
}

fn release_framebuffer_images(device: &mut Device) {
    for (_, desc) in device.provisioned.drain(..) {
        for memory in desc.owned_memories() {
            device.declared.memories.remove(memory);
        }
    }
}

fn init_memories(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.declared.memories) {
        let name = desc.name.clone();
        let memory = Memory::init(
            &device.ash_device,
            &device.physical_device.memory_properties,
            desc,
        )
        .with_context(|| format!("Memory {}", name))?;
        device.memories.insert(key, memory);
    }
    Ok(())
}

fn clear_memories(device: &mut Device) {
    device.memories.clear();
}

fn init_samplers(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.declared.samplers) {
        let name = desc.name.clone();
        let sampler = Sampler::init(&device.ash_device, desc)
            .with_context(|| format!("Sampler {}", name))?;
        device.samplers.insert(key, sampler);
    }
    Ok(())
}

fn clear_samplers(device: &mut Device) {
    device.samplers.clear();
}

fn init_descriptors(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.declared.descriptors) {
        let name = desc.name.clone();
        let lookup = LiveResources {
            memories: &device.memories,
            samplers: &device.samplers,
        };
        let descriptors = Descriptors::init(&device.ash_device, desc, &lookup)
            .with_context(|| format!("Descriptors {}", name))?;
        device.descriptors.insert(key, descriptors);
    }
    Ok(())
}

fn clear_descriptors(device: &mut Device) {
    device.descriptors.clear();
}

fn init_shaders(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.declared.shaders) {
        let name = desc.name.clone();
        let shader =
            Shader::init(&device.ash_device, desc).with_context(|| format!("Shader {}", name))?;
        device.shaders.insert(key, shader);
    }
    Ok(())
}

fn clear_shaders(device: &mut Device) {
    device.shaders.clear();
}

fn init_pipelines(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.declared.pipelines) {
        let name = desc.name.clone();
        let render_pass = device
            .render_passes
            .get(desc.render_pass)
            .ok_or(ConfigError::UnknownHandle("render pass"))
            .with_context(|| format!("Pipeline {}", name))?;
        let shaders = &device.shaders;
        let descriptors = &device.descriptors;
        let pipeline = Pipeline::init(
            &device.ash_device,
            desc,
            render_pass,
            |shader| shaders.get(shader).map(Shader::module),
            |layout| descriptors.get(layout.descriptors)?.layout(layout),
        )
        .with_context(|| format!("Pipeline {}", name))?;
        device.pipelines.insert(key, pipeline);
    }
    Ok(())
}

fn clear_pipelines(device: &mut Device) {
    device.pipelines.clear();
}

fn init_command_pools(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.declared.command_pools) {
        let name = desc.name.clone();
        let queue = device
            .queues
            .get(desc.queue)
            .copied()
            .ok_or(ConfigError::UnknownHandle("queue"))
            .with_context(|| format!("CommandPool {}", name))?;
        let render_passes = &device.render_passes;
        let pool = CommandPool::init(&device.ash_device, desc, queue.family_index(), |key| {
            render_passes.get(key).map(RenderPass::handle)
        })
        .with_context(|| format!("CommandPool {}", name))?;
        device.command_pools.insert(key, pool);
    }
    Ok(())
}

fn clear_command_pools(device: &mut Device) {
    device.command_pools.clear();
}

/// Builds a framebuffer whose arena images resolve through `arenas` before the live ones.
fn create_framebuffer(
    device: &Device,
    desc: FramebufferDesc,
    arenas: &SecondaryMap<MemoryKey, Memory>,
) -> Result<Framebuffer> {
    let render_pass = device
        .render_passes
        .get(desc.render_pass)
        .ok_or(ConfigError::UnknownHandle("render pass"))?;
    let (swapchain_views, extent) = match desc.swapchain {
        Some(key) => {
            let swapchain = device
                .swapchains
                .get(key)
                .ok_or(ConfigError::UnknownHandle("swapchain"))?;
            (swapchain.views(), swapchain.extent())
        }
        None => (&[][..], desc.extent),
    };
    let expected_sets = if desc.swapchain.is_some() {
        swapchain_views.len()
    } else {
        1
    };

    let views = collect_views(
        desc.image_sets(),
        expected_sets,
        render_pass.resolved().descriptions.len(),
        swapchain_views,
        |handle| {
            let memory = arenas
                .get(handle.memory)
                .or_else(|| device.memories.get(handle.memory))?;
            Some(memory.image(handle)?.view())
        },
    )?;
    Framebuffer::init(&device.ash_device, desc, render_pass.handle(), extent, views)
}

fn init_framebuffers(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.provisioned) {
        let name = desc.name.clone();
        let framebuffer = create_framebuffer(device, desc, &SecondaryMap::new())
            .with_context(|| format!("Framebuffer {}", name))?;
        device.framebuffers.insert(key, framebuffer);
    }
    Ok(())
}

fn clear_framebuffers(device: &mut Device) {
    device.framebuffers.clear();
}

fn init_semaphores(device: &mut Device) -> Result<()> {
    for (key, name) in std::mem::take(&mut device.declared.semaphores) {
        let semaphore = Semaphore::init(&device.ash_device, name)?;
        device.semaphores.insert(key, semaphore);
    }
    Ok(())
}

fn clear_semaphores(device: &mut Device) {
    device.semaphores.clear();
}

fn config_submissions(device: &mut Device) -> Result<()> {
    for (key, desc) in std::mem::take(&mut device.declared.submissions) {
        let name = desc.name.clone();
        let lookup = LiveHandles {
            command_pools: &device.command_pools,
            semaphores: &device.semaphores,
            swapchains: &device.swapchains,
        };
        let submission = QueueSubmission::config(desc, &lookup)
            .with_context(|| format!("QueueSubmission {}", name))?;
        device.submissions.insert(key, submission);
    }
    Ok(())
}

fn clear_submissions(device: &mut Device) {
    device.submissions.clear();
}

fn supports_present(
    surfaces: &[Arc<WindowSurface>],
    physical_device: vk::PhysicalDevice,
    family_index: u32,
) -> bool {
    !surfaces.is_empty()
        && surfaces
            .iter()
            .all(|surface| surface.supports_present(physical_device, family_index))
}

impl Device {
    pub(crate) fn new(
        instance: &Arc<AshInstance>,
        physical_devices: &[PhysicalDevice],
        surfaces: &SecondaryMap<WindowKey, Arc<WindowSurface>>,
        builder: DeviceBuilder,
    ) -> Result<Self> {
        let declaration = builder.clone();
        let mut declared = builder;

        let mut present_surfaces = declared
            .swapchains
            .values()
            .map(|swapchain| {
                surfaces
                    .get(swapchain.window)
                    .cloned()
                    .ok_or(ConfigError::UnknownHandle("window"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if present_surfaces.is_empty() {
            present_surfaces = surfaces.values().cloned().collect();
        }

        let required_extensions = declared.required_extension_names();
        let queue_requests = declared.queue_requests();
        let physical_device = select_physical_device(physical_devices, |candidate| {
            let missing = candidate.missing_extensions(&required_extensions);
            if !missing.is_empty() {
                return Err(ConfigError::MissingExtensions(missing).into());
            }
            let missing = missing_features(&candidate.features, &declared.required_features);
            if !missing.is_empty() {
                return Err(ConfigError::MissingFeatures(missing).into());
            }
            assign_queue_families(&candidate.queue_families, &queue_requests, |family| {
                supports_present(&present_surfaces, candidate.handle, family)
            })
            .map(|_| ())
        })?
        .clone();
        info!(
            "Device {}: selected {}",
            declared.name, physical_device.name
        );

        let enabled_features = negotiate_features(
            &physical_device.features,
            &declared.required_features,
            &declared.wanted_optional_features(),
        )?;
        declared.downgrade_features(&enabled_features);

        let assignments = assign_queue_families(
            &physical_device.queue_families,
            &queue_requests,
            |family| supports_present(&present_surfaces, physical_device.handle, family),
        )?;
        let priorities: Vec<f32> = declared.queues.values().map(|queue| queue.priority).collect();
        let families = family_priorities(&assignments, &priorities);
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|(family_index, queue_priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*family_index)
                    .queue_priorities(queue_priorities)
                    .build()
            })
            .collect();

        let extension_names = required_extensions
            .iter()
            .map(|name| {
                CString::new(name.as_str()).map_err(|_| ConfigError::InvalidName(name.clone()))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let extension_names_raw: Vec<*const c_char> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        let core = unsafe {
            instance.core.create_device(
                physical_device.handle,
                &vk::DeviceCreateInfo::builder()
                    .queue_create_infos(&queue_create_infos)
                    .enabled_extension_names(&extension_names_raw)
                    .enabled_features(&enabled_features),
                None,
            )
        }
        .context("vkCreateDevice")?;

        let swapchain = required_extensions
            .contains(&swapchain_extension_name())
            .then(|| khr::Swapchain::new(&instance.core, &core));
        let ash_device = Arc::new(AshDevice {
            instance: instance.clone(),
            physical: physical_device.handle,
            core,
            swapchain,
        });
        ash_device.set_object_name(ash_device.core.handle(), &declared.name);

        let mut queues = SecondaryMap::new();
        for ((key, desc), assignment) in declared.queues.iter().zip(assignments) {
            let handle = unsafe {
                ash_device
                    .core
                    .get_device_queue(assignment.family_index, assignment.queue_index)
            };
            ash_device.set_object_name(handle, &desc.name);
            queues.insert(
                key,
                Queue {
                    queue_type: desc.queue_type,
                    assignment,
                    priority: desc.priority,
                    handle,
                },
            );
        }

        let mut device = Self {
            ash_device,
            physical_device,
            enabled_features,
            surfaces: surfaces.clone(),
            queues,
            declaration,
            declared,
            provisioned: Vec::new(),
            swapchains: Children::default(),
            render_passes: Children::default(),
            memories: Children::default(),
            samplers: Children::default(),
            descriptors: Children::default(),
            shaders: Children::default(),
            pipelines: Children::default(),
            command_pools: Children::default(),
            framebuffers: Children::default(),
            semaphores: Children::default(),
            submissions: Children::default(),
        };

        lifecycle::bring_up(DEVICE_STAGES, &mut device)
            .with_context(|| format!("Device {}", device.declaration.name))?;

        // Pipelines keep what they need from the modules
        device.shaders.clear();

        info!(
            "Device {} created: {} swapchains, {} render passes, {} pipelines",
            device.declaration.name,
            device.swapchains.len(),
            device.render_passes.len(),
            device.pipelines.len()
        );
        Ok(device)
    }

    /// Tears everything down and returns the original declaration.
    pub fn deinit(mut self) -> DeviceBuilder {
        std::mem::take(&mut self.declaration)
    }

    pub fn declaration(&self) -> &DeviceBuilder {
        &self.declaration
    }

    pub fn handle(&self) -> vk::Device {
        self.ash_device.core.handle()
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    pub fn enabled_features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.enabled_features
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.ash_device.core.device_wait_idle() }.context("vkDeviceWaitIdle")
    }

    pub fn queue(&self, key: QueueKey) -> Option<&Queue> {
        self.queues.get(key)
    }

    pub fn swapchain(&self, key: SwapchainKey) -> Option<&Swapchain> {
        self.swapchains.get(key)
    }

    pub fn render_pass(&self, key: RenderPassKey) -> Option<&RenderPass> {
        self.render_passes.get(key)
    }

    pub fn framebuffer(&self, key: FramebufferKey) -> Option<&Framebuffer> {
        self.framebuffers.get(key)
    }

    pub fn memory(&self, key: MemoryKey) -> Option<&Memory> {
        self.memories.get(key)
    }

    pub fn sampler(&self, key: SamplerKey) -> Option<&Sampler> {
        self.samplers.get(key)
    }

    pub fn descriptors(&self, key: DescriptorsKey) -> Option<&Descriptors> {
        self.descriptors.get(key)
    }

    pub fn descriptors_mut(&mut self, key: DescriptorsKey) -> Option<&mut Descriptors> {
        self.descriptors.get_mut(key)
    }

    pub fn pipeline(&self, key: PipelineKey) -> Option<&Pipeline> {
        self.pipelines.get(key)
    }

    pub fn command_pool(&self, key: CommandPoolKey) -> Option<&CommandPool> {
        self.command_pools.get(key)
    }

    pub fn command_pool_mut(&mut self, key: CommandPoolKey) -> Option<&mut CommandPool> {
        self.command_pools.get_mut(key)
    }

    pub fn semaphore(&self, key: SemaphoreKey) -> Option<&Semaphore> {
        self.semaphores.get(key)
    }

    pub fn queue_submission(&self, key: QueueSubmissionKey) -> Option<&QueueSubmission> {
        self.submissions.get(key)
    }

    fn bound_framebuffers(&self, swapchain: SwapchainKey) -> Vec<FramebufferKey> {
        self.framebuffers
            .iter()
            .filter(|(_, framebuffer)| framebuffer.declaration().swapchain == Some(swapchain))
            .map(|(key, _)| key)
            .collect()
    }

    /// Acquires the next image, rebuilding once when the swapchain is out of date.
    pub fn acquire_next_image(&mut self, key: SwapchainKey) -> Result<AcquireStatus> {
        let mut status = self
            .swapchains
            .get_mut(key)
            .ok_or(ConfigError::UnknownHandle("swapchain"))?
            .acquire_next_image()?;

        if status == AcquireStatus::Retry {
            if self.resize_swapchain(key)? == ResizeStatus::SkipFrame {
                return Ok(AcquireStatus::SkipFrame);
            }
            status = self
                .swapchains
                .get_mut(key)
                .ok_or(ConfigError::UnknownHandle("swapchain"))?
                .acquire_next_image()?;
        }

        if let AcquireStatus::Acquired { index, .. } = status {
            for framebuffer in self.bound_framebuffers(key) {
                if let Some(framebuffer) = self.framebuffers.get_mut(framebuffer) {
                    framebuffer.set_current_index(index as usize);
                }
            }
        }
        Ok(status)
    }

    pub fn present(&mut self, key: SwapchainKey, wait: &[SemaphoreKey]) -> Result<PresentStatus> {
        let wait = wait
            .iter()
            .map(|&semaphore| {
                self.semaphores
                    .get(semaphore)
                    .map(Semaphore::handle)
                    .ok_or(ConfigError::UnknownHandle("semaphore"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.swapchains
            .get_mut(key)
            .ok_or(ConfigError::UnknownHandle("swapchain"))?
            .present(&wait)
    }

    /// Rebuilds the swapchain for the window's current size, then every framebuffer bound to it.
    ///
    /// Framebuffers and arenas are rebuilt next to the live ones and only swapped in once all of
    /// them succeed, so a failed rebuild leaves every key resolvable for the next attempt.
    /// A window without area skips the rebuild.
    pub fn resize_swapchain(&mut self, key: SwapchainKey) -> Result<ResizeStatus> {
        let swapchain = self
            .swapchains
            .get_mut(key)
            .ok_or(ConfigError::UnknownHandle("swapchain"))?;
        let name = swapchain.declaration().name.clone();
        let status = swapchain
            .resize()
            .with_context(|| format!("Swapchain {} resize", name))?;
        if status == ResizeStatus::SkipFrame {
            return Ok(status);
        }
        let image_count = swapchain.image_count();
        let extent = swapchain.extent();
        debug!(
            "Swapchain {} resized to {}x{}",
            name, extent.width, extent.height
        );

        let bound = self.bound_framebuffers(key);
        let mut planned_arenas: SecondaryMap<MemoryKey, MemoryDesc> = SecondaryMap::new();
        let mut planned: Vec<(FramebufferKey, FramebufferDesc)> = Vec::with_capacity(bound.len());
        for &framebuffer_key in bound.iter() {
            let Some(framebuffer) = self.framebuffers.get(framebuffer_key) else {
                continue;
            };
            let declaration = framebuffer.declaration();
            let render_pass = self
                .render_passes
                .get(declaration.render_pass)
                .ok_or(ConfigError::UnknownHandle("render pass"))?;
            let desc = plan_resize(
                declaration,
                render_pass.resolved(),
                image_count,
                extent,
                &mut planned_arenas,
                |memory| Some(self.memories.get(memory)?.declaration().clone()),
            )
            .with_context(|| format!("Framebuffer {}", declaration.name))?;
            planned.push((framebuffer_key, desc));
        }

        // Other framebuffers with images in a rebuilt arena need new views too
        for (framebuffer_key, framebuffer) in self.framebuffers.iter() {
            let declaration = framebuffer.declaration();
            if !bound.contains(&framebuffer_key)
                && declaration
                    .arena_images()
                    .any(|image| planned_arenas.contains_key(image.memory))
            {
                planned.push((framebuffer_key, declaration.clone()));
            }
        }

        let mut arenas: SecondaryMap<MemoryKey, Memory> = SecondaryMap::new();
        for (memory_key, arena) in planned_arenas {
            let arena_name = arena.name.clone();
            let memory = Memory::init(
                &self.ash_device,
                &self.physical_device.memory_properties,
                arena,
            )
            .with_context(|| format!("Memory {}", arena_name))?;
            arenas.insert(memory_key, memory);
        }

        let mut framebuffers = Vec::with_capacity(planned.len());
        for (framebuffer_key, desc) in planned {
            let framebuffer_name = desc.name.clone();
            let framebuffer = create_framebuffer(self, desc, &arenas)
                .with_context(|| format!("Framebuffer {}", framebuffer_name))?;
            framebuffers.push((framebuffer_key, framebuffer));
        }

        // Replaced framebuffers still hold views into the replaced arenas, drop them first
        for (framebuffer_key, framebuffer) in framebuffers {
            self.framebuffers.insert(framebuffer_key, framebuffer);
        }
        for (memory_key, memory) in arenas {
            self.memories.insert(memory_key, memory);
        }

        // Owned image views changed, descriptors pointing at them must be written again
        let descriptors: Vec<DescriptorsKey> = self.descriptors.iter().map(|(key, _)| key).collect();
        for descriptors in descriptors {
            self.update_descriptors(descriptors)?;
        }
        Ok(ResizeStatus::Resized)
    }

    /// Writes every recorded descriptor entry of `key` in one batch.
    pub fn update_descriptors(&mut self, key: DescriptorsKey) -> Result<()> {
        let lookup = LiveResources {
            memories: &self.memories,
            samplers: &self.samplers,
        };
        self.descriptors
            .get_mut(key)
            .ok_or(ConfigError::UnknownHandle("descriptors"))?
            .update(&lookup)
    }

    pub fn create_command_buffer(
        &mut self,
        pool: CommandPoolKey,
        desc: CommandBufferDesc,
    ) -> Result<DynamicCommandBufferKey> {
        let render_passes = &self.render_passes;
        self.command_pools
            .get_mut(pool)
            .ok_or(ConfigError::UnknownHandle("command pool"))?
            .create_buffer(desc, |key| render_passes.get(key).map(RenderPass::handle))
    }

    /// Submits `submissions` to `queue` in one call, refreshing swapchain waits first.
    pub fn submit_command_buffers(
        &mut self,
        queue: QueueKey,
        submissions: &[QueueSubmissionKey],
    ) -> Result<()> {
        let queue = self
            .queues
            .get(queue)
            .ok_or(ConfigError::UnknownHandle("queue"))?
            .handle();

        let lookup = LiveHandles {
            command_pools: &self.command_pools,
            semaphores: &self.semaphores,
            swapchains: &self.swapchains,
        };
        for &key in submissions {
            let submission = self
                .submissions
                .get_mut(key)
                .ok_or(ConfigError::UnknownHandle("queue submission"))?;
            let declaration = submission.declaration();
            if !declaration.no_auto_config && declaration.waits_on_swapchain() {
                submission.reconfig(&lookup)?;
            }
        }

        let batch = submissions
            .iter()
            .map(|&key| {
                self.submissions
                    .get(key)
                    .ok_or(ConfigError::UnknownHandle("queue submission"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        submit_batch(&self.ash_device, queue, &batch, vk::Fence::null())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(error) = self.wait_idle() {
            error!("Device {}: {}", self.declaration.name, error);
        }
        lifecycle::tear_down(DEVICE_STAGES, self);
        info!("Device {} destroyed", self.declaration.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn window() -> WindowKey {
        let mut windows: SlotMap<WindowKey, ()> = SlotMap::with_key();
        windows.insert(())
    }

    #[test]
    fn stages_follow_dependency_order() {
        let names: Vec<&str> = DEVICE_STAGES.iter().map(|stage| stage.name).collect();
        assert_eq!(
            names,
            [
                "Swapchains",
                "RenderPasses",
                "Framebuffer images",
                "Memory",
                "Samplers",
                "Descriptors",
                "Shaders",
                "Pipelines",
                "CommandPools",
                "Framebuffers",
                "Semaphores",
                "QueueSubmissions",
            ]
        );
    }

    #[test]
    fn swapchain_extension_is_implied_once() {
        let mut builder = DeviceBuilder::new("main");
        assert!(builder.required_extension_names().is_empty());

        let queue = builder.add_queue(QueueDesc::new(QueueType::Present));
        builder.add_swapchain(window(), queue);
        builder.add_swapchain(window(), queue);
        assert_eq!(builder.required_extension_names(), ["VK_KHR_swapchain"]);

        builder.required_extensions.push(String::from("VK_KHR_swapchain"));
        assert_eq!(builder.required_extension_names(), ["VK_KHR_swapchain"]);
    }

    #[test]
    fn children_request_optional_features() {
        let mut builder = DeviceBuilder::new("main");
        builder.add_sampler(SamplerDesc::default());
        let wanted = builder.wanted_optional_features();
        assert_eq!(wanted.sampler_anisotropy, vk::FALSE);
        assert_eq!(wanted.sample_rate_shading, vk::FALSE);

        builder.add_sampler(SamplerDesc {
            anisotropy: 16,
            ..Default::default()
        });
        let render_pass = builder.add_render_pass();
        let pipeline = builder.add_pipeline(render_pass, 0);
        builder
            .pipeline_mut(pipeline)
            .unwrap()
            .multisample_shading = true;

        let wanted = builder.wanted_optional_features();
        assert_eq!(wanted.sampler_anisotropy, vk::TRUE);
        assert_eq!(wanted.sample_rate_shading, vk::TRUE);
    }

    #[test]
    fn unavailable_features_downgrade_children() {
        let mut builder = DeviceBuilder::new("main");
        let sampler = builder.add_sampler(SamplerDesc {
            anisotropy: 8,
            ..Default::default()
        });
        let render_pass = builder.add_render_pass();
        let pipeline = builder.add_pipeline(render_pass, 0);
        builder
            .pipeline_mut(pipeline)
            .unwrap()
            .multisample_shading = true;

        builder.downgrade_features(&vk::PhysicalDeviceFeatures {
            sample_rate_shading: vk::TRUE,
            ..Default::default()
        });
        assert_eq!(builder.sampler_mut(sampler).unwrap().anisotropy, 1);
        assert!(builder.pipeline_mut(pipeline).unwrap().multisample_shading);

        builder.downgrade_features(&vk::PhysicalDeviceFeatures::default());
        assert!(!builder.pipeline_mut(pipeline).unwrap().multisample_shading);
    }

    #[test]
    fn declarations_get_distinct_default_names() {
        let mut builder = DeviceBuilder::new("main");
        let first = builder.add_render_pass();
        let second = builder.add_render_pass();
        assert_eq!(builder.render_pass_mut(first).unwrap().name, "RenderPass 0");
        assert_eq!(builder.render_pass_mut(second).unwrap().name, "RenderPass 1");
        assert_eq!(builder.render_pass_mut(second).unwrap().key(), second);
    }

    #[test]
    fn queue_requests_keep_declaration_order() {
        let mut builder = DeviceBuilder::new("main");
        builder.add_queue(QueueDesc::new(QueueType::Graphics));
        builder.add_queue(QueueDesc::new(QueueType::Transfer));
        builder.add_queue(QueueDesc::new(QueueType::Present));
        assert_eq!(
            builder.queue_requests(),
            [QueueType::Graphics, QueueType::Transfer, QueueType::Present]
        );
    }
}
