use crate::device::AshDevice;
use crate::{
    CommandPoolKey, ConfigError, Framebuffer, FramebufferKey, QueueKey, RenderPassKey, Result,
    ResultExt,
};
use ash::vk;
use slotmap::SlotMap;
use std::sync::Arc;

slotmap::new_key_type! {
    /// A command buffer created on a live pool.
    pub struct DynamicCommandBufferKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle {
    pub pool: CommandPoolKey,
    pub index: u32,
}

/// What a secondary buffer inherits from the primary that executes it.
#[derive(Debug, Clone)]
pub struct Inheritance {
    pub render_pass: RenderPassKey,
    pub subpass: u32,
    /// Optional, the framebuffer can also be given when recording starts.
    pub framebuffer: Option<FramebufferKey>,
    pub render_pass_continue: bool,
    pub occlusion_query_enable: bool,
    pub query_flags: vk::QueryControlFlags,
    pub pipeline_statistics: vk::QueryPipelineStatisticFlags,
}

impl Inheritance {
    pub fn new(render_pass: RenderPassKey, subpass: u32) -> Self {
        Self {
            render_pass,
            subpass,
            framebuffer: None,
            render_pass_continue: true,
            occlusion_query_enable: false,
            query_flags: vk::QueryControlFlags::empty(),
            pipeline_statistics: vk::QueryPipelineStatisticFlags::empty(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandBufferDesc {
    pub name: String,
    pub one_time_submit: bool,
    pub simultaneous_use: bool,
    pub release_resources_on_reset: bool,
    /// `Some` makes this a secondary buffer.
    pub secondary: Option<Inheritance>,
}

impl CommandBufferDesc {
    pub fn level(&self) -> vk::CommandBufferLevel {
        if self.secondary.is_some() {
            vk::CommandBufferLevel::SECONDARY
        } else {
            vk::CommandBufferLevel::PRIMARY
        }
    }

    pub fn usage_flags(&self) -> vk::CommandBufferUsageFlags {
        let mut flags = vk::CommandBufferUsageFlags::empty();
        if self.one_time_submit {
            flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        }
        if self.simultaneous_use {
            flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        if matches!(&self.secondary, Some(inheritance) if inheritance.render_pass_continue) {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        flags
    }

    fn reset_flags(&self) -> vk::CommandBufferResetFlags {
        if self.release_resources_on_reset {
            vk::CommandBufferResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandBufferResetFlags::empty()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandPoolDesc {
    key: CommandPoolKey,
    pub name: String,
    pub queue: QueueKey,
    pub transient: bool,
    pub resettable: bool,
    pub protected_memory: bool,
    buffers: Vec<CommandBufferDesc>,
}

impl CommandPoolDesc {
    pub(crate) fn new(key: CommandPoolKey, name: String, queue: QueueKey) -> Self {
        Self {
            key,
            name,
            queue,
            transient: false,
            resettable: true,
            protected_memory: false,
            buffers: Vec::new(),
        }
    }

    pub fn key(&self) -> CommandPoolKey {
        self.key
    }

    pub fn add_buffer(&mut self, desc: CommandBufferDesc) -> CommandBufferHandle {
        self.buffers.push(desc);
        CommandBufferHandle {
            pool: self.key,
            index: self.buffers.len() as u32 - 1,
        }
    }

    pub fn add_buffers(&mut self, count: usize, desc: CommandBufferDesc) -> Vec<CommandBufferHandle> {
        (0..count).map(|_| self.add_buffer(desc.clone())).collect()
    }

    pub fn buffer_mut(&mut self, handle: CommandBufferHandle) -> Option<&mut CommandBufferDesc> {
        if handle.pool != self.key {
            return None;
        }
        self.buffers.get_mut(handle.index as usize)
    }

    pub fn buffers(&self) -> &[CommandBufferDesc] {
        &self.buffers
    }

    pub fn create_flags(&self) -> vk::CommandPoolCreateFlags {
        let mut flags = vk::CommandPoolCreateFlags::empty();
        if self.transient {
            flags |= vk::CommandPoolCreateFlags::TRANSIENT;
        }
        if self.resettable {
            flags |= vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        }
        if self.protected_memory {
            flags |= vk::CommandPoolCreateFlags::PROTECTED;
        }
        flags
    }
}

/// A recordable command buffer. Recording needs `&mut self`, so one thread records it at a time.
pub struct CommandBuffer {
    device: Arc<AshDevice>,
    handle: vk::CommandBuffer,
    desc: CommandBufferDesc,
    render_pass: vk::RenderPass,
    recording: bool,
}

impl CommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn desc(&self) -> &CommandBufferDesc {
        &self.desc
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Starts recording. Secondary buffers inherit their render pass, and `framebuffer` when given.
    pub fn begin(&mut self, framebuffer: Option<&Framebuffer>) -> Result<()> {
        if self.recording {
            return Err(ConfigError::AlreadyRecording.into());
        }

        let mut inheritance_info = vk::CommandBufferInheritanceInfo::builder();
        if let Some(inheritance) = self.desc.secondary.as_ref() {
            inheritance_info = inheritance_info
                .render_pass(self.render_pass)
                .subpass(inheritance.subpass)
                .framebuffer(framebuffer.map_or(vk::Framebuffer::null(), |framebuffer| {
                    framebuffer.handle()
                }))
                .occlusion_query_enable(inheritance.occlusion_query_enable)
                .query_flags(inheritance.query_flags)
                .pipeline_statistics(inheritance.pipeline_statistics);
        }

        unsafe {
            self.device.core.begin_command_buffer(
                self.handle,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(self.desc.usage_flags())
                    .inheritance_info(&inheritance_info),
            )
        }
        .with_context(|| format!("vkBeginCommandBuffer {}", self.desc.name))?;
        self.recording = true;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        if !self.recording {
            return Err(ConfigError::NotRecording.into());
        }
        self.recording = false;
        unsafe { self.device.core.end_command_buffer(self.handle) }
            .with_context(|| format!("vkEndCommandBuffer {}", self.desc.name))
    }

    pub fn reset(&mut self) -> Result<()> {
        self.recording = false;
        unsafe {
            self.device
                .core
                .reset_command_buffer(self.handle, self.desc.reset_flags())
        }
        .with_context(|| format!("vkResetCommandBuffer {}", self.desc.name))
    }

    /// Records the execution of secondary buffers into this primary buffer.
    pub fn execute(&mut self, secondaries: &[&CommandBuffer]) -> Result<()> {
        if !self.recording {
            return Err(ConfigError::NotRecording.into());
        }
        let handles: Vec<vk::CommandBuffer> =
            secondaries.iter().map(|secondary| secondary.handle).collect();
        unsafe { self.device.core.cmd_execute_commands(self.handle, &handles) };
        Ok(())
    }
}

/// Resolves a buffer's inherited render pass key to its native handle.
fn inherited_render_pass(
    desc: &CommandBufferDesc,
    render_pass: &impl Fn(RenderPassKey) -> Option<vk::RenderPass>,
) -> Result<vk::RenderPass> {
    match desc.secondary.as_ref() {
        Some(inheritance) => Ok(render_pass(inheritance.render_pass)
            .ok_or(ConfigError::UnknownHandle("inherited render pass"))?),
        None => Ok(vk::RenderPass::null()),
    }
}

pub struct CommandPool {
    device: Arc<AshDevice>,
    declaration: CommandPoolDesc,
    handle: vk::CommandPool,
    buffers: Vec<CommandBuffer>,
    dynamic_buffers: SlotMap<DynamicCommandBufferKey, CommandBuffer>,
}

impl CommandPool {
    pub(crate) fn init(
        device: &Arc<AshDevice>,
        declaration: CommandPoolDesc,
        queue_family_index: u32,
        render_pass: impl Fn(RenderPassKey) -> Option<vk::RenderPass>,
    ) -> Result<Self> {
        let mut pool = Self {
            device: device.clone(),
            handle: vk::CommandPool::null(),
            buffers: Vec::with_capacity(declaration.buffers.len()),
            dynamic_buffers: SlotMap::with_key(),
            declaration,
        };

        let render_passes = pool
            .declaration
            .buffers
            .iter()
            .map(|desc| inherited_render_pass(desc, &render_pass))
            .collect::<Result<Vec<_>>>()?;

        pool.handle = unsafe {
            device.core.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(queue_family_index)
                    .flags(pool.declaration.create_flags()),
                None,
            )
        }
        .with_context(|| format!("vkCreateCommandPool {}", pool.declaration.name))?;
        device.set_object_name(pool.handle, &pool.declaration.name);

        // One allocation per level, handed back out in declaration order
        let mut allocated = [Vec::new(), Vec::new()];
        for (slot, level) in [vk::CommandBufferLevel::PRIMARY, vk::CommandBufferLevel::SECONDARY]
            .into_iter()
            .enumerate()
        {
            let count = pool
                .declaration
                .buffers
                .iter()
                .filter(|desc| desc.level() == level)
                .count() as u32;
            if count == 0 {
                continue;
            }
            let mut handles = pool.allocate(level, count)?;
            handles.reverse();
            allocated[slot] = handles;
        }

        for (desc, render_pass) in pool.declaration.buffers.iter().zip(render_passes) {
            let slot = usize::from(desc.level() == vk::CommandBufferLevel::SECONDARY);
            let handle = allocated[slot].pop().unwrap_or_default();
            device.set_object_name(handle, &desc.name);
            pool.buffers.push(CommandBuffer {
                device: device.clone(),
                handle,
                desc: desc.clone(),
                render_pass,
                recording: false,
            });
        }

        debug!(
            "CommandPool {}: {} buffers on family {}",
            pool.declaration.name,
            pool.buffers.len(),
            queue_family_index
        );
        Ok(pool)
    }

    fn allocate(&self, level: vk::CommandBufferLevel, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        unsafe {
            self.device.core.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(self.handle)
                    .level(level)
                    .command_buffer_count(count),
            )
        }
        .with_context(|| format!("vkAllocateCommandBuffers {}", self.declaration.name))
    }

    pub fn key(&self) -> CommandPoolKey {
        self.declaration.key
    }

    pub fn declaration(&self) -> &CommandPoolDesc {
        &self.declaration
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn buffers(&self) -> &[CommandBuffer] {
        &self.buffers
    }

    /// Disjoint mutable buffers, one per recording thread.
    pub fn buffers_mut(&mut self) -> &mut [CommandBuffer] {
        &mut self.buffers
    }

    pub fn buffer(&self, handle: CommandBufferHandle) -> Option<&CommandBuffer> {
        if handle.pool != self.key() {
            return None;
        }
        self.buffers.get(handle.index as usize)
    }

    pub fn buffer_mut(&mut self, handle: CommandBufferHandle) -> Option<&mut CommandBuffer> {
        if handle.pool != self.key() {
            return None;
        }
        self.buffers.get_mut(handle.index as usize)
    }

    pub(crate) fn create_buffer(
        &mut self,
        desc: CommandBufferDesc,
        render_pass: impl Fn(RenderPassKey) -> Option<vk::RenderPass>,
    ) -> Result<DynamicCommandBufferKey> {
        let inherited = inherited_render_pass(&desc, &render_pass)?;
        let handle = self
            .allocate(desc.level(), 1)?
            .pop()
            .unwrap_or_default();
        self.device.set_object_name(handle, &desc.name);
        trace!("CommandPool {}: create buffer {}", self.declaration.name, desc.name);
        Ok(self.dynamic_buffers.insert(CommandBuffer {
            device: self.device.clone(),
            handle,
            desc,
            render_pass: inherited,
            recording: false,
        }))
    }

    pub fn destroy_buffer(&mut self, key: DynamicCommandBufferKey) -> Result<()> {
        let buffer = self
            .dynamic_buffers
            .remove(key)
            .ok_or(ConfigError::UnknownHandle("command buffer"))?;
        unsafe {
            self.device
                .core
                .free_command_buffers(self.handle, &[buffer.handle])
        };
        Ok(())
    }

    pub fn dynamic_buffer(&self, key: DynamicCommandBufferKey) -> Option<&CommandBuffer> {
        self.dynamic_buffers.get(key)
    }

    pub fn dynamic_buffer_mut(&mut self, key: DynamicCommandBufferKey) -> Option<&mut CommandBuffer> {
        self.dynamic_buffers.get_mut(key)
    }

    /// Resets every buffer of the pool at once.
    pub fn reset(&mut self) -> Result<()> {
        unsafe {
            self.device
                .core
                .reset_command_pool(self.handle, vk::CommandPoolResetFlags::empty())
        }
        .with_context(|| format!("vkResetCommandPool {}", self.declaration.name))?;
        for buffer in self
            .buffers
            .iter_mut()
            .chain(self.dynamic_buffers.values_mut())
        {
            buffer.recording = false;
        }
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Destroying the pool frees every buffer allocated from it
        if self.handle != vk::CommandPool::null() {
            unsafe { self.device.core.destroy_command_pool(self.handle, None) };
        }
        trace!("Destroy CommandPool {}", self.declaration.name);
    }
}
