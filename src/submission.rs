use crate::device::AshDevice;
use crate::{
    CommandBufferHandle, ConfigError, QueueKey, QueueSubmissionKey, Result, ResultExt,
    SemaphoreKey, SwapchainKey,
};
use ash::vk;
use std::sync::Arc;

pub struct Semaphore {
    device: Arc<AshDevice>,
    handle: vk::Semaphore,
    name: String,
}

impl Semaphore {
    pub(crate) fn init(device: &Arc<AshDevice>, name: String) -> Result<Self> {
        let handle = unsafe {
            device
                .core
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .with_context(|| format!("vkCreateSemaphore {}", name))?;
        device.set_object_name(handle, &name);
        Ok(Self {
            device: device.clone(),
            handle,
            name,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.core.destroy_semaphore(self.handle, None) };
        trace!("Destroy Semaphore {}", self.name);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreWait {
    Semaphore {
        semaphore: SemaphoreKey,
        stage: vk::PipelineStageFlags,
    },
    /// The image-available semaphore of the swapchain's last acquire.
    Swapchain {
        swapchain: SwapchainKey,
        stage: vk::PipelineStageFlags,
    },
}

impl SemaphoreWait {
    fn stage(&self) -> vk::PipelineStageFlags {
        match *self {
            SemaphoreWait::Semaphore { stage, .. } | SemaphoreWait::Swapchain { stage, .. } => stage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSubmissionDesc {
    key: QueueSubmissionKey,
    pub name: String,
    pub queue: QueueKey,
    pub command_buffers: Vec<CommandBufferHandle>,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<SemaphoreKey>,
    /// When set the submission is only configured at bring-up, never again before a submit.
    pub no_auto_config: bool,
}

impl QueueSubmissionDesc {
    pub(crate) fn new(key: QueueSubmissionKey, name: String, queue: QueueKey) -> Self {
        Self {
            key,
            name,
            queue,
            command_buffers: Vec::new(),
            waits: Vec::new(),
            signals: Vec::new(),
            no_auto_config: false,
        }
    }

    pub fn key(&self) -> QueueSubmissionKey {
        self.key
    }

    pub fn wait_on(&mut self, wait: SemaphoreWait) -> &mut Self {
        self.waits.push(wait);
        self
    }

    pub fn signal(&mut self, semaphore: SemaphoreKey) -> &mut Self {
        self.signals.push(semaphore);
        self
    }

    /// Waits on a swapchain can't be resolved once, the acquire semaphore changes each frame.
    pub fn waits_on_swapchain(&self) -> bool {
        self.waits
            .iter()
            .any(|wait| matches!(wait, SemaphoreWait::Swapchain { .. }))
    }
}

pub(crate) trait SubmissionLookup {
    fn command_buffer(&self, handle: CommandBufferHandle) -> Option<vk::CommandBuffer>;
    fn semaphore(&self, key: SemaphoreKey) -> Option<vk::Semaphore>;
    fn swapchain_semaphore(&self, key: SwapchainKey) -> Option<vk::Semaphore>;
}

/// A submission with every handle resolved, ready for `vkQueueSubmit`.
#[derive(Debug, Clone)]
pub struct QueueSubmission {
    declaration: QueueSubmissionDesc,
    command_buffers: Vec<vk::CommandBuffer>,
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    signal_semaphores: Vec<vk::Semaphore>,
}

impl QueueSubmission {
    pub(crate) fn config(declaration: QueueSubmissionDesc, lookup: &impl SubmissionLookup) -> Result<Self> {
        let mut submission = Self {
            declaration,
            command_buffers: Vec::new(),
            wait_semaphores: Vec::new(),
            wait_stages: Vec::new(),
            signal_semaphores: Vec::new(),
        };
        submission.reconfig(lookup)?;
        Ok(submission)
    }

    pub(crate) fn reconfig(&mut self, lookup: &impl SubmissionLookup) -> Result<()> {
        let desc = &self.declaration;
        let command_buffers = desc
            .command_buffers
            .iter()
            .map(|&handle| lookup.command_buffer(handle).ok_or(ConfigError::UnknownHandle("command buffer")))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let wait_semaphores = desc
            .waits
            .iter()
            .map(|wait| match *wait {
                SemaphoreWait::Semaphore { semaphore, .. } => lookup
                    .semaphore(semaphore)
                    .ok_or(ConfigError::UnknownHandle("semaphore")),
                SemaphoreWait::Swapchain { swapchain, .. } => lookup
                    .swapchain_semaphore(swapchain)
                    .ok_or(ConfigError::UnknownHandle("swapchain")),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let signal_semaphores = desc
            .signals
            .iter()
            .map(|&key| lookup.semaphore(key).ok_or(ConfigError::UnknownHandle("semaphore")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.wait_stages = desc.waits.iter().map(SemaphoreWait::stage).collect();
        self.command_buffers = command_buffers;
        self.wait_semaphores = wait_semaphores;
        self.signal_semaphores = signal_semaphores;
        Ok(())
    }

    pub fn key(&self) -> QueueSubmissionKey {
        self.declaration.key
    }

    pub fn declaration(&self) -> &QueueSubmissionDesc {
        &self.declaration
    }

    pub fn signal_semaphores(&self) -> &[vk::Semaphore] {
        &self.signal_semaphores
    }

    fn submit_info(&self) -> vk::SubmitInfo {
        vk::SubmitInfo::builder()
            .command_buffers(&self.command_buffers)
            .wait_semaphores(&self.wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .signal_semaphores(&self.signal_semaphores)
            .build()
    }
}

/// Submits every submission in one native call.
pub(crate) fn submit_batch(
    device: &AshDevice,
    queue: vk::Queue,
    submissions: &[&QueueSubmission],
    fence: vk::Fence,
) -> Result<()> {
    let infos: Vec<vk::SubmitInfo> = submissions
        .iter()
        .map(|submission| submission.submit_info())
        .collect();
    unsafe { device.core.queue_submit(queue, &infos, fence) }.context("vkQueueSubmit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use slotmap::{Key, SlotMap};

    struct FakeHandles {
        pool: crate::CommandPoolKey,
        semaphores: Vec<SemaphoreKey>,
        swapchain: SwapchainKey,
        frame: u64,
    }

    impl SubmissionLookup for FakeHandles {
        fn command_buffer(&self, handle: CommandBufferHandle) -> Option<vk::CommandBuffer> {
            (handle.pool == self.pool).then(|| vk::CommandBuffer::from_raw(1 + handle.index as u64))
        }

        fn semaphore(&self, key: SemaphoreKey) -> Option<vk::Semaphore> {
            let index = self.semaphores.iter().position(|&other| other == key)?;
            Some(vk::Semaphore::from_raw(100 + index as u64))
        }

        fn swapchain_semaphore(&self, key: SwapchainKey) -> Option<vk::Semaphore> {
            (key == self.swapchain).then(|| vk::Semaphore::from_raw(200 + self.frame % 2))
        }
    }

    fn fixture() -> (FakeHandles, QueueSubmissionDesc) {
        let mut pools: SlotMap<crate::CommandPoolKey, ()> = SlotMap::with_key();
        let mut semaphores: SlotMap<SemaphoreKey, ()> = SlotMap::with_key();
        let mut swapchains: SlotMap<SwapchainKey, ()> = SlotMap::with_key();
        let mut submissions: SlotMap<QueueSubmissionKey, ()> = SlotMap::with_key();
        let mut queues: SlotMap<QueueKey, ()> = SlotMap::with_key();

        let handles = FakeHandles {
            pool: pools.insert(()),
            semaphores: vec![semaphores.insert(()), semaphores.insert(())],
            swapchain: swapchains.insert(()),
            frame: 0,
        };
        let mut desc = QueueSubmissionDesc::new(
            submissions.insert(()),
            String::from("frame"),
            queues.insert(()),
        );
        desc.command_buffers.push(CommandBufferHandle {
            pool: handles.pool,
            index: 0,
        });
        desc.wait_on(SemaphoreWait::Swapchain {
            swapchain: handles.swapchain,
            stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        })
        .wait_on(SemaphoreWait::Semaphore {
            semaphore: handles.semaphores[0],
            stage: vk::PipelineStageFlags::VERTEX_INPUT,
        })
        .signal(handles.semaphores[1]);
        (handles, desc)
    }

    #[test]
    fn waits_and_signals_are_resolved_in_order() {
        let (handles, desc) = fixture();
        assert!(desc.waits_on_swapchain());

        let submission = QueueSubmission::config(desc, &handles).unwrap();
        assert_eq!(submission.command_buffers, vec![vk::CommandBuffer::from_raw(1)]);
        assert_eq!(
            submission.wait_semaphores,
            vec![vk::Semaphore::from_raw(200), vk::Semaphore::from_raw(100)]
        );
        assert_eq!(
            submission.wait_stages,
            vec![
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::VERTEX_INPUT
            ]
        );
        assert_eq!(submission.signal_semaphores(), &[vk::Semaphore::from_raw(101)]);

        let info = submission.submit_info();
        assert_eq!(info.command_buffer_count, 1);
        assert_eq!(info.wait_semaphore_count, 2);
        assert_eq!(info.signal_semaphore_count, 1);
    }

    #[test]
    fn reconfig_follows_the_swapchain_semaphore() {
        let (mut handles, desc) = fixture();
        let mut submission = QueueSubmission::config(desc, &handles).unwrap();
        handles.frame = 1;
        submission.reconfig(&handles).unwrap();
        assert_eq!(submission.wait_semaphores[0], vk::Semaphore::from_raw(201));
    }

    #[test]
    fn unknown_handles_fail_configuration() {
        let (handles, mut desc) = fixture();
        desc.signals.push(SemaphoreKey::null());
        let error = QueueSubmission::config(desc, &handles).unwrap_err();
        assert_eq!(error.config(), Some(&ConfigError::UnknownHandle("semaphore")));
    }
}
