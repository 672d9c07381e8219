mod command;
mod debug_utils;
mod descriptor;
mod device;
mod framebuffer;
mod instance;
mod lifecycle;
mod memory;
mod physical_device;
mod pipeline;
mod queue;
mod render_pass;
mod sampler;
mod shader;
mod submission;
mod swapchain;

pub use command::*;
pub use descriptor::*;
pub use device::*;
pub use framebuffer::*;
pub use instance::*;
pub use memory::*;
pub use physical_device::*;
pub use pipeline::*;
pub use queue::*;
pub use render_pass::*;
pub use sampler::*;
pub use shader::*;
pub use submission::*;
pub use swapchain::*;

pub use ash;

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::path::PathBuf;

#[macro_use]
extern crate log;

#[derive(thiserror::Error, Debug)]
pub enum VulkanError {
    #[error("Vk error: {0}")]
    Vk(#[from] vk::Result),

    #[error("Failed to load vulkan entry: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to read shader {path:?}: {source}")]
    ShaderIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No compatible memory type for type bits {type_bits:#b}")]
    NoCompatibleMemoryType { type_bits: u32 },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<VulkanError>,
    },
}

impl VulkanError {
    /// Innermost error of a context chain.
    pub fn root(&self) -> &VulkanError {
        match self {
            VulkanError::Context { source, .. } => source.root(),
            error => error,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self.root(), VulkanError::Config(_))
    }

    pub fn config(&self) -> Option<&ConfigError> {
        match self.root() {
            VulkanError::Config(error) => Some(error),
            _ => None,
        }
    }

    pub fn vk_result(&self) -> Option<vk::Result> {
        match self.root() {
            VulkanError::Vk(result) => Some(*result),
            _ => None,
        }
    }
}

/// Inconsistencies in a declared tree, detected before any native call is made.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Attachment {attachment} has neither a color nor a depth-stencil buffer")]
    EmptyAttachment { attachment: usize },

    #[error("Attachment {attachment} resolves color but has a sample count of 1")]
    ResolveWithoutMultisample { attachment: usize },

    #[error("Attachment {attachment} is multisampled and presented without resolving")]
    MultisampledPresent { attachment: usize },

    #[error("RenderPass has no subpasses")]
    NoSubpasses,

    #[error("Subpass {subpass} references attachment {attachment} but only {count} exist")]
    AttachmentOutOfRange {
        subpass: usize,
        attachment: usize,
        count: usize,
    },

    #[error("Subpass {subpass} requests {role:?} from attachment {attachment} which doesn't provide it")]
    RoleUnavailable {
        subpass: usize,
        attachment: usize,
        role: AttachmentRole,
    },

    #[error("Subpass {subpass} requests access {access:?} of attachment {attachment} with no matching target")]
    AccessWithoutTarget {
        subpass: usize,
        attachment: usize,
        access: vk::AccessFlags,
    },

    #[error("Subpass {subpass} uses attachment {attachment} without any attachment access flags")]
    NoAttachmentAccess { subpass: usize, attachment: usize },

    /// A subpass has a single depth-stencil slot, read-only usages count as well.
    #[error("Subpass {subpass} has a second depth-stencil usage on attachment {attachment}")]
    DuplicateDepthStencil { subpass: usize, attachment: usize },

    #[error("Subpass {subpass} uses attachment {attachment} as an input with role All, but it has several images")]
    AmbiguousInputAttachment { subpass: usize, attachment: usize },

    #[error("Subpass index {subpass} is out of range, {count} subpasses exist")]
    SubpassOutOfRange { subpass: u32, count: usize },

    #[error("No queue family supports {queue_type:?}")]
    MissingQueueFamily { queue_type: QueueType },

    #[error("Missing extensions: {0:?}")]
    MissingExtensions(Vec<String>),

    #[error("Missing layers: {0:?}")]
    MissingLayers(Vec<String>),

    #[error("Missing required features: {0:?}")]
    MissingFeatures(Vec<&'static str>),

    #[error("No physical devices found")]
    NoPhysicalDevices,

    #[error("No physical device satisfies the declared requirements")]
    NoSuitablePhysicalDevice,

    #[error("Binding {binding} expects {expected} descriptors but {actual} were given")]
    DescriptorCountMismatch {
        binding: u32,
        expected: u32,
        actual: usize,
    },

    #[error("Binding {binding} doesn't exist in the descriptor layout")]
    UnknownDescriptorBinding { binding: u32 },

    #[error("Binding {binding} has type {descriptor_type:?} which can't hold this resource")]
    DescriptorKindMismatch {
        binding: u32,
        descriptor_type: vk::DescriptorType,
    },

    #[error("Resource {resource} shares no memory type with the resources before it")]
    IncompatibleMemoryTypes { resource: usize },

    #[error("Memory resource {index} is not host visible")]
    NotHostVisible { index: usize },

    #[error("Write of {len} bytes at offset {offset} exceeds resource size {size}")]
    WriteOutOfBounds {
        offset: vk::DeviceSize,
        len: usize,
        size: vk::DeviceSize,
    },

    #[error("Extent has zero area")]
    ZeroExtent,

    #[error("Framebuffer expects {expected} image sets but {actual} were given")]
    FramebufferImageCount { expected: usize, actual: usize },

    #[error("Framebuffer image set {set} has {actual} images but the render pass has {expected} attachments")]
    FramebufferAttachmentCount {
        set: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Pipeline has no dynamic viewport and no fixed extent")]
    PipelineExtentRequired,

    #[error("Command buffer is already recording")]
    AlreadyRecording,

    #[error("Command buffer is not recording")]
    NotRecording,

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Unknown {0} handle")]
    UnknownHandle(&'static str),
}

pub type Result<T> = std::result::Result<T, VulkanError>;

pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T, E: Into<VulkanError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|source| VulkanError::Context {
            context: context.into(),
            source: Box::new(source.into()),
        })
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|source| VulkanError::Context {
            context: f().into(),
            source: Box::new(source.into()),
        })
    }
}

slotmap::new_key_type! {
    pub struct WindowKey;
    pub struct DeviceKey;

    pub struct QueueKey;
    pub struct SwapchainKey;
    pub struct RenderPassKey;
    pub struct FramebufferKey;
    pub struct MemoryKey;
    pub struct SamplerKey;
    pub struct DescriptorsKey;
    pub struct ShaderKey;
    pub struct PipelineKey;
    pub struct CommandPoolKey;
    pub struct SemaphoreKey;
    pub struct QueueSubmissionKey;
}

/// The window side of a surface: raw handles plus the current pixel size.
pub trait SurfaceWindow: HasRawWindowHandle + HasRawDisplayHandle {
    fn inner_size(&self) -> [u32; 2];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_chain_keeps_root() {
        let result: std::result::Result<(), vk::Result> =
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let error = result
            .context("Memory init")
            .context("Device init")
            .unwrap_err();

        assert_eq!(
            error.vk_result(),
            Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert!(!error.is_config());
        assert!(error.to_string().starts_with("Device init: Memory init"));
    }

    #[test]
    fn config_errors_are_detected_through_context() {
        let error = Err::<(), _>(ConfigError::NoSubpasses)
            .with_context(|| format!("RenderPass {}", "main"))
            .unwrap_err();
        assert!(error.is_config());
        assert_eq!(error.config(), Some(&ConfigError::NoSubpasses));
    }
}
