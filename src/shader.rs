use crate::device::AshDevice;
use crate::{Result, ResultExt, ShaderKey, VulkanError};
use ash::vk;
use std::path::PathBuf;
use std::sync::Arc;

/// A precompiled SPIR-V blob, read from disk when the shader is initialized.
#[derive(Debug, Clone, Default)]
pub struct ShaderDesc {
    pub name: String,
    pub path: PathBuf,
}

impl ShaderDesc {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            path,
        }
    }
}

/// A shader stage used by a pipeline.
#[derive(Debug, Clone)]
pub struct ShaderRef {
    pub shader: ShaderKey,
    pub stage: vk::ShaderStageFlags,
    pub function_name: String,
}

impl ShaderRef {
    pub fn new(shader: ShaderKey, stage: vk::ShaderStageFlags) -> Self {
        Self {
            shader,
            stage,
            function_name: String::from("main"),
        }
    }
}

pub(crate) fn load_spirv(desc: &ShaderDesc) -> Result<Vec<u32>> {
    let to_error = |source| VulkanError::ShaderIo {
        path: desc.path.clone(),
        source,
    };
    let mut file = std::fs::File::open(&desc.path).map_err(to_error)?;
    ash::util::read_spv(&mut file).map_err(to_error)
}

pub struct Shader {
    device: Arc<AshDevice>,
    module: vk::ShaderModule,
    desc: ShaderDesc,
}

impl Shader {
    pub(crate) fn init(device: &Arc<AshDevice>, desc: ShaderDesc) -> Result<Self> {
        let code = load_spirv(&desc)?;
        let module = unsafe {
            device
                .core
                .create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(&code), None)
        }
        .with_context(|| format!("vkCreateShaderModule {}", desc.name))?;
        device.set_object_name(module, &desc.name);
        trace!("Create Shader {} ({} words)", desc.name, code.len());

        Ok(Self {
            device: device.clone(),
            module,
            desc,
        })
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn desc(&self) -> &ShaderDesc {
        &self.desc
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe { self.device.core.destroy_shader_module(self.module, None) };
        trace!("Destroy Shader {}", self.desc.name);
    }
}
