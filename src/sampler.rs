use crate::device::AshDevice;
use crate::{Result, ResultExt};
use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SamplerDesc {
    pub name: String,
    /// U, V and W.
    pub address_modes: [vk::SamplerAddressMode; 3],
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    /// Smallest and largest mip level sampled, `LOD_CLAMP_NONE` leaves the top open.
    pub lod: [f32; 2],
    pub mip_lod_bias: f32,
    /// 1 disables anisotropic filtering.
    pub anisotropy: u32,
    pub compare_op: Option<vk::CompareOp>,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            address_modes: [vk::SamplerAddressMode::CLAMP_TO_EDGE; 3],
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            lod: [0.0, vk::LOD_CLAMP_NONE],
            mip_lod_bias: 0.0,
            anisotropy: 1,
            compare_op: None,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            unnormalized_coordinates: false,
        }
    }
}

impl SamplerDesc {
    /// Point sampling on every axis, for pixel art and lookup tables.
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            ..Default::default()
        }
    }

    pub fn address_mode(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address_modes = [mode; 3];
        self
    }

    pub fn wants_anisotropy(&self) -> bool {
        self.anisotropy > 1
    }

    pub(crate) fn to_vk(&self) -> vk::SamplerCreateInfo {
        let [u, v, w] = self.address_modes;
        let [min_lod, max_lod] = self.lod;
        vk::SamplerCreateInfo {
            address_mode_u: u,
            address_mode_v: v,
            address_mode_w: w,
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
            mipmap_mode: self.mipmap_mode,
            min_lod,
            max_lod,
            mip_lod_bias: self.mip_lod_bias,
            anisotropy_enable: self.wants_anisotropy().into(),
            max_anisotropy: self.anisotropy.max(1) as f32,
            compare_enable: self.compare_op.is_some().into(),
            compare_op: self.compare_op.unwrap_or(vk::CompareOp::NEVER),
            border_color: self.border_color,
            unnormalized_coordinates: self.unnormalized_coordinates.into(),
            ..Default::default()
        }
    }
}

pub struct Sampler {
    device: Arc<AshDevice>,
    handle: vk::Sampler,
    desc: SamplerDesc,
}

impl Sampler {
    pub(crate) fn init(device: &Arc<AshDevice>, desc: SamplerDesc) -> Result<Self> {
        let handle = unsafe { device.core.create_sampler(&desc.to_vk(), None) }
            .with_context(|| format!("vkCreateSampler {}", desc.name))?;
        device.set_object_name(handle, &desc.name);
        trace!("Create Sampler {}", desc.name);
        Ok(Self {
            device: device.clone(),
            handle,
            desc,
        })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.core.destroy_sampler(self.handle, None) };
        trace!("Destroy Sampler {}", self.desc.name);
    }
}
