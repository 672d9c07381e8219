use crate::{ConfigError, Result};
use ash::vk;
use std::ffi::{c_char, CStr};
use std::fmt::{Debug, Formatter};

pub(crate) fn c_str_to_string(c_str: &[c_char]) -> String {
    unsafe {
        CStr::from_ptr(c_str.as_ptr())
            .to_string_lossy()
            .into_owned()
    }
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq)]
pub enum PhysicalDeviceVendor {
    Amd,
    Arm,
    ImgTec,
    Intel,
    Nvidia,
    Qualcomm,
    Broadcom,
    Unknown { vendor_id: u32 },
}

impl PhysicalDeviceVendor {
    pub(crate) fn from_vulkan(vendor_id: u32) -> Self {
        match vendor_id {
            0x1002 => Self::Amd,
            0x13B5 => Self::Arm,
            0x1010 => Self::ImgTec,
            0x8086 => Self::Intel,
            0x10DE => Self::Nvidia,
            0x5143 => Self::Qualcomm,
            0x14E4 => Self::Broadcom,
            vendor_id => Self::Unknown { vendor_id },
        }
    }

    /// Some vendors pack the driver version their own way, the rest follow the api version layout.
    pub fn driver_version(self, raw: u32) -> String {
        let field = |shift: u32, bits: u32| (raw >> shift) & ((1 << bits) - 1);
        match self {
            Self::Nvidia => format!(
                "{}.{}.{}.{}",
                field(22, 10),
                field(14, 8),
                field(6, 8),
                field(0, 6)
            ),
            #[cfg(target_os = "windows")]
            Self::Intel => format!("{}.{}", field(14, 18), field(0, 14)),
            _ => format!("{}.{}.{}", field(22, 10), field(12, 10), field(0, 12)),
        }
    }
}

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq)]
pub enum PhysicalDeviceType {
    Integrated,
    Discrete,
    Virtual,
    Cpu,
    Unknown,
}

impl PhysicalDeviceType {
    pub(crate) fn from_vulkan(device_type: vk::PhysicalDeviceType) -> Self {
        match device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::Discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::Integrated,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::Virtual,
            vk::PhysicalDeviceType::CPU => Self::Cpu,
            _ => Self::Unknown,
        }
    }
}

/// Immutable capability snapshot of one physical device.
#[derive(Clone)]
pub struct PhysicalDevice {
    pub(crate) handle: vk::PhysicalDevice,

    pub name: String,
    pub vendor: PhysicalDeviceVendor,
    pub device_type: PhysicalDeviceType,
    pub score: u64,

    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub extensions: Vec<String>,
}

impl PhysicalDevice {
    pub(crate) fn new(instance: &ash::Instance, handle: vk::PhysicalDevice) -> Result<Self> {
        let (properties, features, memory_properties, queue_families) = unsafe {
            (
                instance.get_physical_device_properties(handle),
                instance.get_physical_device_features(handle),
                instance.get_physical_device_memory_properties(handle),
                instance.get_physical_device_queue_family_properties(handle),
            )
        };

        let extensions = unsafe { instance.enumerate_device_extension_properties(handle) }?
            .iter()
            .map(|extension| c_str_to_string(&extension.extension_name))
            .collect();

        Ok(Self::from_parts(
            handle,
            properties,
            features,
            memory_properties,
            queue_families,
            extensions,
        ))
    }

    pub(crate) fn from_parts(
        handle: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceProperties,
        features: vk::PhysicalDeviceFeatures,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        queue_families: Vec<vk::QueueFamilyProperties>,
        extensions: Vec<String>,
    ) -> Self {
        Self {
            handle,
            name: c_str_to_string(&properties.device_name),
            vendor: PhysicalDeviceVendor::from_vulkan(properties.vendor_id),
            device_type: PhysicalDeviceType::from_vulkan(properties.device_type),
            score: score_properties(&properties),
            properties,
            features,
            memory_properties,
            queue_families,
            extensions,
        }
    }

    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|extension| extension == name)
    }

    /// Names from `required` this device doesn't expose.
    pub fn missing_extensions(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| !self.supports_extension(name))
            .cloned()
            .collect()
    }

    /// Total size of the heaps that are, or aren't, device local.
    pub fn heap_bytes(&self, device_local: bool) -> vk::DeviceSize {
        let count = self.memory_properties.memory_heap_count as usize;
        self.memory_properties.memory_heaps[..count]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) == device_local)
            .map(|heap| heap.size)
            .sum()
    }

    pub(crate) fn log_info(&self) {
        let api_version = self.properties.api_version;
        info!(
            "{} {:?} {:?} api {}.{}.{} driver {} score {}",
            self.name,
            self.vendor,
            self.device_type,
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            vk::api_version_patch(api_version),
            self.vendor.driver_version(self.properties.driver_version),
            self.score
        );
        info!(
            "    Memory: {} MiB device local, {} MiB host",
            self.heap_bytes(true) >> 20,
            self.heap_bytes(false) >> 20
        );
        for (index, family) in self.queue_families.iter().enumerate() {
            debug!(
                "    Queue family {}: {:?} x{}",
                index, family.queue_flags, family.queue_count
            );
        }
        debug!("    {} device extensions", self.extensions.len());
    }
}

impl Debug for PhysicalDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDevice")
            .field("name", &self.name)
            .field("device_type", &self.device_type)
            .field("score", &self.score)
            .finish_non_exhaustive()
    }
}

fn score_properties(properties: &vk::PhysicalDeviceProperties) -> u64 {
    let mut score = 0;
    if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += 1000;
    }
    score + properties.limits.max_image_dimension2_d as u64
}

/// Picks the highest scoring device that `is_suitable` accepts. Ties keep enumeration order.
pub(crate) fn select_physical_device<'a>(
    devices: &'a [PhysicalDevice],
    mut is_suitable: impl FnMut(&PhysicalDevice) -> Result<()>,
) -> Result<&'a PhysicalDevice> {
    if devices.is_empty() {
        return Err(ConfigError::NoPhysicalDevices.into());
    }

    let mut ranked: Vec<&PhysicalDevice> = devices.iter().collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));

    for device in ranked {
        match is_suitable(device) {
            Ok(()) => return Ok(device),
            Err(error) => debug!("Skipping physical device {}: {}", device.name, error),
        }
    }

    Err(ConfigError::NoSuitablePhysicalDevice.into())
}

struct Feature {
    name: &'static str,
    get: fn(&vk::PhysicalDeviceFeatures) -> vk::Bool32,
    set: fn(&mut vk::PhysicalDeviceFeatures, vk::Bool32),
}

macro_rules! features {
    ($($name:literal => $field:ident,)*) => {
        const FEATURES: &[Feature] = &[
            $(Feature {
                name: $name,
                get: |features| features.$field,
                set: |features, value| features.$field = value,
            },)*
        ];
    };
}

features! {
    "robustBufferAccess" => robust_buffer_access,
    "fullDrawIndexUint32" => full_draw_index_uint32,
    "imageCubeArray" => image_cube_array,
    "independentBlend" => independent_blend,
    "geometryShader" => geometry_shader,
    "tessellationShader" => tessellation_shader,
    "sampleRateShading" => sample_rate_shading,
    "dualSrcBlend" => dual_src_blend,
    "logicOp" => logic_op,
    "multiDrawIndirect" => multi_draw_indirect,
    "drawIndirectFirstInstance" => draw_indirect_first_instance,
    "depthClamp" => depth_clamp,
    "depthBiasClamp" => depth_bias_clamp,
    "fillModeNonSolid" => fill_mode_non_solid,
    "depthBounds" => depth_bounds,
    "wideLines" => wide_lines,
    "largePoints" => large_points,
    "alphaToOne" => alpha_to_one,
    "multiViewport" => multi_viewport,
    "samplerAnisotropy" => sampler_anisotropy,
    "textureCompressionETC2" => texture_compression_etc2,
    "textureCompressionASTC_LDR" => texture_compression_astc_ldr,
    "textureCompressionBC" => texture_compression_bc,
    "occlusionQueryPrecise" => occlusion_query_precise,
    "pipelineStatisticsQuery" => pipeline_statistics_query,
    "vertexPipelineStoresAndAtomics" => vertex_pipeline_stores_and_atomics,
    "fragmentStoresAndAtomics" => fragment_stores_and_atomics,
    "shaderTessellationAndGeometryPointSize" => shader_tessellation_and_geometry_point_size,
    "shaderImageGatherExtended" => shader_image_gather_extended,
    "shaderStorageImageExtendedFormats" => shader_storage_image_extended_formats,
    "shaderStorageImageMultisample" => shader_storage_image_multisample,
    "shaderStorageImageReadWithoutFormat" => shader_storage_image_read_without_format,
    "shaderStorageImageWriteWithoutFormat" => shader_storage_image_write_without_format,
    "shaderUniformBufferArrayDynamicIndexing" => shader_uniform_buffer_array_dynamic_indexing,
    "shaderSampledImageArrayDynamicIndexing" => shader_sampled_image_array_dynamic_indexing,
    "shaderStorageBufferArrayDynamicIndexing" => shader_storage_buffer_array_dynamic_indexing,
    "shaderStorageImageArrayDynamicIndexing" => shader_storage_image_array_dynamic_indexing,
    "shaderClipDistance" => shader_clip_distance,
    "shaderCullDistance" => shader_cull_distance,
    "shaderFloat64" => shader_float64,
    "shaderInt64" => shader_int64,
    "shaderInt16" => shader_int16,
    "shaderResourceResidency" => shader_resource_residency,
    "shaderResourceMinLod" => shader_resource_min_lod,
    "sparseBinding" => sparse_binding,
    "sparseResidencyBuffer" => sparse_residency_buffer,
    "sparseResidencyImage2D" => sparse_residency_image2_d,
    "sparseResidencyImage3D" => sparse_residency_image3_d,
    "sparseResidency2Samples" => sparse_residency2_samples,
    "sparseResidency4Samples" => sparse_residency4_samples,
    "sparseResidency8Samples" => sparse_residency8_samples,
    "sparseResidency16Samples" => sparse_residency16_samples,
    "sparseResidencyAliased" => sparse_residency_aliased,
    "variableMultisampleRate" => variable_multisample_rate,
    "inheritedQueries" => inherited_queries,
}

pub(crate) fn missing_features(
    supported: &vk::PhysicalDeviceFeatures,
    required: &vk::PhysicalDeviceFeatures,
) -> Vec<&'static str> {
    FEATURES
        .iter()
        .filter(|feature| (feature.get)(required) != vk::FALSE && (feature.get)(supported) == vk::FALSE)
        .map(|feature| feature.name)
        .collect()
}

/// Required features are all enabled or the negotiation fails; optional ones only when supported.
pub(crate) fn negotiate_features(
    supported: &vk::PhysicalDeviceFeatures,
    required: &vk::PhysicalDeviceFeatures,
    optional: &vk::PhysicalDeviceFeatures,
) -> Result<vk::PhysicalDeviceFeatures> {
    let missing = missing_features(supported, required);
    if !missing.is_empty() {
        return Err(ConfigError::MissingFeatures(missing).into());
    }

    let mut enabled = vk::PhysicalDeviceFeatures::default();
    for feature in FEATURES {
        let wanted = (feature.get)(required) != vk::FALSE
            || ((feature.get)(optional) != vk::FALSE && (feature.get)(supported) != vk::FALSE);
        if wanted {
            (feature.set)(&mut enabled, vk::TRUE);
        }
    }
    Ok(enabled)
}
