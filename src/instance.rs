use crate::debug_utils::DebugUtils;
use crate::device::{Device, DeviceBuilder};
use crate::lifecycle::Children;
use crate::physical_device::{c_str_to_string, PhysicalDevice};
use crate::{ConfigError, DeviceKey, Result, ResultExt, SurfaceWindow, WindowKey};
use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use slotmap::{SecondaryMap, SlotMap};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

pub(crate) struct AshInstance {
    pub(crate) entry: ash::Entry,
    pub(crate) core: ash::Instance,
    pub(crate) surface: khr::Surface,
    pub(crate) debug_utils: Option<DebugUtils>,
}

impl Drop for AshInstance {
    fn drop(&mut self) {
        drop(self.debug_utils.take());
        unsafe { self.core.destroy_instance(None) };
        trace!("Destroy Instance");
    }
}

/// A window's presentation surface, alive as long as something presents to it.
pub(crate) struct WindowSurface {
    instance: Arc<AshInstance>,
    handle: vk::SurfaceKHR,
    window: Arc<dyn SurfaceWindow>,
}

impl WindowSurface {
    fn new(instance: &Arc<AshInstance>, window: Arc<dyn SurfaceWindow>) -> Result<Self> {
        let handle = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.core,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("vkCreateSurfaceKHR")?;

        Ok(Self {
            instance: instance.clone(),
            handle,
            window,
        })
    }

    pub(crate) fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    pub(crate) fn window_size(&self) -> [u32; 2] {
        self.window.inner_size()
    }

    pub(crate) fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.instance
                .surface
                .get_physical_device_surface_capabilities(physical_device, self.handle)
        }
        .context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    pub(crate) fn formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.instance
                .surface
                .get_physical_device_surface_formats(physical_device, self.handle)
        }
        .context("vkGetPhysicalDeviceSurfaceFormatsKHR")
    }

    pub(crate) fn present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.instance
                .surface
                .get_physical_device_surface_present_modes(physical_device, self.handle)
        }
        .context("vkGetPhysicalDeviceSurfacePresentModesKHR")
    }

    pub(crate) fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        family_index: u32,
    ) -> bool {
        match unsafe {
            self.instance.surface.get_physical_device_surface_support(
                physical_device,
                family_index,
                self.handle,
            )
        } {
            Ok(supported) => supported,
            Err(err) => {
                error!("vkGetPhysicalDeviceSurfaceSupportKHR failed: {}", err);
                false
            }
        }
    }
}

impl Drop for WindowSurface {
    fn drop(&mut self) {
        unsafe { self.instance.surface.destroy_surface(self.handle, None) };
        trace!("Destroy Surface");
    }
}

fn missing_names(required: &[String], available: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !available.contains(name))
        .cloned()
        .collect()
}

fn push_unique(names: &mut Vec<String>, name: String) {
    if !names.contains(&name) {
        names.push(name);
    }
}

fn to_c_strings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|name| {
            CString::new(name.as_str())
                .map_err(|_| ConfigError::InvalidName(name.clone()).into())
        })
        .collect()
}

/// The declared root of the tree: app info, instance requirements, windows and devices.
#[derive(Clone)]
pub struct InstanceBuilder {
    pub app_name: String,
    pub app_version: [u32; 3],
    pub engine_name: String,
    pub api_version: u32,
    pub validation: bool,
    pub extensions: Vec<String>,
    pub layers: Vec<String>,

    windows: SlotMap<WindowKey, Arc<dyn SurfaceWindow>>,
    devices: SlotMap<DeviceKey, DeviceBuilder>,
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self {
            app_name: String::from("Neptune"),
            app_version: [0, 1, 0],
            engine_name: String::from("Neptune Vulkan"),
            api_version: vk::API_VERSION_1_2,
            validation: cfg!(debug_assertions),
            extensions: Vec::new(),
            layers: Vec::new(),
            windows: SlotMap::with_key(),
            devices: SlotMap::with_key(),
        }
    }
}

impl InstanceBuilder {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn add_window(&mut self, window: Arc<dyn SurfaceWindow>) -> WindowKey {
        self.windows.insert(window)
    }

    pub fn add_device(&mut self, name: impl Into<String>) -> DeviceKey {
        self.devices.insert(DeviceBuilder::new(name))
    }

    pub fn device_mut(&mut self, key: DeviceKey) -> Option<&mut DeviceBuilder> {
        self.devices.get_mut(key)
    }

    fn requested_layers(&self) -> Vec<String> {
        let mut layers = self.layers.clone();
        if self.validation {
            push_unique(&mut layers, String::from(VALIDATION_LAYER));
        }
        layers
    }

    fn requested_extensions(&self) -> Result<Vec<String>> {
        let mut extensions = self.extensions.clone();
        for window in self.windows.values() {
            let required = ash_window::enumerate_required_extensions(window.raw_display_handle())
                .context("Surface extensions")?;
            for &name in required {
                push_unique(
                    &mut extensions,
                    unsafe { CStr::from_ptr(name) }
                        .to_string_lossy()
                        .into_owned(),
                );
            }
        }
        if self.validation {
            push_unique(
                &mut extensions,
                DebugUtils::name().to_string_lossy().into_owned(),
            );
        }
        Ok(extensions)
    }

    /// Creates the instance, a surface per window, then every device in declaration order.
    pub fn init(self) -> Result<Instance> {
        let entry = unsafe { ash::Entry::load() }?;

        let layers = self.requested_layers();
        let available_layers: Vec<String> = entry
            .enumerate_instance_layer_properties()
            .context("vkEnumerateInstanceLayerProperties")?
            .iter()
            .map(|layer| c_str_to_string(&layer.layer_name))
            .collect();
        let missing = missing_names(&layers, &available_layers);
        if !missing.is_empty() {
            return Err(ConfigError::MissingLayers(missing).into());
        }

        let extensions = self.requested_extensions()?;
        let available_extensions: Vec<String> = entry
            .enumerate_instance_extension_properties(None)
            .context("vkEnumerateInstanceExtensionProperties")?
            .iter()
            .map(|extension| c_str_to_string(&extension.extension_name))
            .collect();
        let missing = missing_names(&extensions, &available_extensions);
        if !missing.is_empty() {
            return Err(ConfigError::MissingExtensions(missing).into());
        }

        let app_name = CString::new(self.app_name.as_str())
            .map_err(|_| ConfigError::InvalidName(self.app_name.clone()))?;
        let engine_name = CString::new(self.engine_name.as_str())
            .map_err(|_| ConfigError::InvalidName(self.engine_name.clone()))?;
        let layer_names = to_c_strings(&layers)?;
        let extension_names = to_c_strings(&extensions)?;
        let layer_names_raw: Vec<*const c_char> =
            layer_names.iter().map(|name| name.as_ptr()).collect();
        let extension_names_raw: Vec<*const c_char> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        let [major, minor, patch] = self.app_version;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(engine_name.as_c_str())
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(self.api_version);

        let core = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_layer_names(&layer_names_raw)
                    .enabled_extension_names(&extension_names_raw),
                None,
            )
        }
        .context("vkCreateInstance")?;

        let surface = khr::Surface::new(&entry, &core);
        let mut ash_instance = AshInstance {
            entry,
            core,
            surface,
            debug_utils: None,
        };
        if self.validation {
            ash_instance.debug_utils = Some(
                DebugUtils::new(&ash_instance.entry, &ash_instance.core)
                    .context("Debug messenger")?,
            );
        }
        let instance = Arc::new(ash_instance);
        info!(
            "Instance {} created: {} layers, {} extensions",
            self.app_name,
            layers.len(),
            extensions.len()
        );

        let mut surfaces = SecondaryMap::new();
        for (key, window) in self.windows.iter() {
            let surface = WindowSurface::new(&instance, window.clone())?;
            surfaces.insert(key, Arc::new(surface));
        }

        let mut physical_devices = unsafe { instance.core.enumerate_physical_devices() }
            .context("vkEnumeratePhysicalDevices")?
            .into_iter()
            .map(|handle| PhysicalDevice::new(&instance.core, handle))
            .collect::<Result<Vec<_>>>()?;
        physical_devices.sort_by(|a, b| b.score.cmp(&a.score));
        for physical_device in physical_devices.iter() {
            physical_device.log_info();
        }

        let mut devices = Children::default();
        for (key, builder) in self.devices.iter() {
            let device = Device::new(&instance, &physical_devices, &surfaces, builder.clone())
                .with_context(|| format!("Instance {}", self.app_name))?;
            devices.insert(key, device);
        }

        Ok(Instance {
            declaration: self,
            physical_devices,
            devices,
            surfaces,
            instance,
        })
    }
}

/// The live root: devices are torn down before the surfaces they present to.
pub struct Instance {
    declaration: InstanceBuilder,
    physical_devices: Vec<PhysicalDevice>,
    devices: Children<DeviceKey, Device>,
    surfaces: SecondaryMap<WindowKey, Arc<WindowSurface>>,
    instance: Arc<AshInstance>,
}

impl Instance {
    pub fn deinit(mut self) -> InstanceBuilder {
        std::mem::take(&mut self.declaration)
    }

    pub fn declaration(&self) -> &InstanceBuilder {
        &self.declaration
    }

    pub fn handle(&self) -> vk::Instance {
        self.instance.core.handle()
    }

    /// Every physical device, highest score first.
    pub fn physical_devices(&self) -> &[PhysicalDevice] {
        &self.physical_devices
    }

    pub fn device(&self, key: DeviceKey) -> Option<&Device> {
        self.devices.get(key)
    }

    pub fn device_mut(&mut self, key: DeviceKey) -> Option<&mut Device> {
        self.devices.get_mut(key)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.devices.clear();
        self.surfaces.clear();
        info!("Instance {} destroyed", self.declaration.app_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn missing_names_keep_request_order() {
        let available = names(&["VK_KHR_surface", "VK_KHR_xlib_surface"]);
        let required = names(&["VK_EXT_debug_utils", "VK_KHR_surface", "VK_KHR_display"]);
        assert_eq!(
            missing_names(&required, &available),
            ["VK_EXT_debug_utils", "VK_KHR_display"]
        );
        assert!(missing_names(&available, &available).is_empty());
    }

    #[test]
    fn validation_adds_the_layer_once() {
        let mut builder = InstanceBuilder::new("test");
        builder.validation = false;
        assert!(builder.requested_layers().is_empty());

        builder.validation = true;
        builder.layers.push(String::from(VALIDATION_LAYER));
        assert_eq!(builder.requested_layers(), [VALIDATION_LAYER]);
    }

    #[test]
    fn validation_requests_debug_utils() {
        let mut builder = InstanceBuilder::new("test");
        builder.validation = true;
        builder.extensions.push(String::from("VK_KHR_get_physical_device_properties2"));
        assert_eq!(
            builder.requested_extensions().unwrap(),
            ["VK_KHR_get_physical_device_properties2", "VK_EXT_debug_utils"]
        );
    }

    #[test]
    fn names_with_nul_bytes_are_rejected() {
        let error = to_c_strings(&names(&["VK_bad\0name"])).unwrap_err();
        assert_eq!(
            error.config(),
            Some(&ConfigError::InvalidName(String::from("VK_bad\0name")))
        );
    }

    #[test]
    fn devices_are_declared_by_name() {
        let mut builder = InstanceBuilder::new("test");
        let device = builder.add_device("main");
        assert_eq!(builder.device_mut(device).unwrap().name, "main");
        assert_eq!(builder.app_name, "test");
    }
}
