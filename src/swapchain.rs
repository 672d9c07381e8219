use crate::device::AshDevice;
use crate::instance::WindowSurface;
use crate::{ConfigError, QueueKey, Result, ResultExt, SwapchainKey, WindowKey};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    key: SwapchainKey,
    pub name: String,
    pub window: WindowKey,
    /// Queue used for presentation, must support presenting to `window`.
    pub present_queue: QueueKey,
    pub preferred_format: vk::SurfaceFormatKHR,
    pub vsync: bool,
    pub image_count: u32,
    pub usage: vk::ImageUsageFlags,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    /// Nanoseconds, `u64::MAX` waits forever.
    pub acquire_timeout: u64,
}

impl SwapchainDesc {
    pub(crate) fn new(
        key: SwapchainKey,
        name: String,
        window: WindowKey,
        present_queue: QueueKey,
    ) -> Self {
        Self {
            key,
            name,
            window,
            present_queue,
            preferred_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vsync: true,
            image_count: 3,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            acquire_timeout: u64::MAX,
        }
    }

    pub fn key(&self) -> SwapchainKey {
        self.key
    }
}

pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    let matches = |surface_format: &&vk::SurfaceFormatKHR| {
        surface_format.format == preferred.format
            && surface_format.color_space == preferred.color_space
    };

    // A lone UNDEFINED entry means the surface takes any format
    if available.len() == 1 && available[0].format == vk::Format::UNDEFINED {
        return Some(preferred);
    }
    available
        .iter()
        .find(matches)
        .or_else(|| available.first())
        .copied()
}

pub fn choose_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = if vsync {
        &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED]
    } else {
        &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
    };
    preference
        .iter()
        .find(|mode| available.contains(mode))
        .or_else(|| available.first())
        .copied()
        // FIFO support is guaranteed by every surface
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's current extent, or the window size clamped to the surface limits when undefined.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_size: [u32; 2],
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window_size[0].clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_size[1].clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// A minimized window reports no area and can't back a swapchain until it is restored.
pub fn has_area(extent: vk::Extent2D) -> bool {
    extent.width != 0 && extent.height != 0
}

pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, preferred: u32) -> u32 {
    let count = preferred.max(capabilities.min_image_count);
    if capabilities.max_image_count == 0 {
        count
    } else {
        count.min(capabilities.max_image_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Acquired { index: u32, suboptimal: bool },
    /// Nothing was acquired within the timeout, skip this frame.
    SkipFrame,
    /// The swapchain is out of date, rebuild it and acquire again.
    Retry,
}

pub fn classify_acquire(result: VkResult<(u32, bool)>) -> Result<AcquireStatus> {
    match result {
        Ok((index, suboptimal)) => Ok(AcquireStatus::Acquired { index, suboptimal }),
        Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(AcquireStatus::SkipFrame),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireStatus::Retry),
        Err(error) => Err(error).context("vkAcquireNextImageKHR"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStatus {
    Resized,
    /// The window has no area, the previous swapchain is kept and frames are skipped.
    SkipFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// The image was shown or dropped but the swapchain should be rebuilt.
    Stale,
}

pub fn classify_present(result: VkResult<bool>) -> Result<PresentStatus> {
    match result {
        Ok(false) => Ok(PresentStatus::Presented),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::Stale),
        Err(error) => Err(error).context("vkQueuePresentKHR"),
    }
}

struct SurfaceSupport {
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
}

pub struct Swapchain {
    device: Arc<AshDevice>,
    surface: Arc<WindowSurface>,
    present_queue: vk::Queue,
    declaration: SwapchainDesc,
    support: SurfaceSupport,

    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,

    image_available: [vk::Semaphore; 2],
    next_semaphore: usize,
    current_semaphore: vk::Semaphore,
    current_image: u32,
    stale: bool,
}

impl Swapchain {
    /// Queries the surface once, then creates the first native swapchain.
    pub(crate) fn init(
        device: &Arc<AshDevice>,
        surface: Arc<WindowSurface>,
        present_queue: vk::Queue,
        declaration: SwapchainDesc,
    ) -> Result<Self> {
        let support = SurfaceSupport {
            capabilities: surface.capabilities(device.physical)?,
            formats: surface.formats(device.physical)?,
            present_modes: surface.present_modes(device.physical)?,
        };

        let mut swapchain = Self {
            device: device.clone(),
            surface,
            present_queue,
            support,
            handle: vk::SwapchainKHR::null(),
            format: declaration.preferred_format,
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
            image_available: [vk::Semaphore::null(); 2],
            next_semaphore: 0,
            current_semaphore: vk::Semaphore::null(),
            current_image: 0,
            stale: false,
            declaration,
        };

        for index in 0..swapchain.image_available.len() {
            swapchain.image_available[index] = unsafe {
                device
                    .core
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            }
            .context("vkCreateSemaphore")?;
        }

        if swapchain.create()? == ResizeStatus::SkipFrame {
            return Err(ConfigError::ZeroExtent)
                .with_context(|| format!("Swapchain {}", swapchain.declaration.name));
        }
        Ok(swapchain)
    }

    /// Builds a new native swapchain from the current surface state, retiring the previous one.
    pub(crate) fn create(&mut self) -> Result<ResizeStatus> {
        let device = self.device.clone();
        let loader = device.swapchain_loader()?;
        self.support.capabilities = self.surface.capabilities(self.device.physical)?;

        self.format =
            choose_surface_format(&self.support.formats, self.declaration.preferred_format)
                .unwrap_or(self.declaration.preferred_format);
        self.present_mode =
            choose_present_mode(&self.support.present_modes, self.declaration.vsync);
        let extent = choose_extent(&self.support.capabilities, self.surface.window_size());
        if !has_area(extent) {
            debug!("Swapchain {} window has no area", self.declaration.name);
            self.stale = true;
            return Ok(ResizeStatus::SkipFrame);
        }
        let image_count =
            choose_image_count(&self.support.capabilities, self.declaration.image_count);

        let composite_alpha = if self
            .support
            .capabilities
            .supported_composite_alpha
            .contains(self.declaration.composite_alpha)
        {
            self.declaration.composite_alpha
        } else {
            vk::CompositeAlphaFlagsKHR::OPAQUE
        };

        let handle = unsafe {
            loader.create_swapchain(
                &vk::SwapchainCreateInfoKHR::builder()
                    .surface(self.surface.handle())
                    .min_image_count(image_count)
                    .image_color_space(self.format.color_space)
                    .image_format(self.format.format)
                    .image_extent(extent)
                    .image_array_layers(1)
                    .image_usage(self.declaration.usage)
                    .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .pre_transform(self.support.capabilities.current_transform)
                    .composite_alpha(composite_alpha)
                    .present_mode(self.present_mode)
                    .clipped(true)
                    .old_swapchain(self.handle),
                None,
            )
        }
        .with_context(|| format!("vkCreateSwapchainKHR {}", self.declaration.name))?;

        // The old swapchain is only retired once its replacement exists
        self.destroy_images();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(self.handle, None) };
        }
        self.handle = handle;
        self.extent = extent;
        self.stale = false;
        self.device.set_object_name(handle, &self.declaration.name);

        self.images = unsafe { loader.get_swapchain_images(handle) }
            .context("vkGetSwapchainImagesKHR")?;
        for &image in self.images.iter() {
            let view = unsafe {
                self.device.core.create_image_view(
                    &vk::ImageViewCreateInfo::builder()
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(self.format.format)
                        .image(image)
                        .components(vk::ComponentMapping::default())
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        }),
                    None,
                )
            }
            .context("vkCreateImageView swapchain")?;
            self.views.push(view);
        }

        info!(
            "Swapchain {}: {}x{} {:?} {:?}, {} images",
            self.declaration.name,
            extent.width,
            extent.height,
            self.format.format,
            self.present_mode,
            self.images.len()
        );
        Ok(ResizeStatus::Resized)
    }

    /// Waits for the device to go idle and rebuilds for the current window size.
    pub(crate) fn resize(&mut self) -> Result<ResizeStatus> {
        unsafe { self.device.core.device_wait_idle() }.context("vkDeviceWaitIdle")?;
        self.create()
    }

    pub fn acquire_next_image(&mut self) -> Result<AcquireStatus> {
        let loader = self.device.swapchain_loader()?;
        let semaphore = self.image_available[self.next_semaphore];
        let status = classify_acquire(unsafe {
            loader.acquire_next_image(
                self.handle,
                self.declaration.acquire_timeout,
                semaphore,
                vk::Fence::null(),
            )
        })?;

        match status {
            AcquireStatus::Acquired { index, suboptimal } => {
                self.current_image = index;
                self.current_semaphore = semaphore;
                self.next_semaphore = (self.next_semaphore + 1) % self.image_available.len();
                if suboptimal {
                    self.stale = true;
                }
            }
            AcquireStatus::Retry => self.stale = true,
            AcquireStatus::SkipFrame => {}
        }
        Ok(status)
    }

    /// Presents the current image once every semaphore in `wait` is signaled.
    pub fn present(&mut self, wait: &[vk::Semaphore]) -> Result<PresentStatus> {
        let loader = self.device.swapchain_loader()?;
        let swapchains = [self.handle];
        let image_indices = [self.current_image];
        let status = classify_present(unsafe {
            loader.queue_present(
                self.present_queue,
                &vk::PresentInfoKHR::builder()
                    .wait_semaphores(wait)
                    .swapchains(&swapchains)
                    .image_indices(&image_indices),
            )
        })?;

        if status == PresentStatus::Stale {
            warn!("Swapchain {} is stale", self.declaration.name);
            self.stale = true;
        }
        Ok(status)
    }

    pub fn key(&self) -> SwapchainKey {
        self.declaration.key
    }

    pub fn declaration(&self) -> &SwapchainDesc {
        &self.declaration
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn current_image(&self) -> u32 {
        self.current_image
    }

    /// The semaphore signaled by the last successful acquire.
    pub fn image_available(&self) -> vk::Semaphore {
        self.current_semaphore
    }

    /// Set after a suboptimal or out of date result until the next rebuild.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    fn destroy_images(&mut self) {
        for view in self.views.drain(..) {
            unsafe { self.device.core.destroy_image_view(view, None) };
        }
        self.images.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_images();
        unsafe {
            if self.handle != vk::SwapchainKHR::null() {
                if let Some(loader) = self.device.swapchain.as_ref() {
                    loader.destroy_swapchain(self.handle, None);
                }
            }
            for &semaphore in self.image_available.iter() {
                if semaphore != vk::Semaphore::null() {
                    self.device.core.destroy_semaphore(semaphore, None);
                }
            }
        }
        trace!("Destroy Swapchain {}", self.declaration.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn capabilities(current: [u32; 2], min: [u32; 2], max: [u32; 2]) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 4,
            current_extent: vk::Extent2D {
                width: current[0],
                height: current[1],
            },
            min_image_extent: vk::Extent2D {
                width: min[0],
                height: min[1],
            },
            max_image_extent: vk::Extent2D {
                width: max[0],
                height: max[1],
            },
            ..Default::default()
        }
    }

    #[test]
    fn surface_format_selection() {
        let preferred = format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);

        let exact = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            preferred,
        ];
        assert_eq!(
            choose_surface_format(&exact, preferred).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );

        let no_preference = [format(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(
            choose_surface_format(&no_preference, preferred).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );

        let other = [
            format(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::HDR10_ST2084_EXT),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::HDR10_ST2084_EXT),
        ];
        assert_eq!(
            choose_surface_format(&other, preferred).map(|f| f.format),
            Some(vk::Format::A2B10G10R10_UNORM_PACK32)
        );

        assert!(choose_surface_format(&[], preferred).is_none());
    }

    #[test]
    fn present_mode_selection() {
        use ash::vk::PresentModeKHR as Mode;
        let all = [Mode::IMMEDIATE, Mode::MAILBOX, Mode::FIFO_RELAXED, Mode::FIFO];
        assert_eq!(choose_present_mode(&all, true), Mode::FIFO);
        assert_eq!(choose_present_mode(&[Mode::FIFO_RELAXED, Mode::MAILBOX], true), Mode::FIFO_RELAXED);
        assert_eq!(choose_present_mode(&all, false), Mode::MAILBOX);
        assert_eq!(choose_present_mode(&[Mode::FIFO, Mode::IMMEDIATE], false), Mode::IMMEDIATE);
        assert_eq!(choose_present_mode(&[Mode::SHARED_DEMAND_REFRESH, Mode::FIFO], false), Mode::SHARED_DEMAND_REFRESH);
    }

    #[test]
    fn extent_follows_surface_or_clamped_window() {
        let fixed = capabilities([1280, 720], [1, 1], [4096, 4096]);
        assert_eq!(
            choose_extent(&fixed, [1920, 1080]),
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );

        let undefined = capabilities([u32::MAX, u32::MAX], [64, 64], [2048, 1024]);
        for window in [[800, 600], [10, 5000], [4000, 10], [64, 1024]] {
            let extent = choose_extent(&undefined, window);
            assert!((64..=2048).contains(&extent.width));
            assert!((64..=1024).contains(&extent.height));
            if (64..=2048).contains(&window[0]) && (64..=1024).contains(&window[1]) {
                assert_eq!([extent.width, extent.height], window);
            }
        }
        assert_eq!(
            choose_extent(&undefined, [4000, 10]),
            vk::Extent2D {
                width: 2048,
                height: 64
            }
        );
    }

    #[test]
    fn minimized_window_has_no_area() {
        let undefined = capabilities([u32::MAX, u32::MAX], [0, 0], [4096, 4096]);
        let minimized = choose_extent(&undefined, [0, 0]);
        assert!(!has_area(minimized));
        assert!(!has_area(choose_extent(&undefined, [1280, 0])));
        assert!(has_area(choose_extent(&undefined, [1280, 720])));

        let reported = capabilities([0, 0], [0, 0], [4096, 4096]);
        assert!(!has_area(choose_extent(&reported, [1280, 720])));
    }

    #[test]
    fn image_count_is_clamped() {
        let limited = capabilities([1, 1], [1, 1], [1, 1]);
        assert_eq!(choose_image_count(&limited, 3), 3);
        assert_eq!(choose_image_count(&limited, 1), 2);
        assert_eq!(choose_image_count(&limited, 8), 4);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            max_image_count: 0,
            ..limited
        };
        assert_eq!(choose_image_count(&unbounded, 8), 8);
    }

    #[test]
    fn acquire_results_are_classified() {
        assert_eq!(
            classify_acquire(Ok((2, false))).unwrap(),
            AcquireStatus::Acquired {
                index: 2,
                suboptimal: false
            }
        );
        assert_eq!(
            classify_acquire(Ok((0, true))).unwrap(),
            AcquireStatus::Acquired {
                index: 0,
                suboptimal: true
            }
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::TIMEOUT)).unwrap(),
            AcquireStatus::SkipFrame
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::NOT_READY)).unwrap(),
            AcquireStatus::SkipFrame
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            AcquireStatus::Retry
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST))
                .unwrap_err()
                .vk_result(),
            Some(vk::Result::ERROR_DEVICE_LOST)
        );
    }

    #[test]
    fn present_results_are_classified() {
        assert_eq!(classify_present(Ok(false)).unwrap(), PresentStatus::Presented);
        assert_eq!(classify_present(Ok(true)).unwrap(), PresentStatus::Stale);
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentStatus::Stale
        );
        assert!(classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)).is_err());
    }
}
