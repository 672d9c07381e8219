use crate::device::AshDevice;
use crate::{ConfigError, MemoryKey, Result, ResultExt, VulkanError};
use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle {
    pub memory: MemoryKey,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub memory: MemoryKey,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub name: String,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            format: vk::Format::R8G8B8A8_UNORM,
            aspect: vk::ImageAspectFlags::COLOR,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            mip_levels: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub usage: vk::BufferUsageFlags,
    pub size: vk::DeviceSize,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArenaSlot {
    Image(u32),
    Buffer(u32),
}

/// A declared arena: images and buffers sharing one allocation.
#[derive(Debug, Clone)]
pub struct MemoryDesc {
    key: MemoryKey,
    pub name: String,
    pub device_local: bool,
    images: Vec<ImageDesc>,
    buffers: Vec<BufferDesc>,
    slots: Vec<ArenaSlot>,
}

impl Default for MemoryDesc {
    fn default() -> Self {
        Self {
            key: MemoryKey::default(),
            name: String::new(),
            device_local: true,
            images: Vec::new(),
            buffers: Vec::new(),
            slots: Vec::new(),
        }
    }
}

impl MemoryDesc {
    pub(crate) fn new(key: MemoryKey, name: String) -> Self {
        Self {
            key,
            name,
            ..Default::default()
        }
    }

    pub fn key(&self) -> MemoryKey {
        self.key
    }

    pub fn add_image(&mut self, desc: ImageDesc) -> ImageHandle {
        let index = self.images.len() as u32;
        self.images.push(desc);
        self.slots.push(ArenaSlot::Image(index));
        ImageHandle {
            memory: self.key,
            index,
        }
    }

    pub fn add_images(&mut self, count: usize, desc: ImageDesc) -> Vec<ImageHandle> {
        (0..count).map(|_| self.add_image(desc.clone())).collect()
    }

    pub fn add_buffer(&mut self, desc: BufferDesc) -> BufferHandle {
        let index = self.buffers.len() as u32;
        self.buffers.push(desc);
        self.slots.push(ArenaSlot::Buffer(index));
        BufferHandle {
            memory: self.key,
            index,
        }
    }

    pub fn add_buffers(&mut self, count: usize, desc: BufferDesc) -> Vec<BufferHandle> {
        (0..count).map(|_| self.add_buffer(desc.clone())).collect()
    }

    pub fn image_mut(&mut self, handle: ImageHandle) -> Option<&mut ImageDesc> {
        if handle.memory != self.key {
            return None;
        }
        self.images.get_mut(handle.index as usize)
    }

    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Option<&mut BufferDesc> {
        if handle.memory != self.key {
            return None;
        }
        self.buffers.get_mut(handle.index as usize)
    }

    pub fn images(&self) -> &[ImageDesc] {
        &self.images
    }

    pub fn buffers(&self) -> &[BufferDesc] {
        &self.buffers
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Primary and deferred memory property masks.
    pub fn property_masks(&self) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
        if self.device_local {
            (
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::empty(),
            )
        } else {
            (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            )
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaLayout {
    /// Start of every resource, in declaration order.
    pub offsets: Vec<vk::DeviceSize>,
    pub size: vk::DeviceSize,
    pub memory_type_bits: u32,
}

fn align_up(offset: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    let alignment = alignment.max(1);
    (offset + alignment - 1) & !(alignment - 1)
}

/// Packs resources back to back, each at its own alignment.
pub fn pack_arena(requirements: &[vk::MemoryRequirements]) -> Result<ArenaLayout> {
    let mut offsets = Vec::with_capacity(requirements.len());
    let mut end = 0;
    let mut memory_type_bits = u32::MAX;

    for (resource, requirement) in requirements.iter().enumerate() {
        memory_type_bits &= requirement.memory_type_bits;
        if memory_type_bits == 0 {
            return Err(ConfigError::IncompatibleMemoryTypes { resource }.into());
        }

        let offset = align_up(end, requirement.alignment);
        offsets.push(offset);
        end = offset + requirement.size;
    }

    let size = match requirements.last() {
        Some(last) => align_up(end, last.alignment),
        None => 0,
    };

    Ok(ArenaLayout {
        offsets,
        size,
        memory_type_bits,
    })
}

/// Lowest memory type in `type_bits` with the primary properties, else with the deferred ones.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    primary: vk::MemoryPropertyFlags,
    deferred: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let memory_types =
        &memory_properties.memory_types[0..memory_properties.memory_type_count as usize];
    let find = |flags: vk::MemoryPropertyFlags| {
        memory_types
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags)
            })
            .map(|(index, _)| index as u32)
    };
    find(primary).or_else(|| find(deferred))
}

pub struct ArenaImage {
    pub(crate) handle: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) desc: ImageDesc,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
}

impl ArenaImage {
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }
}

pub struct ArenaBuffer {
    pub(crate) handle: vk::Buffer,
    pub(crate) desc: BufferDesc,
    offset: vk::DeviceSize,
}

impl ArenaBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }
}

/// A live arena. Its resource set and layout can't change, only the resource contents can.
pub struct Memory {
    device: Arc<AshDevice>,
    declaration: MemoryDesc,
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    host_visible: bool,
    host_coherent: bool,
    layout: ArenaLayout,
    images: Vec<ArenaImage>,
    buffers: Vec<ArenaBuffer>,
}

impl Memory {
    pub(crate) fn init(
        device: &Arc<AshDevice>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        declaration: MemoryDesc,
    ) -> Result<Self> {
        // Everything created so far is released by Drop if any step below fails
        let mut memory = Self {
            device: device.clone(),
            memory: vk::DeviceMemory::null(),
            memory_type_index: 0,
            host_visible: false,
            host_coherent: false,
            layout: ArenaLayout::default(),
            images: Vec::with_capacity(declaration.images.len()),
            buffers: Vec::with_capacity(declaration.buffers.len()),
            declaration,
        };

        if memory.declaration.is_empty() {
            debug!("Memory {} is empty", memory.declaration.name);
            return Ok(memory);
        }

        let mut requirements = Vec::with_capacity(memory.declaration.slots.len());
        for slot in memory.declaration.slots.iter() {
            match *slot {
                ArenaSlot::Image(index) => {
                    let desc = &memory.declaration.images[index as usize];
                    let handle = unsafe {
                        device.core.create_image(
                            &vk::ImageCreateInfo::builder()
                                .image_type(vk::ImageType::TYPE_2D)
                                .format(desc.format)
                                .extent(vk::Extent3D {
                                    width: desc.extent.width,
                                    height: desc.extent.height,
                                    depth: 1,
                                })
                                .mip_levels(desc.mip_levels)
                                .array_layers(1)
                                .samples(desc.samples)
                                .tiling(desc.tiling)
                                .usage(desc.usage)
                                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                                .initial_layout(vk::ImageLayout::UNDEFINED),
                            None,
                        )
                    }
                    .with_context(|| format!("vkCreateImage {}", desc.name))?;
                    let requirement = unsafe { device.core.get_image_memory_requirements(handle) };
                    memory.images.push(ArenaImage {
                        handle,
                        view: vk::ImageView::null(),
                        desc: desc.clone(),
                        offset: 0,
                        size: requirement.size,
                    });
                    requirements.push(requirement);
                }
                ArenaSlot::Buffer(index) => {
                    let desc = &memory.declaration.buffers[index as usize];
                    let handle = unsafe {
                        device.core.create_buffer(
                            &vk::BufferCreateInfo::builder()
                                .size(desc.size)
                                .usage(desc.usage)
                                .sharing_mode(vk::SharingMode::EXCLUSIVE),
                            None,
                        )
                    }
                    .with_context(|| format!("vkCreateBuffer {}", desc.name))?;
                    memory.buffers.push(ArenaBuffer {
                        handle,
                        desc: desc.clone(),
                        offset: 0,
                    });
                    requirements.push(unsafe { device.core.get_buffer_memory_requirements(handle) });
                }
            }
        }

        memory.layout = pack_arena(&requirements)?;

        let (primary, deferred) = memory.declaration.property_masks();
        memory.memory_type_index = find_memory_type(
            memory_properties,
            memory.layout.memory_type_bits,
            primary,
            deferred,
        )
        .ok_or(VulkanError::NoCompatibleMemoryType {
            type_bits: memory.layout.memory_type_bits,
        })?;

        let property_flags = memory_properties.memory_types
            [memory.memory_type_index as usize]
            .property_flags;
        memory.host_visible = property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        memory.host_coherent = property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT);

        memory.memory = unsafe {
            device.core.allocate_memory(
                &vk::MemoryAllocateInfo::builder()
                    .allocation_size(memory.layout.size)
                    .memory_type_index(memory.memory_type_index),
                None,
            )
        }
        .context("vkAllocateMemory")?;

        for (slot, &offset) in memory.declaration.slots.iter().zip(memory.layout.offsets.iter()) {
            match *slot {
                ArenaSlot::Image(index) => {
                    let image = &mut memory.images[index as usize];
                    image.offset = offset;
                    unsafe {
                        device
                            .core
                            .bind_image_memory(image.handle, memory.memory, offset)
                    }
                    .context("vkBindImageMemory")?;
                }
                ArenaSlot::Buffer(index) => {
                    let buffer = &mut memory.buffers[index as usize];
                    buffer.offset = offset;
                    unsafe {
                        device
                            .core
                            .bind_buffer_memory(buffer.handle, memory.memory, offset)
                    }
                    .context("vkBindBufferMemory")?;
                }
            }
        }

        for image in memory.images.iter_mut() {
            image.view = unsafe {
                device.core.create_image_view(
                    &vk::ImageViewCreateInfo::builder()
                        .image(image.handle)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(image.desc.format)
                        .components(vk::ComponentMapping::default())
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: image.desc.aspect,
                            base_mip_level: 0,
                            level_count: image.desc.mip_levels,
                            base_array_layer: 0,
                            layer_count: 1,
                        }),
                    None,
                )
            }
            .with_context(|| format!("vkCreateImageView {}", image.desc.name))?;
            device.set_object_name(image.handle, &image.desc.name);
        }

        for buffer in memory.buffers.iter() {
            device.set_object_name(buffer.handle, &buffer.desc.name);
        }
        device.set_object_name(memory.memory, &memory.declaration.name);

        debug!(
            "Memory {}: {} images, {} buffers, {} bytes in type {}",
            memory.declaration.name,
            memory.images.len(),
            memory.buffers.len(),
            memory.layout.size,
            memory.memory_type_index
        );
        Ok(memory)
    }

    /// Releases every native object and hands back the declaration.
    pub fn deinit(mut self) -> MemoryDesc {
        std::mem::take(&mut self.declaration)
    }

    pub fn key(&self) -> MemoryKey {
        self.declaration.key
    }

    pub fn declaration(&self) -> &MemoryDesc {
        &self.declaration
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn image(&self, handle: ImageHandle) -> Option<&ArenaImage> {
        if handle.memory != self.key() {
            return None;
        }
        self.images.get(handle.index as usize)
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&ArenaBuffer> {
        if handle.memory != self.key() {
            return None;
        }
        self.buffers.get(handle.index as usize)
    }

    pub fn copy_to_buffer(
        &self,
        handle: BufferHandle,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let buffer = self
            .buffer(handle)
            .ok_or(ConfigError::UnknownHandle("buffer"))?;
        self.write(
            handle.index as usize,
            buffer.offset,
            buffer.desc.size,
            offset,
            data,
        )
    }

    /// Only meaningful for linearly tiled images.
    pub fn copy_to_image(
        &self,
        handle: ImageHandle,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let image = self
            .image(handle)
            .ok_or(ConfigError::UnknownHandle("image"))?;
        self.write(handle.index as usize, image.offset, image.size, offset, data)
    }

    fn write(
        &self,
        index: usize,
        resource_offset: vk::DeviceSize,
        resource_size: vk::DeviceSize,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        if !self.host_visible {
            return Err(ConfigError::NotHostVisible { index }.into());
        }
        if offset + data.len() as vk::DeviceSize > resource_size {
            return Err(ConfigError::WriteOutOfBounds {
                offset,
                len: data.len(),
                size: resource_size,
            }
            .into());
        }

        unsafe {
            let mapped = self
                .device
                .core
                .map_memory(
                    self.memory,
                    0,
                    vk::WHOLE_SIZE,
                    vk::MemoryMapFlags::empty(),
                )
                .context("vkMapMemory")? as *mut u8;
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.add((resource_offset + offset) as usize),
                data.len(),
            );

            let flushed = if self.host_coherent {
                Ok(())
            } else {
                self.device.core.flush_mapped_memory_ranges(&[vk::MappedMemoryRange::builder()
                    .memory(self.memory)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build()])
            };
            self.device.core.unmap_memory(self.memory);
            flushed.context("vkFlushMappedMemoryRanges")?;
        }
        Ok(())
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            for image in self.images.iter() {
                if image.view != vk::ImageView::null() {
                    self.device.core.destroy_image_view(image.view, None);
                }
                self.device.core.destroy_image(image.handle, None);
            }
            for buffer in self.buffers.iter() {
                self.device.core.destroy_buffer(buffer.handle, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                self.device.core.free_memory(self.memory, None);
            }
        }
        trace!("Destroy Memory {}", self.declaration.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirement(size: u64, alignment: u64, memory_type_bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits,
        }
    }

    #[test]
    fn packs_at_each_alignment() {
        let layout = pack_arena(&[
            requirement(100, 256, 0b111),
            requirement(64, 64, 0b110),
            requirement(1000, 512, 0b011),
        ])
        .unwrap();

        assert_eq!(layout.offsets, vec![0, 128, 512]);
        assert_eq!(layout.size, 1536);
        assert_eq!(layout.memory_type_bits, 0b010);
    }

    #[test]
    fn packing_holds_for_generated_sequences() {
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..200 {
            let count = 1 + (next() % 12) as usize;
            let requirements: Vec<vk::MemoryRequirements> = (0..count)
                .map(|_| requirement(1 + next() % 70_000, 1 << (next() % 13), u32::MAX))
                .collect();

            let layout = pack_arena(&requirements).unwrap();
            assert_eq!(layout.offsets.len(), count);

            for (index, (offset, requirement)) in
                layout.offsets.iter().zip(requirements.iter()).enumerate()
            {
                assert_eq!(offset % requirement.alignment, 0);
                if index > 0 {
                    let previous = layout.offsets[index - 1] + requirements[index - 1].size;
                    assert!(*offset >= previous);
                    assert!(*offset > layout.offsets[index - 1]);
                }
            }

            let last = requirements[count - 1];
            let end = layout.offsets[count - 1] + last.size;
            assert_eq!(layout.size, align_up(end, last.alignment));
            assert!(layout.size >= end);
        }
    }

    #[test]
    fn disjoint_memory_types_fail() {
        let error = pack_arena(&[
            requirement(16, 16, 0b0001),
            requirement(16, 16, 0b0011),
            requirement(16, 16, 0b0100),
        ])
        .unwrap_err();
        assert_eq!(
            error.config(),
            Some(&ConfigError::IncompatibleMemoryTypes { resource: 2 })
        );
    }

    #[test]
    fn empty_arena_has_no_size() {
        let layout = pack_arena(&[]).unwrap();
        assert!(layout.offsets.is_empty());
        assert_eq!(layout.size, 0);
    }

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (index, &property_flags) in types.iter().enumerate() {
            properties.memory_types[index] = vk::MemoryType {
                property_flags,
                heap_index: 0,
            };
        }
        properties
    }

    #[test]
    fn memory_type_prefers_primary_then_deferred() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        let device_local = MemoryDesc::default().property_masks();
        assert_eq!(
            find_memory_type(&properties, 0b110, device_local.0, device_local.1),
            Some(1)
        );
        assert_eq!(
            find_memory_type(&properties, 0b100, device_local.0, device_local.1),
            Some(2)
        );
        // No device local type in the mask, the deferred "any" mask takes the lowest
        assert_eq!(
            find_memory_type(&properties, 0b001, device_local.0, device_local.1),
            Some(0)
        );

        let host = MemoryDesc {
            device_local: false,
            ..Default::default()
        }
        .property_masks();
        assert_eq!(find_memory_type(&properties, 0b111, host.0, host.1), Some(0));
        assert_eq!(find_memory_type(&properties, 0b010, host.0, host.1), None);
    }

    #[test]
    fn handles_are_stable_across_declaration() {
        let mut memory = MemoryDesc::default();
        let image = memory.add_image(ImageDesc::default());
        let buffers = memory.add_buffers(2, BufferDesc::default());
        let second_image = memory.add_image(ImageDesc::default());

        assert_eq!(image.index, 0);
        assert_eq!(second_image.index, 1);
        assert_eq!(buffers.iter().map(|buffer| buffer.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(
            memory.slots,
            vec![
                ArenaSlot::Image(0),
                ArenaSlot::Buffer(0),
                ArenaSlot::Buffer(1),
                ArenaSlot::Image(1)
            ]
        );

        memory.image_mut(second_image).unwrap().extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        assert_eq!(memory.images()[1].extent.width, 640);
    }
}
