use crate::device::AshDevice;
use crate::{
    BufferHandle, ConfigError, DescriptorsKey, ImageHandle, Result, ResultExt, SamplerKey,
};
use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub count: u32,
}

/// One descriptor type and stage mask shared by every binding of the layout.
#[derive(Debug, Clone)]
pub struct DescriptorLayoutDesc {
    pub name: String,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorLayoutDesc {
    pub fn new(descriptor_type: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        Self {
            name: String::new(),
            descriptor_type,
            stages,
            bindings: Vec::new(),
        }
    }

    pub fn with_binding(mut self, binding: u32, count: u32) -> Self {
        self.bindings.push(DescriptorBinding { binding, count });
        self
    }

    fn binding(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|entry| entry.binding == binding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorLayoutHandle {
    pub descriptors: DescriptorsKey,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle {
    pub descriptors: DescriptorsKey,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorResources {
    Buffers(Vec<BufferHandle>),
    Images {
        images: Vec<ImageHandle>,
        sampler: Option<SamplerKey>,
    },
}

impl DescriptorResources {
    fn len(&self) -> usize {
        match self {
            DescriptorResources::Buffers(buffers) => buffers.len(),
            DescriptorResources::Images { images, .. } => images.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub binding: u32,
    pub resources: DescriptorResources,
}

#[derive(Debug, Clone)]
pub struct DescriptorSetDesc {
    pub name: String,
    layout: u32,
    entries: Vec<DescriptorEntry>,
}

impl DescriptorSetDesc {
    pub fn entries(&self) -> &[DescriptorEntry] {
        &self.entries
    }
}

fn is_buffer_type(descriptor_type: vk::DescriptorType) -> bool {
    matches!(
        descriptor_type,
        vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
    )
}

fn is_image_type(descriptor_type: vk::DescriptorType) -> bool {
    matches!(
        descriptor_type,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT
    )
}

fn image_layout(descriptor_type: vk::DescriptorType) -> vk::ImageLayout {
    match descriptor_type {
        vk::DescriptorType::STORAGE_IMAGE => vk::ImageLayout::GENERAL,
        _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

fn record_entry(
    layouts: &[DescriptorLayoutDesc],
    set: &mut DescriptorSetDesc,
    entry: DescriptorEntry,
) -> Result<()> {
    let layout = &layouts[set.layout as usize];
    let binding = layout
        .binding(entry.binding)
        .ok_or(ConfigError::UnknownDescriptorBinding {
            binding: entry.binding,
        })?;

    if binding.count as usize != entry.resources.len() {
        return Err(ConfigError::DescriptorCountMismatch {
            binding: entry.binding,
            expected: binding.count,
            actual: entry.resources.len(),
        }
        .into());
    }

    let kind_matches = match &entry.resources {
        DescriptorResources::Buffers(_) => is_buffer_type(layout.descriptor_type),
        DescriptorResources::Images { sampler, .. } => {
            is_image_type(layout.descriptor_type)
                && (sampler.is_some()
                    || layout.descriptor_type != vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        }
    };
    if !kind_matches {
        return Err(ConfigError::DescriptorKindMismatch {
            binding: entry.binding,
            descriptor_type: layout.descriptor_type,
        }
        .into());
    }

    match set
        .entries
        .iter_mut()
        .find(|existing| existing.binding == entry.binding)
    {
        Some(existing) => *existing = entry,
        None => set.entries.push(entry),
    }
    Ok(())
}

/// Declared layouts and sets sharing one descriptor pool.
#[derive(Debug, Clone, Default)]
pub struct DescriptorsDesc {
    key: DescriptorsKey,
    pub name: String,
    layouts: Vec<DescriptorLayoutDesc>,
    sets: Vec<DescriptorSetDesc>,
}

impl DescriptorsDesc {
    pub(crate) fn new(key: DescriptorsKey, name: String) -> Self {
        Self {
            key,
            name,
            ..Default::default()
        }
    }

    pub fn key(&self) -> DescriptorsKey {
        self.key
    }

    pub fn add_layout(&mut self, layout: DescriptorLayoutDesc) -> DescriptorLayoutHandle {
        self.layouts.push(layout);
        DescriptorLayoutHandle {
            descriptors: self.key,
            index: self.layouts.len() as u32 - 1,
        }
    }

    pub fn add_set(&mut self, layout: DescriptorLayoutHandle) -> Result<DescriptorSetHandle> {
        if layout.descriptors != self.key || layout.index as usize >= self.layouts.len() {
            return Err(ConfigError::UnknownHandle("descriptor layout").into());
        }
        self.sets.push(DescriptorSetDesc {
            name: String::new(),
            layout: layout.index,
            entries: Vec::new(),
        });
        Ok(DescriptorSetHandle {
            descriptors: self.key,
            index: self.sets.len() as u32 - 1,
        })
    }

    pub fn add_buffer_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        buffers: &[BufferHandle],
    ) -> Result<()> {
        self.add_descriptor(
            set,
            DescriptorEntry {
                binding,
                resources: DescriptorResources::Buffers(buffers.to_vec()),
            },
        )
    }

    pub fn add_image_descriptor(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        images: &[ImageHandle],
        sampler: Option<SamplerKey>,
    ) -> Result<()> {
        self.add_descriptor(
            set,
            DescriptorEntry {
                binding,
                resources: DescriptorResources::Images {
                    images: images.to_vec(),
                    sampler,
                },
            },
        )
    }

    pub fn add_descriptor(&mut self, set: DescriptorSetHandle, entry: DescriptorEntry) -> Result<()> {
        if set.descriptors != self.key {
            return Err(ConfigError::UnknownHandle("descriptor set").into());
        }
        let set = self
            .sets
            .get_mut(set.index as usize)
            .ok_or(ConfigError::UnknownHandle("descriptor set"))?;
        record_entry(&self.layouts, set, entry)
    }

    pub fn layouts(&self) -> &[DescriptorLayoutDesc] {
        &self.layouts
    }

    pub fn sets(&self) -> &[DescriptorSetDesc] {
        &self.sets
    }

    pub fn set_mut(&mut self, set: DescriptorSetHandle) -> Option<&mut DescriptorSetDesc> {
        if set.descriptors != self.key {
            return None;
        }
        self.sets.get_mut(set.index as usize)
    }

    /// Pool sizes per descriptor type. A layout counts once per set using it, at least once.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for (index, layout) in self.layouts.iter().enumerate() {
            let users = self
                .sets
                .iter()
                .filter(|set| set.layout as usize == index)
                .count()
                .max(1) as u32;
            let count: u32 = layout.bindings.iter().map(|binding| binding.count).sum();
            if count == 0 {
                continue;
            }

            match sizes
                .iter_mut()
                .find(|size| size.ty == layout.descriptor_type)
            {
                Some(size) => size.descriptor_count += count * users,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: layout.descriptor_type,
                    descriptor_count: count * users,
                }),
            }
        }
        sizes
    }
}

/// Resolves declared handles to native ones when writing descriptors.
pub(crate) trait DescriptorResourceLookup {
    fn buffer(&self, handle: BufferHandle) -> Option<(vk::Buffer, vk::DeviceSize)>;
    fn image_view(&self, handle: ImageHandle) -> Option<vk::ImageView>;
    fn sampler(&self, key: SamplerKey) -> Option<vk::Sampler>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriteInfos {
    Buffers(Vec<(vk::Buffer, vk::DeviceSize)>),
    Images(Vec<(vk::ImageView, vk::Sampler, vk::ImageLayout)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DescriptorWrite {
    pub(crate) set: vk::DescriptorSet,
    pub(crate) binding: u32,
    pub(crate) descriptor_type: vk::DescriptorType,
    pub(crate) infos: WriteInfos,
}

pub(crate) fn build_write_batch(
    declaration: &DescriptorsDesc,
    native_sets: &[vk::DescriptorSet],
    lookup: &impl DescriptorResourceLookup,
) -> Result<Vec<DescriptorWrite>> {
    let mut writes = Vec::new();
    for (set, &native_set) in declaration.sets.iter().zip(native_sets) {
        let descriptor_type = declaration.layouts[set.layout as usize].descriptor_type;
        for entry in set.entries.iter() {
            let infos = match &entry.resources {
                DescriptorResources::Buffers(buffers) => WriteInfos::Buffers(
                    buffers
                        .iter()
                        .map(|&buffer| {
                            lookup
                                .buffer(buffer)
                                .ok_or(ConfigError::UnknownHandle("buffer"))
                        })
                        .collect::<std::result::Result<_, _>>()?,
                ),
                DescriptorResources::Images { images, sampler } => {
                    let sampler = match sampler {
                        Some(key) => lookup
                            .sampler(*key)
                            .ok_or(ConfigError::UnknownHandle("sampler"))?,
                        None => vk::Sampler::null(),
                    };
                    WriteInfos::Images(
                        images
                            .iter()
                            .map(|&image| {
                                lookup
                                    .image_view(image)
                                    .map(|view| (view, sampler, image_layout(descriptor_type)))
                                    .ok_or(ConfigError::UnknownHandle("image"))
                            })
                            .collect::<std::result::Result<_, _>>()?,
                    )
                }
            };

            writes.push(DescriptorWrite {
                set: native_set,
                binding: entry.binding,
                descriptor_type,
                infos,
            });
        }
    }
    Ok(writes)
}

fn submit_write_batch(device: &AshDevice, writes: &[DescriptorWrite]) {
    if writes.is_empty() {
        return;
    }

    // The info arrays must outlive the update call since the writes point into them
    let buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = writes
        .iter()
        .map(|write| match &write.infos {
            WriteInfos::Buffers(buffers) => buffers
                .iter()
                .map(|&(buffer, range)| vk::DescriptorBufferInfo {
                    buffer,
                    offset: 0,
                    range,
                })
                .collect(),
            WriteInfos::Images(_) => Vec::new(),
        })
        .collect();
    let image_infos: Vec<Vec<vk::DescriptorImageInfo>> = writes
        .iter()
        .map(|write| match &write.infos {
            WriteInfos::Images(images) => images
                .iter()
                .map(|&(image_view, sampler, image_layout)| vk::DescriptorImageInfo {
                    sampler,
                    image_view,
                    image_layout,
                })
                .collect(),
            WriteInfos::Buffers(_) => Vec::new(),
        })
        .collect();

    let native_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .enumerate()
        .map(|(index, write)| {
            let builder = vk::WriteDescriptorSet::builder()
                .dst_set(write.set)
                .dst_binding(write.binding)
                .dst_array_element(0)
                .descriptor_type(write.descriptor_type);
            match write.infos {
                WriteInfos::Buffers(_) => builder.buffer_info(&buffer_infos[index]).build(),
                WriteInfos::Images(_) => builder.image_info(&image_infos[index]).build(),
            }
        })
        .collect();

    unsafe { device.core.update_descriptor_sets(&native_writes, &[]) };
}

pub struct Descriptors {
    device: Arc<AshDevice>,
    declaration: DescriptorsDesc,
    pool: vk::DescriptorPool,
    layouts: Vec<vk::DescriptorSetLayout>,
    sets: Vec<vk::DescriptorSet>,
}

impl Descriptors {
    pub(crate) fn init(
        device: &Arc<AshDevice>,
        declaration: DescriptorsDesc,
        lookup: &impl DescriptorResourceLookup,
    ) -> Result<Self> {
        let mut descriptors = Self {
            device: device.clone(),
            pool: vk::DescriptorPool::null(),
            layouts: Vec::with_capacity(declaration.layouts.len()),
            sets: Vec::new(),
            declaration,
        };

        for layout in descriptors.declaration.layouts.iter() {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout
                .bindings
                .iter()
                .map(|binding| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(binding.binding)
                        .descriptor_type(layout.descriptor_type)
                        .descriptor_count(binding.count)
                        .stage_flags(layout.stages)
                        .build()
                })
                .collect();
            let handle = unsafe {
                device.core.create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings),
                    None,
                )
            }
            .with_context(|| format!("vkCreateDescriptorSetLayout {}", layout.name))?;
            device.set_object_name(handle, &layout.name);
            descriptors.layouts.push(handle);
        }

        let pool_sizes = descriptors.declaration.pool_sizes();
        if !descriptors.declaration.sets.is_empty() && !pool_sizes.is_empty() {
            descriptors.pool = unsafe {
                device.core.create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::builder()
                        .max_sets(descriptors.declaration.sets.len() as u32)
                        .pool_sizes(&pool_sizes),
                    None,
                )
            }
            .context("vkCreateDescriptorPool")?;
            device.set_object_name(descriptors.pool, &descriptors.declaration.name);

            let set_layouts: Vec<vk::DescriptorSetLayout> = descriptors
                .declaration
                .sets
                .iter()
                .map(|set| descriptors.layouts[set.layout as usize])
                .collect();
            descriptors.sets = unsafe {
                device.core.allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::builder()
                        .descriptor_pool(descriptors.pool)
                        .set_layouts(&set_layouts),
                )
            }
            .context("vkAllocateDescriptorSets")?;

            for (set, &handle) in descriptors.declaration.sets.iter().zip(descriptors.sets.iter()) {
                device.set_object_name(handle, &set.name);
            }
        }

        descriptors.update(lookup)?;
        debug!(
            "Descriptors {}: {} layouts, {} sets",
            descriptors.declaration.name,
            descriptors.layouts.len(),
            descriptors.sets.len()
        );
        Ok(descriptors)
    }

    pub fn key(&self) -> DescriptorsKey {
        self.declaration.key
    }

    pub fn layout(&self, handle: DescriptorLayoutHandle) -> Option<vk::DescriptorSetLayout> {
        if handle.descriptors != self.key() {
            return None;
        }
        self.layouts.get(handle.index as usize).copied()
    }

    pub fn set(&self, handle: DescriptorSetHandle) -> Option<vk::DescriptorSet> {
        if handle.descriptors != self.key() {
            return None;
        }
        self.sets.get(handle.index as usize).copied()
    }

    pub fn declaration(&self) -> &DescriptorsDesc {
        &self.declaration
    }

    /// Records a write for the next `update`; validated the same way as before init.
    pub fn add_descriptor(&mut self, set: DescriptorSetHandle, entry: DescriptorEntry) -> Result<()> {
        self.declaration.add_descriptor(set, entry)
    }

    pub(crate) fn write_batch(
        &self,
        lookup: &impl DescriptorResourceLookup,
    ) -> Result<Vec<DescriptorWrite>> {
        build_write_batch(&self.declaration, &self.sets, lookup)
    }

    /// Writes every recorded entry in a single native update.
    pub(crate) fn update(&mut self, lookup: &impl DescriptorResourceLookup) -> Result<()> {
        let writes = self
            .write_batch(lookup)
            .with_context(|| format!("Descriptors {} update", self.declaration.name))?;
        submit_write_batch(&self.device, &writes);
        trace!(
            "Descriptors {}: wrote {} bindings",
            self.declaration.name,
            writes.len()
        );
        Ok(())
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        unsafe {
            if self.pool != vk::DescriptorPool::null() {
                self.device.core.destroy_descriptor_pool(self.pool, None);
            }
            for &layout in self.layouts.iter() {
                self.device.core.destroy_descriptor_set_layout(layout, None);
            }
        }
        trace!("Destroy Descriptors {}", self.declaration.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use slotmap::SlotMap;

    struct FakeResources {
        memory: crate::MemoryKey,
        sampler: SamplerKey,
    }

    impl DescriptorResourceLookup for FakeResources {
        fn buffer(&self, handle: BufferHandle) -> Option<(vk::Buffer, vk::DeviceSize)> {
            (handle.memory == self.memory)
                .then(|| (vk::Buffer::from_raw(100 + handle.index as u64), 256))
        }

        fn image_view(&self, handle: ImageHandle) -> Option<vk::ImageView> {
            (handle.memory == self.memory)
                .then(|| vk::ImageView::from_raw(200 + handle.index as u64))
        }

        fn sampler(&self, key: SamplerKey) -> Option<vk::Sampler> {
            (key == self.sampler).then(|| vk::Sampler::from_raw(300))
        }
    }

    fn fixture() -> (DescriptorsDesc, FakeResources, Vec<BufferHandle>, Vec<ImageHandle>) {
        let mut descriptor_keys: SlotMap<DescriptorsKey, ()> = SlotMap::with_key();
        let mut memory_keys: SlotMap<crate::MemoryKey, ()> = SlotMap::with_key();
        let mut sampler_keys: SlotMap<SamplerKey, ()> = SlotMap::with_key();

        let memory = memory_keys.insert(());
        let resources = FakeResources {
            memory,
            sampler: sampler_keys.insert(()),
        };
        let buffers = (0..3)
            .map(|index| BufferHandle { memory, index })
            .collect();
        let images = (0..2).map(|index| ImageHandle { memory, index }).collect();

        (
            DescriptorsDesc::new(descriptor_keys.insert(()), String::from("test")),
            resources,
            buffers,
            images,
        )
    }

    #[test]
    fn descriptor_counts_are_validated_when_added() {
        let (mut descriptors, _, buffers, _) = fixture();
        let layout = descriptors.add_layout(
            DescriptorLayoutDesc::new(
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .with_binding(0, 2),
        );
        let set = descriptors.add_set(layout).unwrap();

        let error = descriptors
            .add_buffer_descriptor(set, 0, &buffers[..1])
            .unwrap_err();
        assert_eq!(
            error.config(),
            Some(&ConfigError::DescriptorCountMismatch {
                binding: 0,
                expected: 2,
                actual: 1
            })
        );

        let error = descriptors
            .add_buffer_descriptor(set, 4, &buffers[..2])
            .unwrap_err();
        assert_eq!(
            error.config(),
            Some(&ConfigError::UnknownDescriptorBinding { binding: 4 })
        );

        descriptors
            .add_buffer_descriptor(set, 0, &buffers[..2])
            .unwrap();
        assert_eq!(descriptors.sets()[0].entries().len(), 1);
    }

    #[test]
    fn resource_kind_must_match_layout() {
        let (mut descriptors, resources, buffers, images) = fixture();
        let layout = descriptors.add_layout(
            DescriptorLayoutDesc::new(
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .with_binding(1, 1),
        );
        let set = descriptors.add_set(layout).unwrap();

        let kind_mismatch = Some(ConfigError::DescriptorKindMismatch {
            binding: 1,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        });
        assert_eq!(
            descriptors
                .add_buffer_descriptor(set, 1, &buffers[..1])
                .unwrap_err()
                .config()
                .cloned(),
            kind_mismatch
        );
        assert_eq!(
            descriptors
                .add_image_descriptor(set, 1, &images[..1], None)
                .unwrap_err()
                .config()
                .cloned(),
            kind_mismatch
        );
        descriptors
            .add_image_descriptor(set, 1, &images[..1], Some(resources.sampler))
            .unwrap();
    }

    #[test]
    fn pool_is_sized_from_every_layout() {
        let (mut descriptors, _, _, _) = fixture();
        let uniforms = descriptors.add_layout(
            DescriptorLayoutDesc::new(
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .with_binding(0, 1)
            .with_binding(1, 3),
        );
        descriptors.add_layout(
            DescriptorLayoutDesc::new(
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .with_binding(0, 2),
        );
        descriptors.add_layout(
            DescriptorLayoutDesc::new(
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .with_binding(0, 1),
        );
        descriptors.add_set(uniforms).unwrap();
        descriptors.add_set(uniforms).unwrap();

        let sizes: Vec<(vk::DescriptorType, u32)> = descriptors
            .pool_sizes()
            .iter()
            .map(|size| (size.ty, size.descriptor_count))
            .collect();
        assert_eq!(
            sizes,
            vec![
                (vk::DescriptorType::UNIFORM_BUFFER, 4 * 2 + 1),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2),
            ]
        );
    }

    #[test]
    fn write_batch_is_idempotent() {
        let (mut descriptors, resources, buffers, images) = fixture();
        let uniforms = descriptors.add_layout(
            DescriptorLayoutDesc::new(
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .with_binding(0, 1)
            .with_binding(2, 2),
        );
        let textures = descriptors.add_layout(
            DescriptorLayoutDesc::new(
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .with_binding(0, 2),
        );
        let uniform_set = descriptors.add_set(uniforms).unwrap();
        let texture_set = descriptors.add_set(textures).unwrap();
        descriptors
            .add_buffer_descriptor(uniform_set, 0, &buffers[..1])
            .unwrap();
        descriptors
            .add_buffer_descriptor(uniform_set, 2, &buffers[1..3])
            .unwrap();
        descriptors
            .add_image_descriptor(texture_set, 0, &images, Some(resources.sampler))
            .unwrap();

        let native_sets = [vk::DescriptorSet::from_raw(1), vk::DescriptorSet::from_raw(2)];
        let first = build_write_batch(&descriptors, &native_sets, &resources).unwrap();
        let second = build_write_batch(&descriptors, &native_sets, &resources).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(
            first[2].infos,
            WriteInfos::Images(vec![
                (
                    vk::ImageView::from_raw(200),
                    vk::Sampler::from_raw(300),
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                ),
                (
                    vk::ImageView::from_raw(201),
                    vk::Sampler::from_raw(300),
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                ),
            ])
        );

        // Writing the same binding again replaces the entry instead of growing the batch
        descriptors
            .add_buffer_descriptor(uniform_set, 0, &buffers[2..3])
            .unwrap();
        let third = build_write_batch(&descriptors, &native_sets, &resources).unwrap();
        assert_eq!(third.len(), 3);
        assert_eq!(
            third[0].infos,
            WriteInfos::Buffers(vec![(vk::Buffer::from_raw(102), 256)])
        );
    }

    #[test]
    fn out_of_range_layout_is_rejected() {
        let (mut descriptors, _, _, _) = fixture();
        let layout = DescriptorLayoutHandle {
            descriptors: descriptors.key(),
            index: 3,
        };
        assert_eq!(
            descriptors.add_set(layout).unwrap_err().config(),
            Some(&ConfigError::UnknownHandle("descriptor layout"))
        );
    }
}
