use ash::vk;

///Classes of device memory an allocation can be placed in.
///
/// The declaration order is also the fallback order. If no memory type of the requested class is allowed for a resource,
/// the next class is tried. Host visible classes therefore never fall back to memory the host can't see.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MemoryUsage {
    ///Lazily allocated device memory, usually for transient attachments.
    GpuLazy,
    ///Device local memory that is not visible to the host.
    GpuOnly,
    ///Device local memory that is mapped into host memory.
    GpuHostVisible,
    ///Host memory that is visible to the device.
    HostVisible,
}

impl MemoryUsage {
    pub const ALL: [MemoryUsage; 4] = [
        MemoryUsage::GpuLazy,
        MemoryUsage::GpuOnly,
        MemoryUsage::GpuHostVisible,
        MemoryUsage::HostVisible,
    ];

    //Most specific first, so that e.g. device local + host visible memory is not classified as GpuOnly.
    const CLASSIFY_ORDER: [MemoryUsage; 4] = [
        MemoryUsage::GpuLazy,
        MemoryUsage::GpuHostVisible,
        MemoryUsage::GpuOnly,
        MemoryUsage::HostVisible,
    ];

    ///Property flags a memory type must have to be of this class.
    pub fn required_flags(&self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryUsage::GpuLazy => {
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::LAZILY_ALLOCATED
            }
            MemoryUsage::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryUsage::GpuHostVisible => {
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryUsage::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }

    ///True for classes whose memory blocks are persistently mapped.
    pub fn is_host_visible(&self) -> bool {
        matches!(self, MemoryUsage::GpuHostVisible | MemoryUsage::HostVisible)
    }

    ///Returns `self` followed by all classes after it in fallback order.
    pub fn with_fallbacks(&self) -> &'static [MemoryUsage] {
        let all: &'static [MemoryUsage; 4] = &Self::ALL;
        let start = all.iter().position(|u| u == self).unwrap_or(all.len());
        &all[start..]
    }

    ///Finds the most specific class the `flags` satisfy. Protected memory is never classified.
    pub fn classify(flags: vk::MemoryPropertyFlags) -> Option<MemoryUsage> {
        if flags.contains(vk::MemoryPropertyFlags::PROTECTED) {
            return None;
        }
        Self::CLASSIFY_ORDER
            .into_iter()
            .find(|usage| flags.contains(usage.required_flags()))
    }
}

///A Vulkan memory type the allocator can use, together with its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeEntry {
    pub usage: MemoryUsage,
    ///Index of the memory type in [PhysicalDeviceMemoryProperties](ash::vk::PhysicalDeviceMemoryProperties).
    pub type_index: u32,
    pub heap_index: u32,
    pub flags: vk::MemoryPropertyFlags,
}

///All classified memory types of a physical device. Entries are addressed by their *slot*, the position in this table.
#[derive(Debug, Clone, Default)]
pub struct MemoryTypeTable {
    entries: Vec<MemoryTypeEntry>,
}

impl MemoryTypeTable {
    pub fn new(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let count = (properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);
        let entries = properties.memory_types[..count]
            .iter()
            .enumerate()
            .filter_map(|(idx, ty)| {
                let usage = MemoryUsage::classify(ty.property_flags)?;
                Some(MemoryTypeEntry {
                    usage,
                    type_index: idx as u32,
                    heap_index: ty.heap_index,
                    flags: ty.property_flags,
                })
            })
            .collect::<Vec<_>>();

        #[cfg(feature = "logging")]
        for e in &entries {
            log::trace!(
                "Memory type {} (heap {}) {:?} classified as {:?}",
                e.type_index,
                e.heap_index,
                e.flags,
                e.usage
            );
        }

        MemoryTypeTable { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, slot: usize) -> &MemoryTypeEntry {
        &self.entries[slot]
    }

    pub fn entries(&self) -> &[MemoryTypeEntry] {
        &self.entries
    }

    ///Returns the slot of the best memory type for `usage` whose type index is set in `memory_type_bits`.
    pub fn find(&self, usage: MemoryUsage, memory_type_bits: u32) -> Option<usize> {
        usage.with_fallbacks().iter().find_map(|candidate| {
            self.entries.iter().position(|e| {
                e.usage == *candidate
                    && e.type_index < 32
                    && (memory_type_bits & (1 << e.type_index)) != 0
            })
        })
    }
}
