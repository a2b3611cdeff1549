use std::{ffi::CStr, ptr::NonNull, sync::Arc};

use ahash::AHashMap;
use ash::vk;

use super::{
    Allocation, Allocator, FreeList, FreeNodePool, MemoryTypeTable, MemoryUsage,
};
use crate::{context::Device, error::AllocatorError};

///Host pointer into a persistently mapped memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

//Safety: the pointer is only an address into device memory that is mapped for the lifetime of its block.
//        Exclusive access to a range is governed by the allocation that owns the range.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.0
    }

    fn add(self, offset: u64) -> Self {
        //Safety: callers only offset into the mapped block.
        MappedPtr(unsafe { self.0.add(offset as usize) })
    }
}

///Buffers and images never share a memory block. This avoids having to respect `bufferImageGranularity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
}

impl ResourceKind {
    fn index(&self) -> usize {
        match self {
            ResourceKind::Buffer => 0,
            ResourceKind::Image => 1,
        }
    }
}

///The resource a dedicated allocation is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedicatedTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

impl DedicatedTarget {
    pub fn kind(&self) -> ResourceKind {
        match self {
            DedicatedTarget::Buffer(_) => ResourceKind::Buffer,
            DedicatedTarget::Image(_) => ResourceKind::Image,
        }
    }
}

///Memory requirements of a resource, including whether the driver asked for a dedicated allocation.
#[derive(Debug, Clone, Copy)]
pub struct ResourceRequirements {
    pub requirements: vk::MemoryRequirements,
    ///Set if the resource requires or prefers its own device memory.
    pub prefers_dedicated: bool,
}

///Memory related functionality that might only be available through extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryCapabilities {
    ///`VK_KHR_dedicated_allocation` (core in 1.1).
    pub dedicated_allocation: bool,
    ///`VK_KHR_bind_memory2` (core in 1.1).
    pub bind_memory2: bool,
}

impl MemoryCapabilities {
    pub fn detect(api_version: u32, enabled_extensions: &[&CStr]) -> Self {
        let core11 = api_version >= vk::API_VERSION_1_1;
        let has = |name: &CStr| enabled_extensions.contains(&name);

        MemoryCapabilities {
            dedicated_allocation: core11
                || (has(ash::khr::get_memory_requirements2::NAME)
                    && has(ash::khr::dedicated_allocation::NAME)),
            bind_memory2: core11 || has(ash::khr::bind_memory2::NAME),
        }
    }
}

///Device side operations the [BlockAllocator] needs. Implemented by [Device](crate::context::Device).
pub trait MemoryDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;
    fn memory_capabilities(&self) -> MemoryCapabilities;
    fn buffer_requirements(&self, buffer: vk::Buffer) -> ResourceRequirements;
    fn image_requirements(&self, image: vk::Image) -> ResourceRequirements;
    ///Allocates `size` bytes of memory type `memory_type_index`. If `dedicated` is set and dedicated allocations are
    /// supported, the memory is allocated for that resource only.
    fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<vk::DeviceMemory, vk::Result>;
    ///Maps the whole memory object.
    fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<u8>, vk::Result>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result>;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result>;
    ///Binds all `binds` with one `vkBindBufferMemory2` call. Only called if [MemoryCapabilities::bind_memory2] is set.
    fn bind_buffer_memory2(
        &self,
        binds: &[(vk::Buffer, vk::DeviceMemory, u64)],
    ) -> Result<(), vk::Result>;
    ///Binds all `binds` with one `vkBindImageMemory2` call. Only called if [MemoryCapabilities::bind_memory2] is set.
    fn bind_image_memory2(
        &self,
        binds: &[(vk::Image, vk::DeviceMemory, u64)],
    ) -> Result<(), vk::Result>;
}

///Sizes of the memory blocks the [BlockAllocator] requests from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    ///Block size for [GpuLazy](MemoryUsage::GpuLazy) and [GpuOnly](MemoryUsage::GpuOnly) memory.
    pub device_block_size: u64,
    ///Block size for the host visible classes.
    pub host_block_size: u64,
    ///Number of free-list nodes reserved up front. The node pool doubles whenever it runs out.
    pub initial_free_nodes: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            device_block_size: 64 << 20,
            host_block_size: 16 << 20,
            initial_free_nodes: 16,
        }
    }
}

impl AllocatorConfig {
    pub fn block_size(&self, usage: MemoryUsage) -> u64 {
        match usage {
            MemoryUsage::GpuLazy | MemoryUsage::GpuOnly => self.device_block_size,
            MemoryUsage::GpuHostVisible | MemoryUsage::HostVisible => self.host_block_size,
        }
    }
}

///A range of device memory handed out by the [BlockAllocator].
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    mapped: Option<MappedPtr>,
}

unsafe impl Allocation for MemoryBlock {
    fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }
    fn offset(&self) -> u64 {
        self.offset
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped.map(|p| p.as_ptr())
    }
}

///Usage statistics of a [BlockAllocator].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorReport {
    ///Number of shared blocks that sub-allocations are carved from.
    pub pooled_blocks: usize,
    pub dedicated_blocks: usize,
    ///Bytes of device memory owned by the allocator.
    pub total_bytes: u64,
    ///Bytes in the free lists of the shared blocks.
    pub free_bytes: u64,
    pub largest_free_range: u64,
    pub live_allocations: usize,
}

struct BlockInfo {
    free_list: FreeList,
    size: u64,
    mapped: Option<MappedPtr>,
    slot: usize,
    kind: ResourceKind,
    dedicated: bool,
}

///Sub-allocator that carves buffer and image allocations out of big device memory blocks.
///
/// Blocks are kept per memory type and [ResourceKind]. Allocations use the first block whose free list has a fitting range,
/// otherwise a new block is allocated. Empty blocks are kept around until [trim](BlockAllocator::trim) is called.
pub struct BlockAllocator<D: MemoryDevice = Device> {
    device: Arc<D>,
    config: AllocatorConfig,
    memory_types: MemoryTypeTable,
    capabilities: MemoryCapabilities,
    ///Shared blocks per memory type slot, indexed by [ResourceKind].
    pools: Vec<[Vec<vk::DeviceMemory>; 2]>,
    blocks: AHashMap<vk::DeviceMemory, BlockInfo>,
    nodes: FreeNodePool,
    live_allocations: usize,
}

impl<D: MemoryDevice> BlockAllocator<D> {
    pub fn new(device: Arc<D>, config: AllocatorConfig) -> Self {
        let memory_types = MemoryTypeTable::new(&device.memory_properties());
        let capabilities = device.memory_capabilities();

        #[cfg(feature = "logging")]
        log::info!(
            "Creating block allocator: {} usable memory types, {:?}, {:?}",
            memory_types.len(),
            capabilities,
            config
        );

        BlockAllocator {
            pools: (0..memory_types.len())
                .map(|_| [Vec::new(), Vec::new()])
                .collect(),
            device,
            config,
            memory_types,
            capabilities,
            blocks: AHashMap::default(),
            nodes: FreeNodePool::with_capacity(config.initial_free_nodes),
            live_allocations: 0,
        }
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn memory_types(&self) -> &MemoryTypeTable {
        &self.memory_types
    }

    pub fn is_dedicated_allocation_supported(&self) -> bool {
        self.capabilities.dedicated_allocation
    }

    pub fn is_bind_memory2_supported(&self) -> bool {
        self.capabilities.bind_memory2
    }

    ///Returns the Vulkan memory type index that would be used for `usage`, if any type in `memory_type_bits` fits.
    pub fn memory_type_index(&self, usage: MemoryUsage, memory_type_bits: u32) -> Option<u32> {
        self.memory_types
            .find(usage, memory_type_bits)
            .map(|slot| self.memory_types.entry(slot).type_index)
    }

    ///Allocates memory for a resource with the given requirements.
    pub fn allocate(
        &mut self,
        requirements: ResourceRequirements,
        usage: MemoryUsage,
        target: DedicatedTarget,
    ) -> Result<MemoryBlock, AllocatorError> {
        let vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits,
        } = requirements.requirements;
        let kind = target.kind();

        let slot = self.memory_types.find(usage, memory_type_bits).ok_or(
            AllocatorError::NoSuitableMemoryType {
                usage,
                memory_type_bits,
            },
        )?;
        let block_size = self.config.block_size(self.memory_types.entry(slot).usage);

        if requirements.prefers_dedicated || size >= block_size {
            let (memory, mapped) = self.create_block(size, 0, slot, kind, Some(target))?;
            self.live_allocations += 1;
            return Ok(MemoryBlock {
                memory,
                offset: 0,
                size,
                mapped,
            });
        }

        for memory in &self.pools[slot][kind.index()] {
            let Some(info) = self.blocks.get_mut(memory) else {
                continue;
            };
            if let Some(offset) = self.nodes.carve(&mut info.free_list, size, alignment) {
                self.live_allocations += 1;
                return Ok(MemoryBlock {
                    memory: *memory,
                    offset,
                    size,
                    mapped: info.mapped.map(|p| p.add(offset)),
                });
            }
        }

        //no block had room, the new block starts with the allocation at offset 0
        let (memory, mapped) = self.create_block(block_size, block_size - size, slot, kind, None)?;
        self.live_allocations += 1;
        Ok(MemoryBlock {
            memory,
            offset: 0,
            size,
            mapped,
        })
    }

    ///Allocates a device memory object of `size` bytes whose last `free_size` bytes are free.
    fn create_block(
        &mut self,
        size: u64,
        free_size: u64,
        slot: usize,
        kind: ResourceKind,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<(vk::DeviceMemory, Option<MappedPtr>), AllocatorError> {
        let entry = *self.memory_types.entry(slot);
        let memory = self
            .device
            .allocate_memory(size, entry.type_index, dedicated)?;

        let mapped = if entry.usage.is_host_visible() {
            match self.device.map_memory(memory) {
                Ok(ptr) => Some(MappedPtr(ptr)),
                Err(e) => {
                    self.device.free_memory(memory);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let free_list = self.nodes.list_with_range(size - free_size, free_size);
        self.blocks.insert(
            memory,
            BlockInfo {
                free_list,
                size,
                mapped,
                slot,
                kind,
                dedicated: dedicated.is_some(),
            },
        );
        if dedicated.is_none() {
            self.pools[slot][kind.index()].push(memory);
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "Allocated {} memory {:?}: {} bytes of type {} ({:?}){}",
            if dedicated.is_some() { "dedicated" } else { "block" },
            memory,
            size,
            entry.type_index,
            entry.usage,
            if mapped.is_some() { ", mapped" } else { "" }
        );

        Ok((memory, mapped))
    }

    fn release_block(&mut self, memory: vk::DeviceMemory) {
        let Some(mut info) = self.blocks.remove(&memory) else {
            return;
        };
        let pool = &mut self.pools[info.slot][info.kind.index()];
        if let Some(pos) = pool.iter().position(|m| *m == memory) {
            pool.remove(pos);
        }
        self.nodes.release_list(&mut info.free_list);

        if info.mapped.is_some() {
            self.device.unmap_memory(memory);
        }
        self.device.free_memory(memory);

        #[cfg(feature = "logging")]
        log::debug!("Released memory {:?} ({} bytes)", memory, info.size);
    }

    ///Frees `block`. Dedicated memory is returned to the device immediately, ranges of shared blocks go back into the
    /// block's free list.
    pub fn free_block(&mut self, block: MemoryBlock) -> Result<(), AllocatorError> {
        let info = self
            .blocks
            .get_mut(&block.memory)
            .ok_or(AllocatorError::UnknownMemory(block.memory))?;

        if info.dedicated {
            self.release_block(block.memory);
            self.live_allocations = self.live_allocations.saturating_sub(1);
            return Ok(());
        }

        let in_bounds = block
            .offset
            .checked_add(block.size)
            .is_some_and(|end| end <= info.size);
        if !in_bounds {
            return Err(AllocatorError::OutOfBounds {
                offset: block.offset,
                size: block.size,
                block_size: info.size,
            });
        }

        self.nodes
            .release_range(&mut info.free_list, block.offset, block.size)?;
        self.live_allocations = self.live_allocations.saturating_sub(1);
        Ok(())
    }

    ///Binds each buffer to its memory block. Uses a single `vkBindBufferMemory2` call if supported, otherwise binds one
    /// buffer after another and stops at the first error.
    pub fn bind_buffer_memories(
        &self,
        binds: &[(vk::Buffer, &MemoryBlock)],
    ) -> Result<(), AllocatorError> {
        if !self.capabilities.bind_memory2 {
            for (buffer, block) in binds {
                self.device
                    .bind_buffer_memory(*buffer, block.memory, block.offset)?;
            }
            return Ok(());
        }

        let binds = binds
            .iter()
            .map(|(buffer, block)| (*buffer, block.memory, block.offset))
            .collect::<Vec<_>>();
        self.device.bind_buffer_memory2(&binds)?;
        Ok(())
    }

    ///Binds each image to its memory block. Uses a single `vkBindImageMemory2` call if supported, otherwise binds one
    /// image after another and stops at the first error.
    pub fn bind_image_memories(
        &self,
        binds: &[(vk::Image, &MemoryBlock)],
    ) -> Result<(), AllocatorError> {
        if !self.capabilities.bind_memory2 {
            for (image, block) in binds {
                self.device
                    .bind_image_memory(*image, block.memory, block.offset)?;
            }
            return Ok(());
        }

        let binds = binds
            .iter()
            .map(|(image, block)| (*image, block.memory, block.offset))
            .collect::<Vec<_>>();
        self.device.bind_image_memory2(&binds)?;
        Ok(())
    }

    ///Looks up the host pointer of `block`. `None` if the block's memory is not mapped or not owned by this allocator.
    pub fn mapped_ptr(&self, block: &MemoryBlock) -> Option<NonNull<u8>> {
        self.blocks
            .get(&block.memory)?
            .mapped
            .map(|p| p.add(block.offset).as_ptr())
    }

    ///Frees all shared blocks that have no allocation left in them. Returns the number of freed blocks.
    pub fn trim(&mut self) -> usize {
        let empty = self
            .blocks
            .iter()
            .filter(|(_, info)| !info.dedicated && self.nodes.covers_whole(&info.free_list, info.size))
            .map(|(memory, _)| *memory)
            .collect::<Vec<_>>();

        for memory in &empty {
            self.release_block(*memory);
        }

        #[cfg(feature = "logging")]
        if !empty.is_empty() {
            log::info!("Trimmed {} empty memory blocks", empty.len());
        }

        empty.len()
    }

    pub fn report(&self) -> AllocatorReport {
        let mut report = AllocatorReport {
            live_allocations: self.live_allocations,
            ..Default::default()
        };
        for info in self.blocks.values() {
            report.total_bytes += info.size;
            if info.dedicated {
                report.dedicated_blocks += 1;
            } else {
                report.pooled_blocks += 1;
                report.free_bytes += self.nodes.free_bytes(&info.free_list);
                report.largest_free_range = report
                    .largest_free_range
                    .max(self.nodes.largest_range(&info.free_list));
            }
        }
        report
    }
}

impl<D: MemoryDevice> Drop for BlockAllocator<D> {
    fn drop(&mut self) {
        if self.live_allocations > 0 {
            #[cfg(feature = "logging")]
            log::warn!(
                "Dropping block allocator with {} live allocations",
                self.live_allocations
            );
        }

        for (memory, info) in self.blocks.drain() {
            if info.mapped.is_some() {
                self.device.unmap_memory(memory);
            }
            self.device.free_memory(memory);
        }
    }
}

impl<D: MemoryDevice + Send + Sync + 'static> Allocator for BlockAllocator<D> {
    type Allocation = MemoryBlock;
    type AllocationError = AllocatorError;

    fn allocate_buffer(
        &mut self,
        buffer: vk::Buffer,
        usage: MemoryUsage,
    ) -> Result<Self::Allocation, Self::AllocationError> {
        let requirements = self.device.buffer_requirements(buffer);
        self.allocate(requirements, usage, DedicatedTarget::Buffer(buffer))
    }

    fn allocate_image(
        &mut self,
        image: vk::Image,
        usage: MemoryUsage,
    ) -> Result<Self::Allocation, Self::AllocationError> {
        let requirements = self.device.image_requirements(image);
        self.allocate(requirements, usage, DedicatedTarget::Image(image))
    }

    fn free(&mut self, allocation: Self::Allocation) -> Result<(), Self::AllocationError> {
        self.free_block(allocation)
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        allocation: &Self::Allocation,
    ) -> Result<(), Self::AllocationError> {
        self.bind_buffer_memories(&[(buffer, allocation)])
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        allocation: &Self::Allocation,
    ) -> Result<(), Self::AllocationError> {
        self.bind_image_memories(&[(image, allocation)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::memory_types::tests::discrete_properties;
    use ash::vk::Handle;
    use static_assertions::assert_impl_all;
    use std::sync::Mutex;

    struct MockMemory {
        size: u64,
        type_index: u32,
        dedicated: Option<DedicatedTarget>,
        backing: Option<Vec<u8>>,
    }

    #[derive(Default)]
    struct MockState {
        next_handle: u64,
        live: AHashMap<u64, MockMemory>,
        requirements: AHashMap<u64, ResourceRequirements>,
        buffer_binds: Vec<(vk::Buffer, vk::DeviceMemory, u64)>,
        bind_calls: usize,
        bind2_calls: usize,
        fail_bind: Option<vk::Buffer>,
        fail_map: bool,
    }

    ///Device that hands out host memory, so that the allocator can run without a GPU.
    struct MockDevice {
        properties: vk::PhysicalDeviceMemoryProperties,
        capabilities: MemoryCapabilities,
        state: Mutex<MockState>,
    }

    impl MockDevice {
        fn new() -> Arc<Self> {
            Self::with_capabilities(MemoryCapabilities {
                dedicated_allocation: true,
                bind_memory2: true,
            })
        }

        fn with_capabilities(capabilities: MemoryCapabilities) -> Arc<Self> {
            Arc::new(MockDevice {
                properties: discrete_properties(),
                capabilities,
                state: Mutex::new(MockState {
                    next_handle: 1,
                    ..Default::default()
                }),
            })
        }

        fn handle(&self) -> u64 {
            let mut state = self.state.lock().unwrap();
            let h = state.next_handle;
            state.next_handle += 1;
            h
        }

        fn buffer(&self, size: u64, alignment: u64, prefers_dedicated: bool) -> vk::Buffer {
            let h = self.handle();
            self.state.lock().unwrap().requirements.insert(
                h,
                ResourceRequirements {
                    requirements: vk::MemoryRequirements {
                        size,
                        alignment,
                        memory_type_bits: 0b1111,
                    },
                    prefers_dedicated,
                },
            );
            vk::Buffer::from_raw(h)
        }

        fn image(&self, size: u64, alignment: u64) -> vk::Image {
            let h = self.handle();
            self.state.lock().unwrap().requirements.insert(
                h,
                ResourceRequirements {
                    requirements: vk::MemoryRequirements {
                        size,
                        alignment,
                        memory_type_bits: 0b1111,
                    },
                    prefers_dedicated: false,
                },
            );
            vk::Image::from_raw(h)
        }

        fn live_memories(&self) -> usize {
            self.state.lock().unwrap().live.len()
        }

        fn memory_size(&self, memory: vk::DeviceMemory) -> u64 {
            self.state.lock().unwrap().live[&memory.as_raw()].size
        }

        fn memory_dedicated(&self, memory: vk::DeviceMemory) -> Option<DedicatedTarget> {
            self.state.lock().unwrap().live[&memory.as_raw()].dedicated
        }

        fn memory_type(&self, memory: vk::DeviceMemory) -> u32 {
            self.state.lock().unwrap().live[&memory.as_raw()].type_index
        }

        fn backing_byte(&self, memory: vk::DeviceMemory, offset: usize) -> u8 {
            self.state.lock().unwrap().live[&memory.as_raw()]
                .backing
                .as_ref()
                .unwrap()[offset]
        }
    }

    impl MemoryDevice for MockDevice {
        fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
            self.properties
        }
        fn memory_capabilities(&self) -> MemoryCapabilities {
            self.capabilities
        }
        fn buffer_requirements(&self, buffer: vk::Buffer) -> ResourceRequirements {
            self.state.lock().unwrap().requirements[&buffer.as_raw()]
        }
        fn image_requirements(&self, image: vk::Image) -> ResourceRequirements {
            self.state.lock().unwrap().requirements[&image.as_raw()]
        }
        fn allocate_memory(
            &self,
            size: u64,
            memory_type_index: u32,
            dedicated: Option<DedicatedTarget>,
        ) -> Result<vk::DeviceMemory, vk::Result> {
            let h = self.handle();
            self.state.lock().unwrap().live.insert(
                h,
                MockMemory {
                    size,
                    type_index: memory_type_index,
                    dedicated,
                    backing: None,
                },
            );
            Ok(vk::DeviceMemory::from_raw(h))
        }
        fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<u8>, vk::Result> {
            let mut state = self.state.lock().unwrap();
            if state.fail_map {
                return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
            }
            let mem = state.live.get_mut(&memory.as_raw()).unwrap();
            let backing = mem.backing.insert(vec![0u8; mem.size as usize]);
            Ok(NonNull::new(backing.as_mut_ptr()).unwrap())
        }
        fn unmap_memory(&self, memory: vk::DeviceMemory) {
            let mut state = self.state.lock().unwrap();
            let mem = state.live.get_mut(&memory.as_raw()).unwrap();
            assert!(mem.backing.is_some(), "unmapping memory that is not mapped");
        }
        fn free_memory(&self, memory: vk::DeviceMemory) {
            let removed = self.state.lock().unwrap().live.remove(&memory.as_raw());
            assert!(removed.is_some(), "double free of device memory");
        }
        fn bind_buffer_memory(
            &self,
            buffer: vk::Buffer,
            memory: vk::DeviceMemory,
            offset: u64,
        ) -> Result<(), vk::Result> {
            let mut state = self.state.lock().unwrap();
            state.bind_calls += 1;
            if state.fail_bind == Some(buffer) {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            state.buffer_binds.push((buffer, memory, offset));
            Ok(())
        }
        fn bind_image_memory(
            &self,
            _image: vk::Image,
            _memory: vk::DeviceMemory,
            _offset: u64,
        ) -> Result<(), vk::Result> {
            self.state.lock().unwrap().bind_calls += 1;
            Ok(())
        }
        fn bind_buffer_memory2(
            &self,
            binds: &[(vk::Buffer, vk::DeviceMemory, u64)],
        ) -> Result<(), vk::Result> {
            let mut state = self.state.lock().unwrap();
            assert!(self.capabilities.bind_memory2, "bind2 used without support");
            state.bind2_calls += 1;
            state.buffer_binds.extend_from_slice(binds);
            Ok(())
        }
        fn bind_image_memory2(
            &self,
            _binds: &[(vk::Image, vk::DeviceMemory, u64)],
        ) -> Result<(), vk::Result> {
            assert!(self.capabilities.bind_memory2, "bind2 used without support");
            self.state.lock().unwrap().bind2_calls += 1;
            Ok(())
        }
    }

    fn small_config() -> AllocatorConfig {
        AllocatorConfig {
            device_block_size: 4096,
            host_block_size: 1024,
            initial_free_nodes: 2,
        }
    }

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(BlockAllocator: Send, Sync);
        assert_impl_all!(MemoryBlock: Send, Sync);
    }

    #[test]
    fn capabilities_from_version_and_extensions() {
        let none = MemoryCapabilities::detect(vk::API_VERSION_1_0, &[]);
        assert!(!none.dedicated_allocation);
        assert!(!none.bind_memory2);

        let core = MemoryCapabilities::detect(vk::API_VERSION_1_1, &[]);
        assert!(core.dedicated_allocation);
        assert!(core.bind_memory2);

        //dedicated allocation needs both extensions
        let partial = MemoryCapabilities::detect(
            vk::API_VERSION_1_0,
            &[ash::khr::dedicated_allocation::NAME, ash::khr::bind_memory2::NAME],
        );
        assert!(!partial.dedicated_allocation);
        assert!(partial.bind_memory2);

        let ext = MemoryCapabilities::detect(
            vk::API_VERSION_1_0,
            &[
                ash::khr::dedicated_allocation::NAME,
                ash::khr::get_memory_requirements2::NAME,
            ],
        );
        assert!(ext.dedicated_allocation);
        assert!(!ext.bind_memory2);
    }

    #[test]
    fn sub_allocations_share_a_block() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let a = alloc
            .allocate_buffer(device.buffer(100, 256, false), MemoryUsage::HostVisible)
            .unwrap();
        let b = alloc
            .allocate_buffer(device.buffer(100, 256, false), MemoryUsage::HostVisible)
            .unwrap();

        assert_eq!(a.memory, b.memory);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(device.live_memories(), 1);
        assert_eq!(device.memory_size(a.memory), 1024);
        //plain host memory is type 1 on the mock device
        assert_eq!(device.memory_type(a.memory), 1);

        let report = alloc.report();
        assert_eq!(report.pooled_blocks, 1);
        assert_eq!(report.live_allocations, 2);
        //[100, 256) padding plus [356, 1024)
        assert_eq!(report.free_bytes, 156 + 668);
        assert_eq!(report.largest_free_range, 668);

        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
        assert_eq!(alloc.report().free_bytes, 1024);
    }

    #[test]
    fn buffers_and_images_use_separate_blocks() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let buf = alloc
            .allocate_buffer(device.buffer(64, 16, false), MemoryUsage::GpuOnly)
            .unwrap();
        let img = alloc
            .allocate_image(device.image(64, 16), MemoryUsage::GpuOnly)
            .unwrap();

        assert_ne!(buf.memory, img.memory);
        assert_eq!(img.offset, 0);
        assert_eq!(alloc.report().pooled_blocks, 2);
    }

    #[test]
    fn full_block_causes_new_block() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let a = alloc
            .allocate_buffer(device.buffer(1000, 4, false), MemoryUsage::HostVisible)
            .unwrap();
        let b = alloc
            .allocate_buffer(device.buffer(100, 4, false), MemoryUsage::HostVisible)
            .unwrap();
        assert_ne!(a.memory, b.memory);
        assert_eq!(device.live_memories(), 2);

        //the rest of the first block can still be used
        let c = alloc
            .allocate_buffer(device.buffer(24, 4, false), MemoryUsage::HostVisible)
            .unwrap();
        assert_eq!(c.memory, a.memory);
        assert_eq!(c.offset, 1000);
    }

    #[test]
    fn oversized_resources_get_dedicated_memory() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let buffer = device.buffer(8192, 256, false);
        let block = alloc.allocate_buffer(buffer, MemoryUsage::GpuOnly).unwrap();
        assert_eq!(block.offset, 0);
        assert_eq!(device.memory_size(block.memory), 8192);
        assert_eq!(
            device.memory_dedicated(block.memory),
            Some(DedicatedTarget::Buffer(buffer))
        );
        assert_eq!(alloc.report().dedicated_blocks, 1);

        alloc.free(block).unwrap();
        assert_eq!(device.live_memories(), 0);
        assert_eq!(alloc.report(), AllocatorReport::default());
    }

    #[test]
    fn preferred_dedicated_is_honoured_for_small_resources() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let buffer = device.buffer(64, 4, true);
        let block = alloc
            .allocate_buffer(buffer, MemoryUsage::GpuHostVisible)
            .unwrap();
        assert_eq!(device.memory_size(block.memory), 64);
        assert_eq!(
            device.memory_dedicated(block.memory),
            Some(DedicatedTarget::Buffer(buffer))
        );
        //dedicated host visible memory is mapped as well
        assert!(block.mapped_ptr().is_some());
        alloc.free(block).unwrap();
    }

    #[test]
    fn no_suitable_memory_type() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let requirements = ResourceRequirements {
            requirements: vk::MemoryRequirements {
                size: 16,
                alignment: 4,
                memory_type_bits: 0b0001,
            },
            prefers_dedicated: false,
        };
        let err = alloc
            .allocate(
                requirements,
                MemoryUsage::HostVisible,
                DedicatedTarget::Buffer(vk::Buffer::null()),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            AllocatorError::NoSuitableMemoryType {
                usage: MemoryUsage::HostVisible,
                memory_type_bits: 0b0001
            }
        ));
        assert_eq!(alloc.memory_type_index(MemoryUsage::GpuOnly, 0b0001), Some(0));
        assert_eq!(alloc.memory_type_index(MemoryUsage::HostVisible, 0b0001), None);
    }

    #[test]
    fn mapped_memory_points_into_block() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let _first = alloc
            .allocate_buffer(device.buffer(128, 64, false), MemoryUsage::HostVisible)
            .unwrap();
        let mut second = alloc
            .allocate_buffer(device.buffer(16, 64, false), MemoryUsage::HostVisible)
            .unwrap();
        assert_eq!(second.offset, 128);
        assert_eq!(alloc.mapped_ptr(&second), second.mapped_ptr());

        second.as_slice_mut().unwrap().copy_from_slice(&[7u8; 16]);
        assert_eq!(device.backing_byte(second.memory, 128), 7);
        assert_eq!(device.backing_byte(second.memory, 127), 0);
        assert_eq!(second.as_slice_ref().unwrap(), &[7u8; 16]);

        let gpu = alloc
            .allocate_buffer(device.buffer(16, 4, false), MemoryUsage::GpuOnly)
            .unwrap();
        assert!(gpu.mapped_ptr().is_none());
        assert!(alloc.mapped_ptr(&gpu).is_none());
    }

    #[test]
    fn failed_map_releases_memory() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());
        device.state.lock().unwrap().fail_map = true;

        let err = alloc
            .allocate_buffer(device.buffer(16, 4, false), MemoryUsage::HostVisible)
            .unwrap_err();
        assert!(matches!(
            err,
            AllocatorError::VkError(vk::Result::ERROR_MEMORY_MAP_FAILED)
        ));
        assert_eq!(device.live_memories(), 0);
        assert_eq!(alloc.report(), AllocatorReport::default());
    }

    #[test]
    fn invalid_frees_are_rejected() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let block = alloc
            .allocate_buffer(device.buffer(64, 4, false), MemoryUsage::GpuOnly)
            .unwrap();
        let memory = block.memory;
        alloc.free(block).unwrap();

        let again = MemoryBlock {
            memory,
            offset: 0,
            size: 64,
            mapped: None,
        };
        assert!(matches!(
            alloc.free(again),
            Err(AllocatorError::FreeRange(_))
        ));

        let outside = MemoryBlock {
            memory,
            offset: 4090,
            size: 64,
            mapped: None,
        };
        assert!(matches!(
            alloc.free(outside),
            Err(AllocatorError::OutOfBounds {
                block_size: 4096,
                ..
            })
        ));

        let unknown = MemoryBlock {
            memory: vk::DeviceMemory::from_raw(9999),
            offset: 0,
            size: 1,
            mapped: None,
        };
        assert!(matches!(
            alloc.free(unknown),
            Err(AllocatorError::UnknownMemory(_))
        ));
    }

    #[test]
    fn trim_releases_only_empty_blocks() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let a = alloc
            .allocate_buffer(device.buffer(512, 4, false), MemoryUsage::GpuOnly)
            .unwrap();
        let b = alloc
            .allocate_image(device.image(512, 4), MemoryUsage::GpuOnly)
            .unwrap();
        assert_eq!(device.live_memories(), 2);

        alloc.free(a).unwrap();
        assert_eq!(alloc.trim(), 1);
        assert_eq!(device.live_memories(), 1);
        assert_eq!(alloc.trim(), 0);

        alloc.free(b).unwrap();
        assert_eq!(alloc.trim(), 1);
        assert_eq!(device.live_memories(), 0);

        //allocating again creates a fresh block
        let _c = alloc
            .allocate_buffer(device.buffer(16, 4, false), MemoryUsage::GpuOnly)
            .unwrap();
        assert_eq!(device.live_memories(), 1);
    }

    #[test]
    fn freed_ranges_are_reused() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let blocks = (0..4)
            .map(|_| {
                alloc
                    .allocate_buffer(device.buffer(256, 256, false), MemoryUsage::HostVisible)
                    .unwrap()
            })
            .collect::<Vec<_>>();
        let memory = blocks[0].memory;
        assert!(blocks.iter().all(|b| b.memory == memory));

        let mut blocks = blocks.into_iter();
        let _b0 = blocks.next().unwrap();
        alloc.free(blocks.next().unwrap()).unwrap();
        alloc.free(blocks.next().unwrap()).unwrap();

        //[256, 768) is free again and fits a 512 byte resource
        let big = alloc
            .allocate_buffer(device.buffer(512, 256, false), MemoryUsage::HostVisible)
            .unwrap();
        assert_eq!(big.memory, memory);
        assert_eq!(big.offset, 256);
        assert_eq!(device.live_memories(), 1);
    }

    #[test]
    fn binds_are_forwarded_in_one_call() {
        let device = MockDevice::new();
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let b0 = device.buffer(32, 4, false);
        let b1 = device.buffer(32, 4, false);
        let m0 = alloc.allocate_buffer(b0, MemoryUsage::GpuOnly).unwrap();
        let m1 = alloc.allocate_buffer(b1, MemoryUsage::GpuOnly).unwrap();

        alloc.bind_buffer_memories(&[(b0, &m0), (b1, &m1)]).unwrap();
        let state = device.state.lock().unwrap();
        assert_eq!(state.bind2_calls, 1);
        assert_eq!(state.bind_calls, 0);
        assert_eq!(
            state.buffer_binds,
            vec![(b0, m0.memory, 0), (b1, m1.memory, 32)]
        );
    }

    #[test]
    fn binds_one_by_one_without_bind_memory2() {
        let device = MockDevice::with_capabilities(MemoryCapabilities {
            dedicated_allocation: false,
            bind_memory2: false,
        });
        let mut alloc = BlockAllocator::new(device.clone(), small_config());
        assert!(!alloc.is_bind_memory2_supported());

        let b0 = device.buffer(32, 4, false);
        let b1 = device.buffer(32, 4, false);
        let m0 = alloc.allocate_buffer(b0, MemoryUsage::GpuOnly).unwrap();
        let m1 = alloc.allocate_buffer(b1, MemoryUsage::GpuOnly).unwrap();
        alloc.bind_buffer_memories(&[(b0, &m0), (b1, &m1)]).unwrap();

        let img = device.image(64, 4);
        let mi = alloc.allocate_image(img, MemoryUsage::GpuOnly).unwrap();
        alloc.bind_image_memories(&[(img, &mi)]).unwrap();

        let state = device.state.lock().unwrap();
        assert_eq!(state.bind_calls, 3);
        assert_eq!(state.bind2_calls, 0);
        assert_eq!(
            state.buffer_binds,
            vec![(b0, m0.memory, 0), (b1, m1.memory, 32)]
        );
    }

    #[test]
    fn failing_bind_stops_remaining_binds() {
        let device = MockDevice::with_capabilities(MemoryCapabilities {
            dedicated_allocation: false,
            bind_memory2: false,
        });
        let mut alloc = BlockAllocator::new(device.clone(), small_config());

        let buffers = (0..3)
            .map(|_| device.buffer(32, 4, false))
            .collect::<Vec<_>>();
        let blocks = buffers
            .iter()
            .map(|b| alloc.allocate_buffer(*b, MemoryUsage::GpuOnly).unwrap())
            .collect::<Vec<_>>();
        device.state.lock().unwrap().fail_bind = Some(buffers[1]);

        let binds = buffers.iter().copied().zip(blocks.iter()).collect::<Vec<_>>();
        let err = alloc.bind_buffer_memories(&binds).unwrap_err();
        assert!(matches!(
            err,
            AllocatorError::VkError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));

        let state = device.state.lock().unwrap();
        //third buffer is never bound
        assert_eq!(state.bind_calls, 2);
        assert_eq!(state.buffer_binds, vec![(buffers[0], blocks[0].memory, 0)]);
    }

    #[test]
    fn drop_frees_all_device_memory() {
        let device = MockDevice::new();
        {
            let mut alloc = BlockAllocator::new(device.clone(), small_config());
            let _a = alloc
                .allocate_buffer(device.buffer(16, 4, false), MemoryUsage::HostVisible)
                .unwrap();
            let _b = alloc
                .allocate_image(device.image(8192, 4), MemoryUsage::GpuOnly)
                .unwrap();
            assert_eq!(device.live_memories(), 2);
        }
        assert_eq!(device.live_memories(), 0);
    }

    #[test]
    fn managed_allocation_frees_on_drop() {
        use crate::allocator::{AnonymAllocation, ManagedAllocation};

        let device = MockDevice::new();
        let alloc = Arc::new(Mutex::new(BlockAllocator::new(
            device.clone(),
            small_config(),
        )));

        let block = alloc
            .lock()
            .unwrap()
            .allocate_buffer(device.buffer(16, 4, true), MemoryUsage::HostVisible)
            .unwrap();
        let mut managed: Box<dyn AnonymAllocation + Send + Sync> = Box::new(ManagedAllocation {
            allocator: alloc.clone(),
            allocation: Some(block),
        });
        assert_eq!(managed.size(), 16);
        managed.as_slice_mut().unwrap()[0] = 1;
        assert_eq!(device.live_memories(), 1);

        drop(managed);
        assert_eq!(device.live_memories(), 0);
        assert_eq!(alloc.lock().unwrap().report().live_allocations, 0);
    }
}
