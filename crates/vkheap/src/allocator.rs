//! ## Allocator
//!
//! In Vulkan the application itself is responsible for allocating memory. Allocating one `VkDeviceMemory` per
//! resource quickly hits the driver's allocation limit, so resources are usually sub-allocated from bigger blocks.
//!
//! vkheap provides a simple abstraction via the [Allocator] trait, and the default [BlockAllocator] implementation.
//! It manages blocks of device memory per memory type and resource kind. Allocations are carved out of each block's
//! free list, and freed ranges are merged with their neighbours again.
//!
//! Resources that are bigger than a block, or that the driver wants to live in their own memory, get a dedicated
//! allocation instead.

mod block_allocator;
pub use block_allocator::{
    AllocatorConfig, AllocatorReport, BlockAllocator, DedicatedTarget, MappedPtr,
    MemoryCapabilities, MemoryBlock, MemoryDevice, ResourceKind, ResourceRequirements,
};

mod free_list;
pub use free_list::{FreeList, FreeNodePool};

mod memory_types;
pub use memory_types::{MemoryTypeEntry, MemoryTypeTable, MemoryUsage};

use ash::vk;
use std::ptr::NonNull;

///Implemented for all managed allocations. Allows the [Image](crate::resources::Image) and [Buffer](crate::resources::Buffer) implementations to hide their allocator type.
pub trait AnonymAllocation {
    fn memory(&self) -> vk::DeviceMemory;
    fn offset(&self) -> u64;
    fn size(&self) -> u64;
    fn as_slice_ref(&self) -> Option<&[u8]>;
    fn as_slice_mut(&mut self) -> Option<&mut [u8]>;
}

impl<A: Allocator + Send + Sync + 'static> AnonymAllocation for ManagedAllocation<A> {
    fn memory(&self) -> vk::DeviceMemory {
        self.allocation
            .as_ref()
            .map(|a| a.memory())
            .unwrap_or(vk::DeviceMemory::null())
    }
    fn offset(&self) -> u64 {
        self.allocation.as_ref().map(|a| a.offset()).unwrap_or(0)
    }
    fn size(&self) -> u64 {
        self.allocation.as_ref().map(|a| a.size()).unwrap_or(0)
    }
    fn as_slice_ref(&self) -> Option<&[u8]> {
        self.allocation.as_ref()?.as_slice_ref()
    }
    fn as_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut()?.as_slice_mut()
    }
}

///An allocation that frees itself when dropped.
pub struct ManagedAllocation<A: Allocator + Send + Sync + 'static> {
    pub allocator: std::sync::Arc<std::sync::Mutex<A>>,
    pub allocation: Option<<A as Allocator>::Allocation>,
}

impl<A: Allocator + Send + Sync + 'static> ManagedAllocation<A> {
    ///Returns false if the allocation is for some reason invalid, aka. shouldn't be used.
    pub fn is_valid(&self) -> bool {
        self.allocation.is_some()
    }
}

impl<A: Allocator + Send + Sync + 'static> Drop for ManagedAllocation<A> {
    fn drop(&mut self) {
        //free self
        if let (Ok(lck), Some(allocation)) = (&mut self.allocator.lock(), self.allocation.take()) {
            if let Err(_e) = lck.free(allocation) {
                //NOTE: failed free happens "silently" as in, we don't panic. The allocator keeps its
                //      bookkeeping consistent and the range is simply lost until the block is dropped.
                #[cfg(feature = "logging")]
                log::error!("Freeing allocation failed with: {}", _e);
            }
        } else {
            #[cfg(feature = "logging")]
            log::warn!("Could not free managed allocation");
        }
    }
}

///Abstract allocation trait that allows finding the memory handle of an allocation, its offset on that memory,
/// and, if host visible, its mapped bytes.
///
/// # Safety
///
/// If `mapped_ptr` returns a pointer, it must point to `size` bytes that stay mapped for the lifetime of the allocation
/// and that are not handed out to any other allocation.
pub unsafe trait Allocation {
    fn memory(&self) -> vk::DeviceMemory;
    fn offset(&self) -> u64;
    fn size(&self) -> u64;
    ///Host pointer to the first byte of the allocation, if the memory is mapped.
    fn mapped_ptr(&self) -> Option<NonNull<u8>>;

    fn as_slice_ref(&self) -> Option<&[u8]> {
        let ptr = self.mapped_ptr()?;
        //Safety: guaranteed by the trait contract.
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size() as usize) })
    }

    fn as_slice_mut(&mut self) -> Option<&mut [u8]> {
        let ptr = self.mapped_ptr()?;
        //Safety: guaranteed by the trait contract, `&mut self` makes the access exclusive.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size() as usize) })
    }
}

///Trait that can be implemented by anything that can handle allocation for a initialized [Device](crate::context::Device).
pub trait Allocator {
    type Allocation: Allocation + Send + Sync + 'static;
    type AllocationError: std::error::Error + Send + Sync + 'static;

    ///Allocates memory for `buffer`. Does not bind it.
    fn allocate_buffer(
        &mut self,
        buffer: vk::Buffer,
        usage: MemoryUsage,
    ) -> Result<Self::Allocation, Self::AllocationError>;

    ///Allocates memory for `image`. Does not bind it.
    fn allocate_image(
        &mut self,
        image: vk::Image,
        usage: MemoryUsage,
    ) -> Result<Self::Allocation, Self::AllocationError>;

    ///Frees a allocation
    fn free(&mut self, allocation: Self::Allocation) -> Result<(), Self::AllocationError>;

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        allocation: &Self::Allocation,
    ) -> Result<(), Self::AllocationError>;

    fn bind_image_memory(
        &self,
        image: vk::Image,
        allocation: &Self::Allocation,
    ) -> Result<(), Self::AllocationError>;
}
