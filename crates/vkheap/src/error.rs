use std::ffi::CString;

use ash::{LoadingError, vk};

use thiserror::Error;

use crate::allocator::MemoryUsage;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Extension {0} is not supported by device")]
    UnsupportedExtension(String),
    #[error("No physical device found. Is a Vulkan capable GPU and driver installed?")]
    NoPhysicalDevice,
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
}

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
    #[error("Failed to load Vulkan entry point: {0}")]
    EntryLoading(#[from] LoadingError),
    #[error("Instance layer {0:?} is not available")]
    MissingLayer(CString),
    #[error("Instance extension {0:?} is not available")]
    MissingExtension(CString),
}

///Errors of the free-range bookkeeping inside a single memory block.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeRangeError {
    #[error("Range [{offset}, {offset}+{size}) overlaps a range that is already free")]
    Overlap { offset: u64, size: u64 },
    #[error("Range [{offset}, {offset}+{size}) exceeds the address space")]
    Overflow { offset: u64, size: u64 },
}

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("No memory type for {usage:?} in type bits {memory_type_bits:#b}")]
    NoSuitableMemoryType {
        usage: MemoryUsage,
        memory_type_bits: u32,
    },
    #[error("Device memory {0:?} is not owned by this allocator")]
    UnknownMemory(vk::DeviceMemory),
    #[error("Range [{offset}, {offset}+{size}) exceeds memory block of size {block_size}")]
    OutOfBounds {
        offset: u64,
        size: u64,
        block_size: u64,
    },
    #[error("Free range error: {0}")]
    FreeRange(#[from] FreeRangeError),
    #[error("Allocator lock was poisoned")]
    Poisoned,
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
}

#[derive(Error, Debug)]
pub enum CommandBufferError {
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
    #[error("Command pool is not resettable")]
    PoolNotResetable,
    #[error("Submitting to queue failed with {0}")]
    SubmitFailed(vk::Result),
    #[error("Failed to allocate command buffer. Requested {count}, got {allocated}")]
    FailedToAllocate { allocated: usize, count: usize },
    #[error(
        "Inline buffer update at offset {offset} with {size} bytes is invalid for a buffer of {buffer_size} bytes"
    )]
    InvalidUpdate {
        offset: u64,
        size: u64,
        buffer_size: u64,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("Timeline semaphore value must increase, tried to set {requested} while at {current}")]
    NotIncreasing { current: u64, requested: u64 },
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
}

#[derive(Error, Debug)]
pub enum VkHeapError {
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] AllocatorError),
    #[error("CommandBuffer error: {0}")]
    CommandBufferError(#[from] CommandBufferError),
    #[error("Device error: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("Instance error: {0}")]
    InstanceError(#[from] InstanceError),
    #[error("Sync error: {0}")]
    SyncError(#[from] SyncError),
    #[error("Other error: {0}")]
    Other(String),
}
