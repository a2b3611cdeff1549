//! # vkheap
//!
//! Small Vulkan toolkit centered around a sub-allocating device memory allocator.
//!
//! # Usage
//!
//! vkheap provides transparent wrappers around the Vulkan objects needed to move data to and from the GPU. This
//! includes the [Instance](context::Instance), [Device](context::Device), [Buffer](resources::Buffer),
//! [Image](resources::Image) and [CommandBuffer](command::CommandBuffer). Those wrappers keep track of lifetimes and
//! destroy their objects when not needed anymore.
//!
//! Memory is handed out by the [BlockAllocator](allocator::BlockAllocator), which carves allocations out of large
//! device memory blocks, or creates dedicated blocks for resources that prefer them. The [Ctx](context::Ctx) bundles
//! instance, device and allocator for headless use.
//!
//! Structures that are not sensitive to lifetime requirements (like create info) are not wrapped.

pub use ash;
pub use bytemuck;

///Allocator related details. Resources are generic over the [Allocator](allocator::Allocator) trait, the
/// default implementation is the [BlockAllocator](allocator::BlockAllocator).
pub mod allocator;

///Command pools, command buffers and automatic image layout transitions while recording.
pub mod command;

///Structures you need to get starting. Basically [Instance](context::Instance) and [Device](context::Device) creation.
/// Also includes the [Ctx](context::Ctx) struct, which also keeps track of a memory allocator.
pub mod context;

///Allocatable resources. Mostly [Image](resources::Image) and [Buffer](resources::Buffer).
pub mod resources;

///Vulkan synchronisation primitives
pub mod sync;

mod error;
pub use error::{
    AllocatorError, CommandBufferError, DeviceError, FreeRangeError, InstanceError, SyncError,
    VkHeapError,
};
