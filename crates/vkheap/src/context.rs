//! ## Context
//!
//! When working with Vulkan the [Device](ash::Device) is entry point for most of the operations.
//! It therefore is needed in most structures and functions calls that somehow transform state related to Vulkan.
//! The device is created from an [Instance](ash::Instance) which represents a runtime instance of Vulkan.
//!
//! Additionally to the device one or multiple [queues](ash::vk::Queue) are created. Basically they are used for
//! scheduling work on the GPU.
//!
//! When working with buffers and images the allocator is relevant as well. It tracks which device memory is in use.
//!
//! Since those structures closely work together we define an abstraction called [Ctx], or "Context".
//!
//! ```ignore
//! let ctx = Ctx::new_headless(true, AllocatorConfig::default())?;
//! let buffer = Buffer::new(
//!     &ctx.device,
//!     &ctx.allocator,
//!     BufDesc::general_purpose(1024, SharingMode::Exclusive),
//!     MemoryUsage::HostVisible,
//!     None,
//! )?;
//! ```
use std::sync::{Arc, Mutex};

use ash::vk;

mod instance;
pub use instance::{GetDeviceFilter, Instance, InstanceBuilder};

mod device;
pub use device::{Device, DeviceBuilder};

mod queue;
pub use queue::{Queue, QueueBuilder};

mod physical_device;
pub use physical_device::{PhyDeviceProperties, PhysicalDeviceFilter, device_type_rank};

use crate::{
    VkHeapError,
    allocator::{Allocator, AllocatorConfig, BlockAllocator},
    error::DeviceError,
};

///Vulkan context. Can either be constructed by hand, or via [Ctx::new_headless].
pub struct Ctx<A: Allocator + Send> {
    ///Allocator instance used for all buffer and image allocation in this context.
    pub allocator: Arc<Mutex<A>>,
    ///Vulkan device including assosiated queues.
    pub device: Arc<Device>,
    ///The initial vulkan instance used for the context.
    pub instance: Arc<Instance>,
}

impl<A: Allocator + Send> Clone for Ctx<A> {
    fn clone(&self) -> Self {
        Ctx {
            allocator: self.allocator.clone(),
            device: self.device.clone(),
            instance: self.instance.clone(),
        }
    }
}

impl<A: Allocator + Send> Ctx<A> {
    ///Creates the context from its elements.
    ///
    /// Assumes that the allocator was created for the device, which is in turn created for the instance.
    pub fn new(allocator: A, device: Arc<Device>, instance: Arc<Instance>) -> Self {
        Ctx {
            allocator: Arc::new(Mutex::new(allocator)),
            device,
            instance,
        }
    }
}

impl Ctx<BlockAllocator> {
    ///Creates a context on the most preferred physical device, without any surface support.
    ///
    /// One queue is created per queue family. On devices below Vulkan 1.1 the dedicated allocation and bind-memory-2
    /// extensions are enabled if available. Timeline semaphores are enabled on Vulkan 1.2 devices that support them.
    pub fn new_headless(use_validation: bool, config: AllocatorConfig) -> Result<Self, VkHeapError> {
        let mut instance_builder = Instance::load()?;
        if use_validation {
            instance_builder = instance_builder.enable_validation();
        }
        let instance = instance_builder.build()?;

        let mut candidates = instance
            .create_physical_device_filter()?
            .sort_by_preference()
            .release();
        if candidates.is_empty() {
            return Err(DeviceError::NoPhysicalDevice.into());
        }

        let physical_device = candidates.remove(0);
        let api_version = physical_device.api_version();
        let supports_timeline = instance.supports_timeline_semaphore(physical_device.phydev);
        let mut device_builder = physical_device.into_device_builder(instance.clone())?;

        if api_version < vk::API_VERSION_1_1 {
            for ext in [
                ash::khr::get_memory_requirements2::NAME,
                ash::khr::dedicated_allocation::NAME,
                ash::khr::bind_memory2::NAME,
            ] {
                if device_builder.is_extension_available(ext) {
                    device_builder = device_builder.with_extension(ext)?;
                }
            }
        }
        if api_version >= vk::API_VERSION_1_2 && supports_timeline {
            device_builder = device_builder.enable_timeline_semaphore();
        }

        let device = device_builder.build()?;
        let allocator = BlockAllocator::new(device.clone(), config);

        Ok(Ctx::new(allocator, device, instance))
    }
}
