use super::{Instance, Queue, QueueBuilder};
use crate::{
    allocator::{DedicatedTarget, MemoryCapabilities, MemoryDevice, ResourceRequirements},
    error::DeviceError,
};
use ash::vk;
use smallvec::SmallVec;
use std::{
    ffi::{CStr, CString},
    ptr::NonNull,
    sync::Arc,
};

///Helper that lets you setup device properties and possibly needed extensions before creating the actual
/// device.
pub struct DeviceBuilder {
    ///Instance based on which the device is creates
    pub instance: Arc<Instance>,
    ///The physical device from which this will be an abstraction
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    ///Queue family index, and properties of all queues that can be created.
    pub queues: Vec<QueueBuilder>,
    pub features: vk::PhysicalDeviceFeatures,
    ///Device extensions that will be enabled.
    pub device_extensions: Vec<CString>,
    ///Enables `timelineSemaphore`. Needs Vulkan 1.2, or `VK_KHR_timeline_semaphore` to be enabled.
    pub timeline_semaphore: bool,
    pub(crate) available_extensions: Vec<CString>,
}

impl DeviceBuilder {
    ///Allows changing `self` builder style
    pub fn with(mut self, mut mapping: impl FnMut(&mut DeviceBuilder)) -> Self {
        mapping(&mut self);
        self
    }

    pub fn is_extension_available(&self, name: &CStr) -> bool {
        self.available_extensions.iter().any(|e| e.as_c_str() == name)
    }

    ///Adds the extension. The name is usually obtained from the extension's module like this:
    ///```ignore
    ///  builder.with_extension(ash::khr::bind_memory2::NAME)?;
    ///```
    ///
    /// Fails if the physical device does not support the extension. Adding an extension twice is a no-op.
    pub fn with_extension(mut self, name: &CStr) -> Result<Self, DeviceError> {
        if !self.is_extension_available(name) {
            return Err(DeviceError::UnsupportedExtension(
                name.to_string_lossy().into_owned(),
            ));
        }
        if !self.device_extensions.iter().any(|e| e.as_c_str() == name) {
            #[cfg(feature = "logging")]
            log::info!("Enabling device-extension: {:?}", name);
            self.device_extensions.push(name.to_owned());
        }
        Ok(self)
    }

    pub fn enable_timeline_semaphore(mut self) -> Self {
        self.timeline_semaphore = true;
        self
    }

    pub fn build(self) -> Result<Arc<Device>, DeviceError> {
        let DeviceBuilder {
            instance,
            physical_device,
            properties,
            queues,
            features,
            device_extensions,
            timeline_semaphore,
            available_extensions: _,
        } = self;

        let queue_create_infos = queues
            .iter()
            .map(|q| q.as_create_info())
            .collect::<Vec<_>>();
        let extension_ptrs = device_extensions
            .iter()
            .map(|e| e.as_ptr())
            .collect::<Vec<_>>();

        let mut timeline_features =
            vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true);
        let mut create_info = vk::DeviceCreateInfo::default()
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features)
            .queue_create_infos(&queue_create_infos);
        if timeline_semaphore {
            create_info = create_info.push_next(&mut timeline_features);
        }

        let inner = unsafe {
            instance
                .inner
                .create_device(physical_device, &create_info, None)?
        };

        let device_ref = &inner;
        let queues = queues
            .iter()
            .flat_map(|family| {
                (0..family.priorities.len()).map(move |queue_index| Queue {
                    family_index: family.family_index,
                    properties: family.properties,
                    inner: unsafe {
                        device_ref.get_device_queue(family.family_index, queue_index as u32)
                    },
                })
            })
            .collect::<Vec<_>>();

        let memory_properties = unsafe {
            instance
                .inner
                .get_physical_device_memory_properties(physical_device)
        };

        let api_version = properties.api_version.min(Instance::API_VERSION);
        let enabled = device_extensions
            .iter()
            .map(|e| e.as_c_str())
            .collect::<Vec<_>>();
        let capabilities = MemoryCapabilities::detect(api_version, &enabled);

        //below 1.1 the memory functions are only reachable through their extensions
        let core11 = api_version >= vk::API_VERSION_1_1;
        let memory_requirements2 = (!core11 && capabilities.dedicated_allocation)
            .then(|| ash::khr::get_memory_requirements2::Device::new(&instance.inner, &inner));
        let bind_memory2 = (!core11 && capabilities.bind_memory2)
            .then(|| ash::khr::bind_memory2::Device::new(&instance.inner, &inner));

        #[cfg(feature = "logging")]
        log::info!(
            "Created device {:?} with {} queues, {:?}, timeline semaphores: {}",
            super::instance::name_from_array(&properties.device_name),
            queues.len(),
            capabilities,
            timeline_semaphore
        );

        Ok(Arc::new(Device {
            inner,
            instance,
            physical_device,
            properties,
            memory_properties,
            enabled_extensions: device_extensions,
            queues,
            timeline_semaphore,
            capabilities,
            memory_requirements2,
            bind_memory2,
        }))
    }
}

///Thin device abstraction that keeps the underlying instance (and therfore entrypoint) alive.
/// and takes care of device destruction once its dropped.
pub struct Device {
    ///The raw ash device
    pub inner: ash::Device,
    pub instance: Arc<Instance>,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub enabled_extensions: Vec<CString>,
    pub queues: Vec<Queue>,
    ///True if the timeline semaphore feature was enabled.
    pub timeline_semaphore: bool,
    capabilities: MemoryCapabilities,
    memory_requirements2: Option<ash::khr::get_memory_requirements2::Device>,
    bind_memory2: Option<ash::khr::bind_memory2::Device>,
}

impl Device {
    ///The Vulkan version usable with this device.
    pub fn api_version(&self) -> u32 {
        self.properties.api_version.min(Instance::API_VERSION)
    }

    pub fn is_extension_enabled(&self, name: &CStr) -> bool {
        self.enabled_extensions.iter().any(|e| e.as_c_str() == name)
    }

    ///Returns the first queue for the given family, if there is any.
    pub fn get_first_queue_for_family(&self, family: u32) -> Option<&Queue> {
        self.queues.iter().find(|q| q.family_index == family)
    }

    ///Returns the first queue that supports all `flags`.
    pub fn first_queue_with(&self, flags: vk::QueueFlags) -> Option<&Queue> {
        self.queues.iter().find(|q| q.supports(flags))
    }

    ///All distinct queue families that queues were created for, in ascending order.
    pub fn unique_queue_families(&self) -> SmallVec<[u32; 4]> {
        let mut families = self
            .queues
            .iter()
            .map(|q| q.family_index)
            .collect::<SmallVec<[u32; 4]>>();
        families.sort_unstable();
        families.dedup();
        families
    }

    fn requirements2(
        &self,
        query: impl FnOnce(&mut vk::MemoryRequirements2),
    ) -> ResourceRequirements {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements2 = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        query(&mut requirements2);
        let requirements = requirements2.memory_requirements;

        ResourceRequirements {
            requirements,
            prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE
                || dedicated.requires_dedicated_allocation == vk::TRUE,
        }
    }
}

impl MemoryDevice for Device {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn memory_capabilities(&self) -> MemoryCapabilities {
        self.capabilities
    }

    fn buffer_requirements(&self, buffer: vk::Buffer) -> ResourceRequirements {
        if !self.capabilities.dedicated_allocation {
            return ResourceRequirements {
                requirements: unsafe { self.inner.get_buffer_memory_requirements(buffer) },
                prefers_dedicated: false,
            };
        }

        let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
        self.requirements2(|out| unsafe {
            match &self.memory_requirements2 {
                Some(loader) => loader.get_buffer_memory_requirements2(&info, out),
                None => self.inner.get_buffer_memory_requirements2(&info, out),
            }
        })
    }

    fn image_requirements(&self, image: vk::Image) -> ResourceRequirements {
        if !self.capabilities.dedicated_allocation {
            return ResourceRequirements {
                requirements: unsafe { self.inner.get_image_memory_requirements(image) },
                prefers_dedicated: false,
            };
        }

        let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        self.requirements2(|out| unsafe {
            match &self.memory_requirements2 {
                Some(loader) => loader.get_image_memory_requirements2(&info, out),
                None => self.inner.get_image_memory_requirements2(&info, out),
            }
        })
    }

    fn allocate_memory(
        &self,
        size: u64,
        memory_type_index: u32,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default();
        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        if let (Some(target), true) = (dedicated, self.capabilities.dedicated_allocation) {
            dedicated_info = match target {
                DedicatedTarget::Buffer(buffer) => dedicated_info.buffer(buffer),
                DedicatedTarget::Image(image) => dedicated_info.image(image),
            };
            info = info.push_next(&mut dedicated_info);
        }

        unsafe { self.inner.allocate_memory(&info, None) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<u8>, vk::Result> {
        let ptr = unsafe {
            self.inner
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(ptr as *mut u8).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.inner.unmap_memory(memory) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.inner.free_memory(memory, None) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result> {
        unsafe { self.inner.bind_buffer_memory(buffer, memory, offset) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> Result<(), vk::Result> {
        unsafe { self.inner.bind_image_memory(image, memory, offset) }
    }

    fn bind_buffer_memory2(
        &self,
        binds: &[(vk::Buffer, vk::DeviceMemory, u64)],
    ) -> Result<(), vk::Result> {
        let infos = binds
            .iter()
            .map(|(buffer, memory, offset)| {
                vk::BindBufferMemoryInfo::default()
                    .buffer(*buffer)
                    .memory(*memory)
                    .memory_offset(*offset)
            })
            .collect::<Vec<_>>();
        unsafe {
            match &self.bind_memory2 {
                //the extension only exposes the raw entry point
                Some(loader) => (loader.fp().bind_buffer_memory2_khr)(
                    self.inner.handle(),
                    infos.len() as u32,
                    infos.as_ptr(),
                )
                .result(),
                None => self.inner.bind_buffer_memory2(&infos),
            }
        }
    }

    fn bind_image_memory2(
        &self,
        binds: &[(vk::Image, vk::DeviceMemory, u64)],
    ) -> Result<(), vk::Result> {
        let infos = binds
            .iter()
            .map(|(image, memory, offset)| {
                vk::BindImageMemoryInfo::default()
                    .image(*image)
                    .memory(*memory)
                    .memory_offset(*offset)
            })
            .collect::<Vec<_>>();
        unsafe {
            match &self.bind_memory2 {
                Some(loader) => (loader.fp().bind_image_memory2_khr)(
                    self.inner.handle(),
                    infos.len() as u32,
                    infos.as_ptr(),
                )
                .result(),
                None => self.inner.bind_image_memory2(&infos),
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(_e) = self.inner.device_wait_idle() {
                #[cfg(feature = "logging")]
                log::error!("Waiting for device idle before destruction failed: {}", _e);
            }
            self.inner.destroy_device(None)
        };
    }
}
