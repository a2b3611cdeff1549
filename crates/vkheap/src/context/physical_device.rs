use crate::error::DeviceError;

use super::{DeviceBuilder, Instance, QueueBuilder, instance::name_from_array};
use ash::vk;
use std::{ffi::CString, sync::Arc};

///Collection off all properties for this physical device. Can be used to easily create a [DeviceBuilder](DeviceBuilder).
/// Is usually acquired from a [PhysicalDeviceFilter](PhysicalDeviceFilter), or by using `new`.
pub struct PhyDeviceProperties {
    pub phydev: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub queue_properties: Vec<(usize, vk::QueueFamilyProperties)>,
}

impl PhyDeviceProperties {
    ///Creates Self from just a physical device definition. Fills in `queue_properties` with all available properties.
    pub fn new(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let queues =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        PhyDeviceProperties {
            phydev: physical_device,
            properties,
            queue_properties: queues.into_iter().enumerate().collect(),
        }
    }

    ///The Vulkan version usable with this device. That is the lower one of the device's and the instance's version.
    pub fn api_version(&self) -> u32 {
        self.properties.api_version.min(Instance::API_VERSION)
    }

    ///creates a device builder for this physical device and its current properties. One queue is created per family.
    pub fn into_device_builder(
        self,
        instance: Arc<Instance>,
    ) -> Result<DeviceBuilder, DeviceError> {
        let available_extensions = unsafe {
            instance
                .inner
                .enumerate_device_extension_properties(self.phydev)?
        }
        .iter()
        .filter_map(|ext| name_from_array(&ext.extension_name).map(|n| n.to_owned()))
        .collect::<Vec<CString>>();

        #[cfg(feature = "logging")]
        {
            log::trace!("Supported device extensions:");
            for ext in available_extensions.iter() {
                log::trace!("  {:?}", ext);
            }
        }

        Ok(DeviceBuilder {
            instance,
            physical_device: self.phydev,
            properties: self.properties,
            queues: self
                .queue_properties
                .into_iter()
                .map(|(idx, properties)| QueueBuilder {
                    family_index: idx as u32,
                    properties,
                    priorities: vec![1.0],
                })
                .collect(),
            device_extensions: Vec::new(),
            available_extensions,
            features: vk::PhysicalDeviceFeatures::default(),
            timeline_semaphore: false,
        })
    }
}

///Preference of a device type when picking a physical device. Higher is better.
pub fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

///Filter that lets you select a sub-set of all physical devices.
/// use [ash::Instance::enumerate_physical_devices](ash::Instance::enumerate_physical_devices) to get a list of all devices
/// and [PhysicalDeviceFilter::new](PhysicalDeviceFilter::new) to create this filter.
pub struct PhysicalDeviceFilter {
    ///All available devices.
    pub pdevices: Vec<PhyDeviceProperties>,
}

impl PhysicalDeviceFilter {
    pub fn new(instance: &ash::Instance, phydevices: Vec<vk::PhysicalDevice>) -> Self {
        PhysicalDeviceFilter {
            pdevices: phydevices
                .into_iter()
                .map(|phy| PhyDeviceProperties::new(instance, phy))
                .collect(),
        }
    }

    ///removes all devices that are not of the given type.
    pub fn filter_type(mut self, dev_type: vk::PhysicalDeviceType) -> Self {
        self.pdevices.retain(|dev| dev.properties.device_type == dev_type);
        self
    }

    ///removes all devices that do not contain a queue with the given flags
    pub fn filter_queue_flags(mut self, flags: vk::QueueFlags) -> Self {
        self.pdevices.retain(|dev| {
            dev.queue_properties
                .iter()
                .any(|(_idx, f)| f.queue_flags.contains(flags))
        });
        self
    }

    ///Custom filter on the cached properties
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: FnMut(&PhyDeviceProperties) -> bool,
    {
        self.pdevices = self.pdevices.into_iter().filter(filter).collect();
        self
    }

    ///Orders the devices from most to least preferred. Discrete GPUs come first, then integrated, virtual and
    /// CPU devices.
    pub fn sort_by_preference(mut self) -> Self {
        self.pdevices.sort_by_key(|dev| {
            std::cmp::Reverse(device_type_rank(dev.properties.device_type))
        });

        #[cfg(feature = "logging")]
        {
            log::info!("Device candidates (in order):");
            for dev in self.pdevices.iter() {
                log::info!(
                    "    {:?} ({:?})",
                    name_from_array(&dev.properties.device_name),
                    dev.properties.device_type
                );
            }
        }

        self
    }

    ///Releases the current filtered physical devices and queues. You can use [into_device_builder](PhyDeviceProperties::into_device_builder) to start and create an abstract device for these.
    pub fn release(self) -> Vec<PhyDeviceProperties> {
        self.pdevices
    }
}
