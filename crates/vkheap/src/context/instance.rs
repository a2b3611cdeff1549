use std::{
    ffi::{CStr, CString},
    sync::Arc,
};

use ash::vk;

use crate::error::InstanceError;

use super::PhysicalDeviceFilter;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

///Reads a fixed size, nul terminated name array as found in [vk::LayerProperties] and [vk::ExtensionProperties].
pub(crate) fn name_from_array(name: &[std::ffi::c_char]) -> Option<&CStr> {
    CStr::from_bytes_until_nul(bytemuck::cast_slice(name)).ok()
}

///Instance configuration as well as the source entry point. Usually this struct is created via [Instance::load].
pub struct InstanceBuilder {
    pub entry: ash::Entry,
    pub validation: bool,
    pub enabled_layers: Vec<CString>,
    pub enabled_extensions: Vec<CString>,
    available_layers: Vec<vk::LayerProperties>,
    available_extensions: Vec<vk::ExtensionProperties>,
}

impl InstanceBuilder {
    ///Builds the instance from the current information. If validation is enabled, the Khronos validation layer
    /// is added.
    pub fn build(mut self) -> Result<Arc<Instance>, InstanceError> {
        if self.validation {
            self = self.with_layer(VALIDATION_LAYER.to_owned())?;
        }

        let InstanceBuilder {
            entry,
            validation,
            enabled_layers,
            enabled_extensions,
            available_layers: _,
            available_extensions: _,
        } = self;

        let app_desc = vk::ApplicationInfo::default()
            .application_name(c"vkheap")
            .engine_name(c"vkheap")
            .api_version(Instance::API_VERSION);

        #[cfg(feature = "logging")]
        {
            log::info!("Instance creation:");
            let apiversion = app_desc.api_version;
            log::info!(
                "  Vulkan version: {}.{}.{}",
                vk::api_version_major(apiversion),
                vk::api_version_minor(apiversion),
                vk::api_version_patch(apiversion),
            );
            log::info!("  Layers:");
            for l in &enabled_layers {
                log::info!("    {:?}", l);
            }
            log::info!("  Extensions:");
            for e in &enabled_extensions {
                log::info!("    {:?}", e);
            }
        }

        let extension_ptrs = enabled_extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<_>>();
        let layer_ptrs = enabled_layers
            .iter()
            .map(|l| l.as_ptr())
            .collect::<Vec<_>>();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_desc)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let inner = unsafe { entry.create_instance(&create_info, None)? };

        Ok(Arc::new(Instance {
            entry,
            inner,
            validation_enabled: validation,
            enabled_layers,
            enabled_extensions,
        }))
    }

    pub fn is_layer_available(&self, name: &CStr) -> bool {
        self.available_layers
            .iter()
            .any(|l| name_from_array(&l.layer_name) == Some(name))
    }

    ///Returns true if a instance-extension with the given name was found
    pub fn is_extension_available(&self, extension_name: &CStr) -> bool {
        self.available_extensions
            .iter()
            .any(|e| name_from_array(&e.extension_name) == Some(extension_name))
    }

    ///adds an extensions with the given name, if it was not added yet.
    pub fn with_extension(mut self, name: CString) -> Result<Self, InstanceError> {
        if !self.is_extension_available(&name) {
            return Err(InstanceError::MissingExtension(name));
        }

        if self.enabled_extensions.contains(&name) {
            #[cfg(feature = "logging")]
            log::warn!("Tried to enable extension twice: {:?}", name);
            return Ok(self);
        }

        #[cfg(feature = "logging")]
        log::info!("Enabling instance-extension: {:?}", name);
        self.enabled_extensions.push(name);

        Ok(self)
    }

    ///adds an layer with the given name to the list of layers
    pub fn with_layer(mut self, name: CString) -> Result<Self, InstanceError> {
        if !self.is_layer_available(&name) {
            return Err(InstanceError::MissingLayer(name));
        }

        if self.enabled_layers.contains(&name) {
            #[cfg(feature = "logging")]
            log::warn!("Tried to enable layer twice: {:?}", name);
            return Ok(self);
        }

        self.enabled_layers.push(name);
        Ok(self)
    }

    ///Enables the Khronos validation layer. [build](InstanceBuilder::build) fails if the layer is not installed.
    pub fn enable_validation(mut self) -> Self {
        self.validation = true;
        self
    }
}

///Wraps the entry point as well as the created instance into one object.
///
/// # Safety
///
/// This struct is un-clonable for a reason. It implements [Drop] which takes care of destroying the vulkan instance.
pub struct Instance {
    pub entry: ash::Entry,
    pub inner: ash::Instance,
    pub validation_enabled: bool,
    pub enabled_layers: Vec<CString>,
    pub enabled_extensions: Vec<CString>,
}

impl Instance {
    ///Vulkan version the instance is created for.
    pub const API_VERSION: u32 = vk::API_VERSION_1_3;

    ///Creates instance loaded by using [Entry::load](ash::Entry::load)
    pub fn load() -> Result<InstanceBuilder, InstanceError> {
        let entry = unsafe { ash::Entry::load()? };

        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None)? };

        Ok(InstanceBuilder {
            entry,
            enabled_extensions: Vec::new(),
            enabled_layers: Vec::new(),
            validation: false,
            available_layers,
            available_extensions,
        })
    }

    ///Returns the feature list of the given physical device
    pub fn get_physical_device_features(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceFeatures {
        unsafe { self.inner.get_physical_device_features(physical_device) }
    }

    ///Returns true if the physical device supports the timeline semaphore feature.
    pub fn supports_timeline_semaphore(&self, physical_device: vk::PhysicalDevice) -> bool {
        let mut timeline = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut timeline);
        unsafe {
            self.inner
                .get_physical_device_features2(physical_device, &mut features2)
        };
        timeline.timeline_semaphore == vk::TRUE
    }
}

pub trait GetDeviceFilter {
    fn create_physical_device_filter(&self) -> Result<PhysicalDeviceFilter, InstanceError>;
}

impl GetDeviceFilter for Arc<Instance> {
    fn create_physical_device_filter(&self) -> Result<PhysicalDeviceFilter, InstanceError> {
        let devices = unsafe { self.inner.enumerate_physical_devices()? };
        Ok(PhysicalDeviceFilter::new(&self.inner, devices))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            self.inner.destroy_instance(None);
        }
    }
}
