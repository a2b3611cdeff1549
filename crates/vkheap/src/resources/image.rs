use ash::vk;

use crate::{
    allocator::{Allocator, AnonymAllocation, ManagedAllocation, MemoryUsage},
    context::Device,
    error::AllocatorError,
    resources::SharingMode,
};
use std::{
    hash::{Hash, Hasher},
    sync::{Arc, Mutex},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageType {
    Tex1d,
    ///Array of 1d textures, u32 is number of layers
    Tex1dArray(u32),
    Tex2d,
    ///Array of 2d textures, u32 is number of layers
    Tex2dArray(u32),
    Tex3d,
    Cube,
    ///Array of cube maps, u32 is number of cubes
    CubeArray(u32),
}

impl ImageType {
    ///Modifies `extent` based on `self` to be valid. For instance sets height and depth to 1 for a 1d image
    pub fn valid_extent(&self, extent: vk::Extent3D) -> vk::Extent3D {
        match self {
            ImageType::Tex1d | ImageType::Tex1dArray(_) => vk::Extent3D {
                width: extent.width,
                height: 1,
                depth: 1,
            },
            ImageType::Tex2d
            | ImageType::Tex2dArray(_)
            | ImageType::Cube
            | ImageType::CubeArray(_) => vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            ImageType::Tex3d => extent,
        }
    }

    ///Returns the correct number of layers for this image type
    pub fn layer_count(&self) -> u32 {
        match self {
            ImageType::Tex1d | ImageType::Tex2d | ImageType::Tex3d => 1,
            ImageType::Tex1dArray(i) | ImageType::Tex2dArray(i) => *i,
            ImageType::Cube => 6,
            ImageType::CubeArray(i) => 6 * i,
        }
    }

    pub fn view_type(&self) -> vk::ImageViewType {
        match self {
            ImageType::Tex1d => vk::ImageViewType::TYPE_1D,
            ImageType::Tex1dArray(_) => vk::ImageViewType::TYPE_1D_ARRAY,
            ImageType::Tex2d => vk::ImageViewType::TYPE_2D,
            ImageType::Tex2dArray(_) => vk::ImageViewType::TYPE_2D_ARRAY,
            ImageType::Tex3d => vk::ImageViewType::TYPE_3D,
            ImageType::Cube => vk::ImageViewType::CUBE,
            ImageType::CubeArray(_) => vk::ImageViewType::CUBE_ARRAY,
        }
    }

    ///Cube maps need `CUBE_COMPATIBLE` at creation time.
    pub fn create_flags(&self) -> vk::ImageCreateFlags {
        match self {
            ImageType::Cube | ImageType::CubeArray(_) => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            _ => vk::ImageCreateFlags::empty(),
        }
    }
}

impl From<ImageType> for vk::ImageType {
    fn from(ty: ImageType) -> vk::ImageType {
        match ty {
            ImageType::Tex1d | ImageType::Tex1dArray(_) => vk::ImageType::TYPE_1D,
            ImageType::Tex2d
            | ImageType::Tex2dArray(_)
            | ImageType::Cube
            | ImageType::CubeArray(_) => vk::ImageType::TYPE_2D,
            ImageType::Tex3d => vk::ImageType::TYPE_3D,
        }
    }
}

///Aspects a view of the whole image needs, derived from its format.
pub fn aspect_mask_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

///Describes all static parameters of an image view. The easiest way is to create the view description via
/// [Image::view_all]. Usually only the subresource range is changed afterwards.
#[derive(Clone, Copy, Debug)]
pub struct ImgViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub component_mapping: vk::ComponentMapping,
    pub range: vk::ImageSubresourceRange,
}

impl ImgViewDesc {
    ///Overwrites all fields (that apply) of `build` with the data in `self`
    pub fn set_on_builder<'a>(
        &self,
        builder: vk::ImageViewCreateInfo<'a>,
    ) -> vk::ImageViewCreateInfo<'a> {
        builder
            .components(self.component_mapping)
            .view_type(self.view_type)
            .format(self.format)
            .subresource_range(self.range)
    }

    pub fn with_aspect(mut self, aspect_flag: vk::ImageAspectFlags) -> Self {
        self.range.aspect_mask = aspect_flag;
        self
    }
}

///[vk::ImageView](ash::vk::ImageView) wrapper that keeps its description, source image and destroys itself when not in use anymore.
pub struct ImageView {
    pub desc: ImgViewDesc,
    pub device: Arc<Device>,
    pub view: vk::ImageView,
    pub src_img: Arc<Image>,
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_image_view(self.view, None) };
    }
}

///Image description. Collects all meta data related to an [Image](Image).
///
/// This is basically a [ImageCreateInfo](ash::vk::ImageCreateInfo) where creation-time specifics like the `push_next` chain
/// are removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImgDesc {
    pub img_type: ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: SharingMode,
}

impl Default for ImgDesc {
    ///Creates a convervative image desciption for a 2d 8bit 4-channel image without mipmapping or multisampling.
    /// with an extend of 512x512
    fn default() -> Self {
        ImgDesc {
            img_type: ImageType::Tex2d,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 512,
                height: 512,
                depth: 1,
            },
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            sharing_mode: SharingMode::Exclusive,
        }
    }
}

impl ImgDesc {
    ///Transfer, sampled, storage and every attachment usage.
    pub const GENERAL_PURPOSE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
        vk::ImageUsageFlags::TRANSFER_SRC.as_raw()
            | vk::ImageUsageFlags::TRANSFER_DST.as_raw()
            | vk::ImageUsageFlags::SAMPLED.as_raw()
            | vk::ImageUsageFlags::STORAGE.as_raw()
            | vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
            | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT.as_raw()
            | vk::ImageUsageFlags::INPUT_ATTACHMENT.as_raw(),
    );

    ///overwrites all infos that apply of `builder` with the data of `self`.
    pub fn set_on_builder<'a>(&'a self, builder: vk::ImageCreateInfo<'a>) -> vk::ImageCreateInfo<'a> {
        builder
            .image_type(self.img_type.into())
            .format(self.format)
            .extent(self.img_type.valid_extent(self.extent))
            .mip_levels(self.mip_levels)
            .array_layers(self.img_type.layer_count())
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(self.sharing_mode.as_vk())
            .queue_family_indices(self.sharing_mode.family_indices())
    }

    ///Appends the additional usage
    pub fn add_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    ///An image that can be used for nearly anything. Only supported by formats that support all the usages in
    /// [GENERAL_PURPOSE_USAGE](ImgDesc::GENERAL_PURPOSE_USAGE).
    pub fn general_purpose(
        img_type: ImageType,
        extent: vk::Extent3D,
        format: vk::Format,
        sharing_mode: SharingMode,
    ) -> Self {
        ImgDesc {
            img_type,
            extent,
            format,
            usage: Self::GENERAL_PURPOSE_USAGE,
            sharing_mode,
            ..Default::default()
        }
    }

    ///Creates a simple 2d image description meant as color attachment. You might have to add additional usages
    ///The only standard usage is `COLOR_ATTACHMENT`.
    pub fn color_attachment_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            ..Default::default()
        }
    }

    ///Creates a simple 2d image description meant as depth attachment. You might have to add additional usages
    ///The only standard usage is `DEPTH_ATTACHMENT`.
    pub fn depth_attachment_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        }
    }

    ///Creates a simple storage image that has the storage bit set as well as transfere bits.
    pub fn storage_image_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage: vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    ///Creates a simple texture image that has the sampeld bit set as well as transfere bits.
    pub fn texture_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    ///Sub resource range that encloses every mip level and layer.
    pub fn subresource_all(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: aspect_mask_for_format(self.format),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.img_type.layer_count(),
        }
    }
}

///Self managing image that uses an [Allocator] to allocate and free its bound memory.
//Note Freeing happens in `ManagedAllocation`'s implementation.
pub struct Image {
    ///vulkan image handle
    pub inner: vk::Image,
    ///assosiated allocation that is freed when the image is dropped
    pub allocation: Box<dyn AnonymAllocation + Send + Sync + 'static>,
    pub desc: ImgDesc,
    pub usage: MemoryUsage,
    pub device: Arc<Device>,
}

///The hash implementation is based on [Image](ash::vk::Image)'s hash.
impl Hash for Image {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.inner.hash(hasher)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_image(self.inner, None) }
    }
}

impl Image {
    ///Creates the image based on the description, allocates its memory and binds it. `create_flags` are added to
    /// the flags the image type needs.
    ///
    /// Note that the image is created with an initial "Undefined" layout.
    pub fn new<A: Allocator + Send + Sync + 'static>(
        device: &Arc<Device>,
        allocator: &Arc<Mutex<A>>,
        description: ImgDesc,
        memory_usage: MemoryUsage,
        create_flags: Option<vk::ImageCreateFlags>,
    ) -> Result<Self, anyhow::Error> {
        let flags = description.img_type.create_flags() | create_flags.unwrap_or_default();
        let builder = description.set_on_builder(
            vk::ImageCreateInfo::default()
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .flags(flags),
        );

        let image = unsafe { device.inner.create_image(&builder, None)? };

        let allocation = {
            let mut lck = match allocator.lock() {
                Ok(lck) => lck,
                Err(_) => {
                    unsafe { device.inner.destroy_image(image, None) };
                    return Err(AllocatorError::Poisoned.into());
                }
            };

            let allocation = match lck.allocate_image(image, memory_usage) {
                Ok(a) => a,
                Err(e) => {
                    unsafe { device.inner.destroy_image(image, None) };
                    return Err(e.into());
                }
            };

            if let Err(e) = lck.bind_image_memory(image, &allocation) {
                if let Err(_free_err) = lck.free(allocation) {
                    #[cfg(feature = "logging")]
                    log::error!("Failed to free allocation of unbound image: {}", _free_err);
                }
                unsafe { device.inner.destroy_image(image, None) };
                return Err(e.into());
            }
            allocation
        };

        #[cfg(feature = "logging")]
        log::trace!(
            "Created image {:?}: {:?} {:?} {:?}",
            image,
            description.img_type,
            description.format,
            description.extent
        );

        Ok(Image {
            allocation: Box::new(ManagedAllocation {
                allocation: Some(allocation),
                allocator: allocator.clone(),
            }),
            desc: description,
            inner: image,
            device: device.clone(),
            usage: memory_usage,
        })
    }

    pub fn extent_3d(&self) -> vk::Extent3D {
        self.desc.img_type.valid_extent(self.desc.extent)
    }

    ///In case of 3d image formats the depth is ignored.
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.extent.width,
            height: self.desc.extent.height,
        }
    }

    ///Returns a sub resource range that encloses the whole image.
    pub fn subresource_all(&self) -> vk::ImageSubresourceRange {
        self.desc.subresource_all()
    }

    ///Creates a subresource layer for the first mip level and all array layers.
    pub fn subresource_layers_all(&self) -> vk::ImageSubresourceLayers {
        let vk::ImageSubresourceRange {
            aspect_mask,
            base_array_layer,
            layer_count,
            base_mip_level,
            ..
        } = self.subresource_all();
        vk::ImageSubresourceLayers {
            aspect_mask,
            base_array_layer,
            layer_count,
            mip_level: base_mip_level,
        }
    }

    ///Creates an [ImgViewDesc](ImgViewDesc) that encloses the whole image.
    pub fn view_all(&self) -> ImgViewDesc {
        ImgViewDesc {
            component_mapping: vk::ComponentMapping::default(),
            format: self.desc.format,
            range: self.subresource_all(),
            view_type: self.desc.img_type.view_type(),
        }
    }
}

///If implemented, creates a self managing image view that keeps its source image and device alive long enough
/// to destroy the inner view when dropped.
pub trait SafeImageView {
    fn view(&self, desc: ImgViewDesc) -> Result<ImageView, anyhow::Error>;
}

impl SafeImageView for Arc<Image> {
    ///Creates an image view for this image based on the based `desc`.
    fn view(&self, desc: ImgViewDesc) -> Result<ImageView, anyhow::Error> {
        let builder = desc.set_on_builder(vk::ImageViewCreateInfo::default().image(self.inner));
        let view = unsafe { self.device.inner.create_image_view(&builder, None)? };

        Ok(ImageView {
            desc,
            device: self.device.clone(),
            view,
            src_img: self.clone(),
        })
    }
}
