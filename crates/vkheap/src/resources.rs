//! ## Resources
//!
//! Self-destroying wrappers around Vulkan buffers and images. Memory is taken from an [Allocator](crate::allocator::Allocator)
//! and returned to it once the resource is dropped.

mod image;
pub use image::{
    Image, ImageType, ImageView, ImgDesc, ImgViewDesc, SafeImageView, aspect_mask_for_format,
};

mod buffer;
pub use buffer::{BufDesc, Buffer, BufferMapError};

use ash::vk;
use smallvec::SmallVec;

///Describes which queue families can access a resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SharingMode {
    Exclusive,
    Concurrent {
        ///The queue family indices of families that can access the resource concurrently.
        queue_family_indices: SmallVec<[u32; 4]>,
    },
}

impl SharingMode {
    ///Concurrent sharing between all distinct `families`. Falls back to [Exclusive](SharingMode::Exclusive) if there
    /// are less than two distinct families, since Vulkan requires at least two for concurrent sharing.
    pub fn for_families(families: &[u32]) -> Self {
        let mut queue_family_indices = SmallVec::<[u32; 4]>::new();
        for f in families {
            if !queue_family_indices.contains(f) {
                queue_family_indices.push(*f);
            }
        }

        if queue_family_indices.len() < 2 {
            SharingMode::Exclusive
        } else {
            SharingMode::Concurrent {
                queue_family_indices,
            }
        }
    }

    pub fn as_vk(&self) -> vk::SharingMode {
        match self {
            SharingMode::Exclusive => vk::SharingMode::EXCLUSIVE,
            SharingMode::Concurrent { .. } => vk::SharingMode::CONCURRENT,
        }
    }

    ///The family indices to pass to the create info. Empty for exclusive sharing.
    pub fn family_indices(&self) -> &[u32] {
        match self {
            SharingMode::Exclusive => &[],
            SharingMode::Concurrent {
                queue_family_indices,
            } => queue_family_indices,
        }
    }
}
