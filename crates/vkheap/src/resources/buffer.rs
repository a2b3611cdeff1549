use std::{
    hash::{Hash, Hasher},
    sync::{Arc, Mutex},
};

use crate::{
    allocator::{Allocator, AnonymAllocation, ManagedAllocation, MemoryUsage},
    context::Device,
    error::AllocatorError,
};
use ash::vk;
use thiserror::Error;

use super::SharingMode;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferMapError {
    #[error("Supplied offset bigger then buffer")]
    OffsetTooLarge,
    #[error("Mapped buffer is partially written. {written} / {size}")]
    PartialyWritten { written: usize, size: usize },
    #[error("Buffer can not be mapped")]
    NotMapable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub sharing: SharingMode,
}

impl BufDesc {
    ///Usage flags that allow a buffer to be used as any kind of shader and pipeline input, as well as transfer
    /// source and destination.
    pub const GENERAL_PURPOSE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
        vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
            | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
            | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
            | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
            | vk::BufferUsageFlags::INDEX_BUFFER.as_raw()
            | vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
            | vk::BufferUsageFlags::INDIRECT_BUFFER.as_raw(),
    );

    pub fn general_purpose(size: vk::DeviceSize, sharing: SharingMode) -> Self {
        BufDesc {
            size,
            usage: Self::GENERAL_PURPOSE_USAGE,
            sharing,
        }
    }

    pub fn set_on_builder<'a>(
        &'a self,
        builder: vk::BufferCreateInfo<'a>,
    ) -> vk::BufferCreateInfo<'a> {
        builder
            .size(self.size)
            .usage(self.usage)
            .sharing_mode(self.sharing.as_vk())
            .queue_family_indices(self.sharing.family_indices())
    }
}

///Checks a host write of `len` bytes at `offset` into a buffer of `size` bytes. Returns the number of bytes that can
/// be written.
fn clamp_write(offset: usize, len: usize, size: usize) -> Result<usize, BufferMapError> {
    if offset > size {
        return Err(BufferMapError::OffsetTooLarge);
    }
    Ok(len.min(size - offset))
}

///Self managing buffer that uses an [Allocator] to create the buffer, and free it when dropped.
//Note Freeing happens in `ManagedAllocation`'s implementation.
pub struct Buffer {
    pub desc: BufDesc,
    pub inner: vk::Buffer,
    pub usage: MemoryUsage,
    pub device: Arc<Device>,
    //NOTE: The allocation is type erased, so that buffers of different allocators can be collected in one Vec<Buffer>.
    //      It is only used for mapping, and to free the memory on drop.
    pub allocation: Box<dyn AnonymAllocation + Send + Sync + 'static>,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_buffer(self.inner, None) }
    }
}

///The hash implementation is based on [Buffer](ash::vk::Buffer)'s hash.
impl Hash for Buffer {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.inner.hash(hasher)
    }
}

impl Buffer {
    ///Creates a buffer for `description`, allocates its memory with `usage` and binds it.
    pub fn new<A: Allocator + Send + Sync + 'static>(
        device: &Arc<Device>,
        allocator: &Arc<Mutex<A>>,
        description: BufDesc,
        usage: MemoryUsage,
        create_flags: Option<vk::BufferCreateFlags>,
    ) -> Result<Self, anyhow::Error> {
        let mut builder = vk::BufferCreateInfo::default();
        if let Some(flags) = create_flags {
            builder = builder.flags(flags);
        }
        let builder = description.set_on_builder(builder);

        let buffer = unsafe { device.inner.create_buffer(&builder, None)? };

        let allocation = {
            let mut lck = match allocator.lock() {
                Ok(lck) => lck,
                Err(_) => {
                    unsafe { device.inner.destroy_buffer(buffer, None) };
                    return Err(AllocatorError::Poisoned.into());
                }
            };

            let allocation = match lck.allocate_buffer(buffer, usage) {
                Ok(a) => a,
                Err(e) => {
                    unsafe { device.inner.destroy_buffer(buffer, None) };
                    return Err(e.into());
                }
            };

            if let Err(e) = lck.bind_buffer_memory(buffer, &allocation) {
                if let Err(_free_err) = lck.free(allocation) {
                    #[cfg(feature = "logging")]
                    log::error!("Failed to free allocation of unbound buffer: {}", _free_err);
                }
                unsafe { device.inner.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
            allocation
        };

        #[cfg(feature = "logging")]
        log::trace!(
            "Created buffer {:?} of {} bytes ({:?})",
            buffer,
            description.size,
            usage
        );

        Ok(Buffer {
            device: device.clone(),
            allocation: Box::new(ManagedAllocation {
                allocator: allocator.clone(),
                allocation: Some(allocation),
            }),
            usage,
            desc: description,
            inner: buffer,
        })
    }

    ///A staging buffer is a host visible, mapable buffer. Those are usually used to either copy data (from them) to the GPU, or from the GPU back to
    /// the staging buffer to read the data.
    ///
    /// Buffers created by this function are initalized to `data` and can be used as transfer source and destination.
    pub fn new_staging_for_data<A: Allocator + Send + Sync + 'static, T: bytemuck::Pod>(
        device: &Arc<Device>,
        allocator: &Arc<Mutex<A>>,
        data: &[T],
    ) -> Result<Self, anyhow::Error> {
        let bytes: &[u8] = bytemuck::cast_slice(data);

        let desc = BufDesc {
            sharing: SharingMode::Exclusive,
            //zero sized buffers are invalid
            size: (bytes.len() as vk::DeviceSize).max(1),
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        };

        let mut buffer = Buffer::new(device, allocator, desc, MemoryUsage::HostVisible, None)?;
        buffer.write(0, bytes)?;

        Ok(buffer)
    }

    ///Size of the buffer in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }

    ///Writes `data` to the buffer, starting at `offset`.
    ///If `offset + data.len() > buffer.size()` only the bytes that fit are written and an error is returned.
    ///
    ///If the buffer is not mapable by the host (usually if the buffer was created with [MemoryUsage::GpuOnly]) nothing is
    /// written and an error is returned.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), BufferMapError> {
        let write_size = match clamp_write(offset, data.len(), self.desc.size as usize) {
            Ok(s) => s,
            Err(e) => {
                #[cfg(feature = "logging")]
                log::error!(
                    "Supplied offset for buffer write to large. BufferSize={}, offset={}",
                    self.desc.size,
                    offset
                );
                return Err(e);
            }
        };

        let Some(mapped) = self.allocation.as_slice_mut() else {
            #[cfg(feature = "logging")]
            log::error!("Tried to map buffer that has usage: {:?}", self.usage);
            return Err(BufferMapError::NotMapable);
        };

        #[cfg(feature = "logging")]
        log::trace!(
            "writing to mapped buffer[{:?}] of size {} with offset={}, data_size={}, write_size={}",
            self.inner,
            self.desc.size,
            offset,
            data.len(),
            write_size
        );
        mapped[offset..offset + write_size].copy_from_slice(&data[..write_size]);

        if write_size < data.len() {
            Err(BufferMapError::PartialyWritten {
                written: write_size,
                size: data.len(),
            })
        } else {
            Ok(())
        }
    }

    ///Returns (if possible) a reference to the buffers data. Note that the data might be aligned, or not even be of one type. Turning this data into actual types should probably be implemented
    /// by whoever knows the actual data layout.
    pub fn read(&self) -> Result<&[u8], BufferMapError> {
        match self.allocation.as_slice_ref() {
            Some(slice) => Ok(&slice[..(self.desc.size as usize).min(slice.len())]),
            None => {
                #[cfg(feature = "logging")]
                log::error!("Tried to map buffer that has usage: {:?}", self.usage);
                Err(BufferMapError::NotMapable)
            }
        }
    }
}
