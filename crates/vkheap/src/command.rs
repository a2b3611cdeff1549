//! ## Command recording
//!
//! [CommandPool]s hand out [CommandBuffer]s through the [CommandBufferAllocator] trait. The command buffer records
//! transfer and clear commands on [Buffer]s and [Image]s and takes care of image layout transitions while doing so.
//!
//! Images rest in `GENERAL` between command buffers. Each command moves its images into the layout it needs, and
//! [end](CommandBuffer::end) moves every touched image back. A freshly created image is in `UNDEFINED` and should be
//! recorded with [initialize_image](CommandBuffer::initialize_image) once.

use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    context::{Device, Queue},
    error::CommandBufferError,
    resources::{Buffer, Image},
    sync::{Fence, Semaphore},
};

mod layout_tracker;
pub use layout_tracker::LayoutTracker;

///Upper size limit of an inline buffer update in bytes.
pub const MAX_UPDATE_SIZE: u64 = 65536;

///Checks the rules of `vkCmdUpdateBuffer`.
pub fn validate_update(offset: u64, size: u64, buffer_size: u64) -> Result<(), CommandBufferError> {
    let fits = offset
        .checked_add(size)
        .is_some_and(|end| end <= buffer_size);
    if offset % 4 != 0 || size % 4 != 0 || size == 0 || size > MAX_UPDATE_SIZE || !fits {
        return Err(CommandBufferError::InvalidUpdate {
            offset,
            size,
            buffer_size,
        });
    }
    Ok(())
}

///Moves the images of a `vkCmdCopyImage` into their transfer layouts. Returns the barriers to record, and the source
/// and destination layout the copy has to be recorded with.
fn copy_image_transitions(
    tracker: &mut LayoutTracker,
    src: (vk::Image, vk::ImageSubresourceRange),
    dst: (vk::Image, vk::ImageSubresourceRange),
) -> (
    SmallVec<[vk::ImageMemoryBarrier<'static>; 2]>,
    vk::ImageLayout,
    vk::ImageLayout,
) {
    let mut barriers = SmallVec::new();

    //a copy within one image needs a single layout that allows reading and writing
    if src.0 == dst.0 {
        let layout = vk::ImageLayout::GENERAL;
        barriers.extend(tracker.transition(src.0, src.1, layout));
        return (barriers, layout, layout);
    }

    barriers.extend(tracker.transition(src.0, src.1, vk::ImageLayout::TRANSFER_SRC_OPTIMAL));
    barriers.extend(tracker.transition(dst.0, dst.1, vk::ImageLayout::TRANSFER_DST_OPTIMAL));
    (
        barriers,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    )
}

pub struct CommandPool {
    ///Device this pool was created on.
    pub device: Arc<Device>,
    ///The queue family this pool's buffers can be used on.
    pub queue_family: u32,
    ///the raw vulkan handle.
    pub inner: vk::CommandPool,
    pub can_reset_buffer: bool,
}

impl CommandPool {
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Arc<Self>, anyhow::Error> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(flags)
            .queue_family_index(queue_family);

        let pool = unsafe { device.inner.create_command_pool(&create_info, None)? };

        let can_reset_buffer = flags.contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        Ok(Arc::new(CommandPool {
            device: device.clone(),
            inner: pool,
            queue_family,
            can_reset_buffer,
        }))
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_command_pool(self.inner, None) }
    }
}

impl CommandBufferAllocator for Arc<CommandPool> {
    fn reset(
        &self,
        command_buffer: vk::CommandBuffer,
        release_resources: bool,
    ) -> Result<(), CommandBufferError> {
        if !self.can_reset_buffer {
            return Err(CommandBufferError::PoolNotResetable);
        }

        let flag = if release_resources {
            vk::CommandBufferResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandBufferResetFlags::empty()
        };
        unsafe { self.device.inner.reset_command_buffer(command_buffer, flag)? };
        Ok(())
    }

    fn allocate_buffer(
        self,
        level: vk::CommandBufferLevel,
    ) -> Result<CommandBuffer<Self>, CommandBufferError> {
        let mut buffers = self.allocate_buffers(level, 1)?;
        buffers.pop().ok_or(CommandBufferError::FailedToAllocate {
            allocated: 0,
            count: 1,
        })
    }

    fn allocate_buffers(
        self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBuffer<Self>>, CommandBufferError> {
        let buffers = unsafe {
            self.device.inner.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.inner)
                    .command_buffer_count(count)
                    .level(level),
            )?
        };

        if buffers.len() != count as usize {
            #[cfg(feature = "logging")]
            log::error!(
                "Allocated wrong number of command buffers, expected {}, got {}",
                count,
                buffers.len()
            );
            if !buffers.is_empty() {
                unsafe { self.device.inner.free_command_buffers(self.inner, &buffers) };
            }
            return Err(CommandBufferError::FailedToAllocate {
                allocated: buffers.len(),
                count: count as usize,
            });
        }

        Ok(buffers
            .into_iter()
            .map(|inner| CommandBuffer {
                pool: self.clone(),
                inner,
                level,
                layouts: LayoutTracker::default(),
            })
            .collect())
    }

    fn device(&self) -> &ash::Device {
        &self.device.inner
    }

    fn raw(&self) -> vk::CommandPool {
        self.inner
    }
}

///Command buffer allocation implementation.
pub trait CommandBufferAllocator: Sized {
    ///Tries to reset the command buffer. Fails, for instance, if the pool was not created with the `RESET_COMMAND_BUFFER` flag.
    ///
    /// `release_resources` is is synonym to [this](https://www.khronos.org/registry/vulkan/specs/1.3-extensions/man/html/VkCommandBufferResetFlagBits.html) flag.
    fn reset(
        &self,
        command_buffer: vk::CommandBuffer,
        release_resources: bool,
    ) -> Result<(), CommandBufferError>;

    ///Allocates a single command buffer.
    fn allocate_buffer(
        self,
        level: vk::CommandBufferLevel,
    ) -> Result<CommandBuffer<Self>, CommandBufferError>;

    ///Allocates `count` command buffers at once. Either all, or none are allocated.
    fn allocate_buffers(
        self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBuffer<Self>>, CommandBufferError>;

    fn device(&self) -> &ash::Device;
    fn raw(&self) -> vk::CommandPool;
}

pub struct CommandBuffer<P: CommandBufferAllocator> {
    ///Pool this command buffer was created from. Used for reset operations, and freeing on drop.
    pub pool: P,
    ///the raw vulkan handle
    pub inner: vk::CommandBuffer,
    pub level: vk::CommandBufferLevel,
    layouts: LayoutTracker,
}

impl<P: CommandBufferAllocator> CommandBuffer<P> {
    pub fn reset(&mut self, release_resources: bool) -> Result<(), CommandBufferError> {
        self.pool.reset(self.inner, release_resources)?;
        self.layouts.clear();
        Ok(())
    }

    ///Starts recording. Secondary command buffers are begun without any inherited render pass state.
    ///
    /// Layouts declared via [assume_layout](Self::assume_layout) before `begin` are kept. The tracker is only cleared by
    /// [end](Self::end) and [reset](Self::reset).
    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> Result<(), CommandBufferError> {
        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut info = vk::CommandBufferBeginInfo::default().flags(flags);
        if self.level == vk::CommandBufferLevel::SECONDARY {
            info = info.inheritance_info(&inheritance);
        }
        unsafe { self.pool.device().begin_command_buffer(self.inner, &info)? };
        Ok(())
    }

    ///Moves all images back into their resting layout and ends recording.
    pub fn end(&mut self) -> Result<(), CommandBufferError> {
        let barriers = self.layouts.restore_all();
        self.record_barriers(&barriers);
        unsafe { self.pool.device().end_command_buffer(self.inner)? };
        Ok(())
    }

    ///Declares the layout `image` is in when this command buffer starts executing.
    pub fn assume_layout(&mut self, image: &Image, layout: vk::ImageLayout) {
        self.layouts
            .assume_layout(image.inner, image.subresource_all(), layout);
    }

    ///The layout `image` is in at this point of the recording.
    pub fn layout_of(&self, image: &Image) -> Option<vk::ImageLayout> {
        self.layouts.layout_of(image.inner)
    }

    ///Records the transition of a freshly created image into the resting layout.
    pub fn initialize_image(&mut self, image: &Image) {
        self.assume_layout(image, vk::ImageLayout::UNDEFINED);
        self.transition(&[(image, LayoutTracker::RESTING_LAYOUT)]);
    }

    fn record_barriers(&self, barriers: &[vk::ImageMemoryBarrier<'static>]) {
        if barriers.is_empty() {
            return;
        }
        unsafe {
            self.pool.device().cmd_pipeline_barrier(
                self.inner,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                barriers,
            )
        }
    }

    fn transition(&mut self, images: &[(&Image, vk::ImageLayout)]) {
        let barriers = images
            .iter()
            .filter_map(|(image, layout)| {
                self.layouts
                    .transition(image.inner, image.subresource_all(), *layout)
            })
            .collect::<SmallVec<[_; 2]>>();
        self.record_barriers(&barriers);
    }

    pub fn fill_buffer(&mut self, buffer: &Buffer, offset: u64, size: u64, data: u32) {
        unsafe {
            self.pool
                .device()
                .cmd_fill_buffer(self.inner, buffer.inner, offset, size, data)
        }
    }

    ///Records an inline update of `data` into `buffer`. Offset and size must be a multiple of 4, and at most
    /// [MAX_UPDATE_SIZE] bytes can be updated at once.
    pub fn update_buffer(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), CommandBufferError> {
        validate_update(offset, data.len() as u64, buffer.size())?;
        unsafe {
            self.pool
                .device()
                .cmd_update_buffer(self.inner, buffer.inner, offset, data)
        };
        Ok(())
    }

    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, regions: &[vk::BufferCopy]) {
        unsafe {
            self.pool
                .device()
                .cmd_copy_buffer(self.inner, src.inner, dst.inner, regions)
        }
    }

    ///Copies `regions` from `src` to `dst`. `src` and `dst` may be the same image, for instance to copy between mip
    /// levels or layers. In that case the image is used in `GENERAL` layout.
    pub fn copy_image(&mut self, src: &Image, dst: &Image, regions: &[vk::ImageCopy]) {
        let (barriers, src_layout, dst_layout) = copy_image_transitions(
            &mut self.layouts,
            (src.inner, src.subresource_all()),
            (dst.inner, dst.subresource_all()),
        );
        self.record_barriers(&barriers);
        unsafe {
            self.pool.device().cmd_copy_image(
                self.inner,
                src.inner,
                src_layout,
                dst.inner,
                dst_layout,
                regions,
            )
        }
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &Buffer,
        dst: &Image,
        regions: &[vk::BufferImageCopy],
    ) {
        self.transition(&[(dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL)]);
        unsafe {
            self.pool.device().cmd_copy_buffer_to_image(
                self.inner,
                src.inner,
                dst.inner,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            )
        }
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: &Image,
        dst: &Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.transition(&[(src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)]);
        unsafe {
            self.pool.device().cmd_copy_image_to_buffer(
                self.inner,
                src.inner,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.inner,
                regions,
            )
        }
    }

    ///Clears every mip level and layer of `image`.
    pub fn clear_color_image(&mut self, image: &Image, color: vk::ClearColorValue) {
        self.transition(&[(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)]);
        unsafe {
            self.pool.device().cmd_clear_color_image(
                self.inner,
                image.inner,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &color,
                &[image.subresource_all()],
            )
        }
    }

    ///Clears every mip level and layer of the depth and/or stencil `image`.
    pub fn clear_depth_stencil_image(&mut self, image: &Image, depth: f32, stencil: u32) {
        self.transition(&[(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL)]);
        unsafe {
            self.pool.device().cmd_clear_depth_stencil_image(
                self.inner,
                image.inner,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearDepthStencilValue { depth, stencil },
                &[image.subresource_all()],
            )
        }
    }

    ///Executes secondary command buffers. Layouts the secondaries transition are not tracked by `self`, which is why
    /// secondaries should leave their images in the resting layout.
    pub fn execute_commands<Q: CommandBufferAllocator>(&mut self, secondaries: &[&CommandBuffer<Q>]) {
        let handles = secondaries.iter().map(|c| c.inner).collect::<Vec<_>>();
        unsafe {
            self.pool
                .device()
                .cmd_execute_commands(self.inner, &handles)
        }
    }

    ///Submits `self` to `queue`. Waits for each `(semaphore, stage)` before the stage is executed, signals `signals`
    /// and `fence` once the command buffer finished.
    pub fn submit(
        &self,
        queue: &Queue,
        waits: &[(&Semaphore, vk::PipelineStageFlags)],
        signals: &[&Semaphore],
        fence: Option<&Fence>,
    ) -> Result<(), CommandBufferError> {
        let (wait_semaphores, wait_stages): (Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>) =
            waits.iter().map(|(sem, stage)| (sem.inner, *stage)).unzip();
        let signal_semaphores = signals.iter().map(|s| s.inner).collect::<Vec<_>>();

        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(core::slice::from_ref(&self.inner))
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.pool.device().queue_submit(
                queue.inner,
                core::slice::from_ref(&submit),
                fence.map(|f| f.inner).unwrap_or(vk::Fence::null()),
            )
        }
        .map_err(CommandBufferError::SubmitFailed)
    }
}

impl<P: CommandBufferAllocator> Drop for CommandBuffer<P> {
    fn drop(&mut self) {
        unsafe {
            self.pool
                .device()
                .free_command_buffers(self.pool.raw(), core::slice::from_ref(&self.inner))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(CommandPool: Send, Sync);
        assert_impl_all!(CommandBuffer<Arc<CommandPool>>: Send, Sync);
    }

    fn color_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 4,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    #[test]
    fn copy_between_images_uses_transfer_layouts() {
        let mut tracker = LayoutTracker::default();
        let src = vk::Image::from_raw(1);
        let dst = vk::Image::from_raw(2);

        let (barriers, src_layout, dst_layout) =
            copy_image_transitions(&mut tracker, (src, color_range()), (dst, color_range()));
        assert_eq!(src_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(dst_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barriers.len(), 2);
        assert_eq!(tracker.layout_of(src), Some(src_layout));
        assert_eq!(tracker.layout_of(dst), Some(dst_layout));
    }

    #[test]
    fn copy_within_one_image_uses_general() {
        let mut tracker = LayoutTracker::default();
        let img = vk::Image::from_raw(1);

        //resting images need no barrier at all
        let (barriers, src_layout, dst_layout) =
            copy_image_transitions(&mut tracker, (img, color_range()), (img, color_range()));
        assert!(barriers.is_empty());
        assert_eq!(src_layout, vk::ImageLayout::GENERAL);
        assert_eq!(dst_layout, vk::ImageLayout::GENERAL);

        //after a clear the image is in TRANSFER_DST and has to move to GENERAL once
        tracker.transition(img, color_range(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let (barriers, src_layout, dst_layout) =
            copy_image_transitions(&mut tracker, (img, color_range()), (img, color_range()));
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(tracker.layout_of(img), Some(src_layout));
        assert_eq!(tracker.layout_of(img), Some(dst_layout));
    }

    #[test]
    fn inline_update_limits() {
        assert!(validate_update(0, 4, 4).is_ok());
        assert!(validate_update(64, MAX_UPDATE_SIZE, 64 + MAX_UPDATE_SIZE).is_ok());

        //alignment
        assert!(validate_update(2, 4, 64).is_err());
        assert!(validate_update(0, 6, 64).is_err());
        //size
        assert!(validate_update(0, 0, 64).is_err());
        assert!(validate_update(0, MAX_UPDATE_SIZE + 4, 1 << 20).is_err());
        //bounds
        assert!(matches!(
            validate_update(60, 8, 64),
            Err(CommandBufferError::InvalidUpdate {
                offset: 60,
                size: 8,
                buffer_size: 64
            })
        ));
        assert!(validate_update(u64::MAX - 3, 4, 64).is_err());
    }
}
