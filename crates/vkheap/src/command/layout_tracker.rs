use ahash::AHashMap;
use ash::vk;

#[derive(Clone, Copy, Debug)]
struct TrackedImage {
    layout: vk::ImageLayout,
    range: vk::ImageSubresourceRange,
}

///Tracks the layout of every image a command buffer touches.
///
/// Images rest in [RESTING_LAYOUT](LayoutTracker::RESTING_LAYOUT) between command buffers. An image that is not tracked
/// yet is assumed to be in that layout, unless declared otherwise via [assume_layout](LayoutTracker::assume_layout).
#[derive(Debug, Default, Clone)]
pub struct LayoutTracker {
    images: AHashMap<vk::Image, TrackedImage>,
}

impl LayoutTracker {
    pub const RESTING_LAYOUT: vk::ImageLayout = vk::ImageLayout::GENERAL;

    fn barrier(
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
    }

    ///Declares that `image` currently is in `layout`, without recording a transition.
    pub fn assume_layout(
        &mut self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
    ) {
        self.images.insert(image, TrackedImage { layout, range });
    }

    ///The tracked layout of `image`, `None` if the image was not used yet.
    pub fn layout_of(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.images.get(&image).map(|t| t.layout)
    }

    ///Moves `image` into `new_layout`. Returns the barrier that needs to be recorded, or `None` if the image already is
    /// in that layout.
    pub fn transition(
        &mut self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        new_layout: vk::ImageLayout,
    ) -> Option<vk::ImageMemoryBarrier<'static>> {
        let tracked = self.images.entry(image).or_insert(TrackedImage {
            layout: Self::RESTING_LAYOUT,
            range,
        });
        if tracked.layout == new_layout {
            return None;
        }

        let old_layout = tracked.layout;
        tracked.layout = new_layout;
        Some(Self::barrier(image, tracked.range, old_layout, new_layout))
    }

    ///Stops tracking all images. Returns the barriers that move every image that is not in the resting layout back.
    pub fn restore_all(&mut self) -> Vec<vk::ImageMemoryBarrier<'static>> {
        self.images
            .drain()
            .filter(|(_, tracked)| tracked.layout != Self::RESTING_LAYOUT)
            .map(|(image, tracked)| {
                Self::barrier(image, tracked.range, tracked.layout, Self::RESTING_LAYOUT)
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.images.clear();
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    #[test]
    fn unknown_images_start_in_resting_layout() {
        let mut tracker = LayoutTracker::default();
        let img = vk::Image::from_raw(1);
        assert_eq!(tracker.layout_of(img), None);

        assert!(
            tracker
                .transition(img, range(), vk::ImageLayout::GENERAL)
                .is_none()
        );
        assert_eq!(tracker.layout_of(img), Some(vk::ImageLayout::GENERAL));

        let barrier = tracker
            .transition(img, range(), vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.image, img);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn same_layout_needs_no_barrier() {
        let mut tracker = LayoutTracker::default();
        let img = vk::Image::from_raw(7);
        assert!(
            tracker
                .transition(img, range(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .is_some()
        );
        assert!(
            tracker
                .transition(img, range(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .is_none()
        );
    }

    #[test]
    fn assumed_layout_is_used_as_old_layout() {
        let mut tracker = LayoutTracker::default();
        let img = vk::Image::from_raw(3);
        tracker.assume_layout(img, range(), vk::ImageLayout::UNDEFINED);
        assert_eq!(tracker.layout_of(img), Some(vk::ImageLayout::UNDEFINED));

        let barrier = tracker
            .transition(img, range(), vk::ImageLayout::GENERAL)
            .unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn restore_moves_images_back() {
        let mut tracker = LayoutTracker::default();
        let a = vk::Image::from_raw(1);
        let b = vk::Image::from_raw(2);
        let c = vk::Image::from_raw(3);
        tracker.transition(a, range(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        tracker.transition(b, range(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        tracker.transition(c, range(), vk::ImageLayout::GENERAL);
        assert_eq!(tracker.len(), 3);

        let mut barriers = tracker.restore_all();
        barriers.sort_by_key(|b| b.image.as_raw());
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].image, a);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barriers[1].image, b);
        assert!(
            barriers
                .iter()
                .all(|b| b.new_layout == LayoutTracker::RESTING_LAYOUT)
        );
        assert!(tracker.is_empty());
    }
}
