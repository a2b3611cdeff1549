//! # Synchronisation
//!
//! Thin, self destroying wrappers around Vulkan's synchronisation primitives.
//!
//! - [Fence]: signaled by the device when a submission finished, waited on by the host.
//! - [Semaphore]: binary semaphore that orders submissions on the device.
//! - [TimelineSemaphore]: semaphore with a monotonically increasing counter that can be signaled and waited on by
//!   both, host and device. Needs the `timelineSemaphore` feature, see [DeviceBuilder::enable_timeline_semaphore](crate::context::DeviceBuilder::enable_timeline_semaphore).
//!
//! Timeouts are given in nanoseconds. Waiting functions return `Ok(false)` if the timeout was reached.

use crate::{context::Device, error::SyncError};
use ash::vk;
use std::fmt::Debug;
use std::sync::Arc;

fn timeout_as_false(result: Result<(), vk::Result>) -> Result<bool, vk::Result> {
    match result {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(e) => Err(e),
    }
}

fn check_increase(current: u64, requested: u64) -> Result<(), SyncError> {
    if requested <= current {
        #[cfg(feature = "logging")]
        log::warn!(
            "Timeline semaphore value must increase, tried to set {} while at {}",
            requested,
            current
        );
        return Err(SyncError::NotIncreasing { current, requested });
    }
    Ok(())
}

pub struct Fence {
    pub inner: vk::Fence,
    pub device: Arc<Device>,
}

impl Fence {
    pub fn new(device: &Arc<Device>, signaled: bool) -> Result<Self, vk::Result> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            device
                .inner
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        };

        Ok(Fence {
            inner: fence,
            device: device.clone(),
        })
    }

    ///Returns true if the fence is signaled, false if it is not (yet).
    pub fn is_signaled(&self) -> Result<bool, vk::Result> {
        unsafe { self.device.inner.get_fence_status(self.inner) }
    }

    ///Blocks until the fence is signaled. Returns false if `timeout` was reached before.
    pub fn wait(&self, timeout: u64) -> Result<bool, vk::Result> {
        timeout_as_false(unsafe {
            self.device
                .inner
                .wait_for_fences(core::slice::from_ref(&self.inner), true, timeout)
        })
    }

    ///Sets the fence back to the unsignaled state.
    pub fn reset(&self) -> Result<(), vk::Result> {
        unsafe {
            self.device
                .inner
                .reset_fences(core::slice::from_ref(&self.inner))
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_fence(self.inner, None) }
    }
}

impl Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

///Binary semaphore.
pub struct Semaphore {
    pub inner: vk::Semaphore,
    pub device: Arc<Device>,
}

impl Semaphore {
    pub fn new(device: &Arc<Device>) -> Result<Self, vk::Result> {
        let semaphore = unsafe {
            device
                .inner
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        };
        Ok(Semaphore {
            inner: semaphore,
            device: device.clone(),
        })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_semaphore(self.inner, None) }
    }
}

impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

///Single [TimelineSemaphore](https://www.khronos.org/blog/vulkan-timeline-semaphores).
pub struct TimelineSemaphore {
    pub inner: vk::Semaphore,
    pub device: Arc<Device>,
}

impl TimelineSemaphore {
    ///Creates the semaphore with the given counter value. Fails with `ERROR_FEATURE_NOT_PRESENT` if timeline
    /// semaphores are not enabled on `device`.
    pub fn new(device: &Arc<Device>, initial_value: u64) -> Result<Arc<Self>, vk::Result> {
        if !device.timeline_semaphore {
            #[cfg(feature = "logging")]
            log::error!("Tried to create timeline semaphore, but the feature is not enabled");
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }

        let mut timeline_ci = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_ci);
        let semaphore = unsafe { device.inner.create_semaphore(&ci, None)? };

        Ok(Arc::new(TimelineSemaphore {
            inner: semaphore,
            device: device.clone(),
        }))
    }

    ///Returns the current value of the semaphore. Note that this can change at any time if the semaphore is in use on
    /// the device.
    pub fn get_value(&self) -> Result<u64, vk::Result> {
        unsafe { self.device.inner.get_semaphore_counter_value(self.inner) }
    }

    ///Signals the semaphore with `value` from the host. The value [has to be](https://registry.khronos.org/vulkan/specs/1.2-extensions/html/chap7.html#VUID-VkSemaphoreSignalInfo-value-03258) greater then the current value.
    ///
    /// # Error
    ///
    /// [SyncError::NotIncreasing] with the current value if `value` was not greater. Vulkan errors of reading the
    /// current value, or of signaling, are returned as they are.
    pub fn set_value(&self, value: u64) -> Result<(), SyncError> {
        let current = self.get_value()?;
        check_increase(current, value)?;

        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.inner)
            .value(value);
        unsafe { self.device.inner.signal_semaphore(&signal_info)? };
        Ok(())
    }

    ///Waits for all semaphores of the form `(Semaphore, target_value)`. The timeout is for the whole wait operation.
    /// Returns false if the timeout was reached.
    pub fn wait_for(waits: &[(&TimelineSemaphore, u64)], timeout: u64) -> Result<bool, vk::Result> {
        let Some((first, _)) = waits.first() else {
            return Ok(true);
        };

        let (sems, values): (Vec<vk::Semaphore>, Vec<u64>) =
            waits.iter().map(|(sem, val)| (sem.inner, *val)).unzip();
        let wait = vk::SemaphoreWaitInfo::default()
            .semaphores(&sems)
            .values(&values);

        timeout_as_false(unsafe { first.device.inner.wait_semaphores(&wait, timeout) })
    }

    ///Blocks until `self` reaches `value`, or the `timeout` is reached. When having to wait for multiple semaphores, consider using [wait_for](TimelineSemaphore::wait_for).
    pub fn wait(&self, value: u64, timeout: u64) -> Result<bool, vk::Result> {
        let sem = [self.inner];
        let val = [value];
        let wait = vk::SemaphoreWaitInfo::default()
            .semaphores(&sem)
            .values(&val);

        timeout_as_false(unsafe { self.device.inner.wait_semaphores(&wait, timeout) })
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_semaphore(self.inner, None) }
    }
}

impl Debug for TimelineSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(Fence: Send, Sync);
        assert_impl_all!(Semaphore: Send, Sync);
        assert_impl_all!(TimelineSemaphore: Send, Sync);
    }

    #[test]
    fn timeline_values_must_increase() {
        assert_eq!(check_increase(4, 5), Ok(()));
        assert_eq!(
            check_increase(4, 4),
            Err(SyncError::NotIncreasing {
                current: 4,
                requested: 4
            })
        );
        assert!(check_increase(u64::MAX, 0).is_err());
    }

    #[test]
    fn vulkan_errors_are_not_mistaken_for_ordering() {
        let err: SyncError = vk::Result::ERROR_DEVICE_LOST.into();
        assert_eq!(err, SyncError::VkError(vk::Result::ERROR_DEVICE_LOST));
        assert!(!matches!(err, SyncError::NotIncreasing { .. }));
    }

    #[test]
    fn timeouts_are_not_errors() {
        assert_eq!(timeout_as_false(Ok(())), Ok(true));
        assert_eq!(timeout_as_false(Err(vk::Result::TIMEOUT)), Ok(false));
        assert_eq!(
            timeout_as_false(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
    }
}
