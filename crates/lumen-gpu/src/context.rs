//! Primary context table.
//!
//! One slot per enumerated device ordinal, including unsupported devices so
//! ordinals stay aligned. A slot goes from absent to bound once and stays
//! bound until [`ContextTable::release_all`] runs at registry teardown.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::driver::{AcceleratorDriver, ContextHandle, DriverResultExt};
use crate::error::{GpuError, Result};

/// Lazily-retained primary contexts, indexed by device ordinal.
pub struct ContextTable {
    slots: Mutex<Vec<Option<ContextHandle>>>,
    created: AtomicUsize,
}

impl ContextTable {
    /// Create a table with `device_count` empty slots.
    pub fn new(device_count: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; device_count]),
            created: AtomicUsize::new(0),
        }
    }

    /// Retain the device's primary context if needed and make it current on
    /// the calling thread.
    ///
    /// Only the calling thread is affected. Other threads issuing driver
    /// calls must activate the device themselves.
    pub fn activate(&self, driver: &dyn AcceleratorDriver, ordinal: usize) -> Result<ContextHandle> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(ordinal).ok_or_else(|| {
            GpuError::InvalidState(format!("device ordinal {ordinal} was not enumerated"))
        })?;

        let context = match *slot {
            Some(context) => context,
            None => {
                tracing::debug!("Retaining primary context for device #{ordinal}");
                let context = driver.primary_context_retain(ordinal).check(driver)?;
                *slot = Some(context);
                self.created.fetch_add(1, Ordering::Relaxed);
                context
            }
        };

        driver.set_current_context(Some(context)).check(driver)?;
        Ok(context)
    }

    /// Context bound to a device, if it was activated.
    pub fn context(&self, ordinal: usize) -> Option<ContextHandle> {
        self.slots.lock().get(ordinal).copied().flatten()
    }

    /// Number of distinct contexts retained so far.
    pub fn contexts_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Release every bound context. Failures are logged, not returned.
    pub fn release_all(&self, driver: &dyn AcceleratorDriver) {
        let mut slots = self.slots.lock();
        for (ordinal, slot) in slots.iter_mut().enumerate() {
            if slot.take().is_some() {
                tracing::debug!("Releasing primary context for device #{ordinal}");
                if let Err(e) = driver.primary_context_release(ordinal).check(driver) {
                    tracing::warn!("Failed to release context of device #{ordinal}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    #[test]
    fn activation_binds_once_per_device() {
        let driver = MockDriver::with_devices(2);
        driver.init().unwrap();
        let table = ContextTable::new(2);

        let first = table.activate(&driver, 0).unwrap();
        let again = table.activate(&driver, 0).unwrap();
        assert_eq!(first, again);
        assert_eq!(table.contexts_created(), 1);
        assert_eq!(driver.contexts_created(), 1);

        table.activate(&driver, 1).unwrap();
        assert_eq!(table.contexts_created(), 2);
        assert_eq!(driver.current_context(), table.context(1));
    }

    #[test]
    fn unknown_ordinal_is_rejected() {
        let driver = MockDriver::with_devices(1);
        driver.init().unwrap();
        let table = ContextTable::new(1);
        assert!(matches!(
            table.activate(&driver, 4),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn release_all_returns_every_reference() {
        let driver = MockDriver::with_devices(3);
        driver.init().unwrap();
        let table = ContextTable::new(3);
        table.activate(&driver, 0).unwrap();
        table.activate(&driver, 2).unwrap();

        table.release_all(&driver);
        assert_eq!(driver.live_contexts(), 0);
        assert!(table.context(0).is_none());
    }
}
