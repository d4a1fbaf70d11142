//! Accelerator device registry.

use std::sync::Arc;

use crate::capabilities::{AcceleratorDevice, DeviceFilter};
use crate::context::ContextTable;
use crate::driver::{AcceleratorDriver, ContextHandle, DriverResultExt};
use crate::error::{GpuError, Result};

/// Supported accelerators and their primary contexts.
///
/// Built once per [`AcceleratorEnvironment`](crate::AcceleratorEnvironment).
/// Dropping the registry releases every context it bound.
pub struct DeviceRegistry {
    driver: Arc<dyn AcceleratorDriver>,
    devices: Vec<AcceleratorDevice>,
    contexts: ContextTable,
    enumerated: usize,
}

impl DeviceRegistry {
    /// Enumerate the driver's devices, keeping the supported ones.
    ///
    /// The driver must already be initialized.
    pub fn enumerate(
        driver: Arc<dyn AcceleratorDriver>,
        filter: Option<&DeviceFilter>,
    ) -> Result<Self> {
        let count = driver.device_count().check(driver.as_ref())?;
        let mut devices = Vec::with_capacity(count);

        for ordinal in 0..count {
            let attributes = driver.device_attributes(ordinal).check(driver.as_ref())?;
            let device = AcceleratorDevice::new(ordinal, attributes);

            let accepted = device.is_supported() && filter.map_or(true, |f| f(&device));
            if accepted {
                tracing::debug!("Found accelerator {}", device.summary());
                devices.push(device);
            } else {
                tracing::debug!("Skipping unsupported accelerator {}", device.summary());
            }
        }

        Ok(Self {
            driver,
            devices,
            contexts: ContextTable::new(count),
            enumerated: count,
        })
    }

    /// Check if no supported device was found.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of supported devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Number of devices the driver reported, supported or not.
    pub fn enumerated_count(&self) -> usize {
        self.enumerated
    }

    /// Get a supported device by position.
    ///
    /// # Panics
    /// Panics if `index >= self.len()`.
    pub fn device(&self, index: usize) -> &AcceleratorDevice {
        assert!(
            index < self.devices.len(),
            "device index {index} out of bounds ({} devices)",
            self.devices.len()
        );
        &self.devices[index]
    }

    /// All supported devices.
    pub fn devices(&self) -> &[AcceleratorDevice] {
        &self.devices
    }

    /// Find a supported device by driver ordinal.
    pub fn find(&self, ordinal: usize) -> Option<&AcceleratorDevice> {
        self.devices.iter().find(|d| d.ordinal() == ordinal)
    }

    /// The device the selection policy prefers, without activating it.
    pub fn best_device(&self) -> Option<&AcceleratorDevice> {
        self.devices.iter().max_by_key(|d| d.selection_key())
    }

    /// Select the best device and make its context current on this thread.
    ///
    /// See [`AcceleratorDevice::selection_key`] for the ranking. Repeated
    /// calls return the same device and never recreate its context.
    pub fn pick_best_device(&self) -> Result<&AcceleratorDevice> {
        let device = self.best_device().ok_or(GpuError::NoDevice)?;
        self.activate(device.ordinal())?;
        Ok(device)
    }

    /// Make a supported device's primary context current on the calling
    /// thread, retaining it on first use.
    pub fn activate(&self, ordinal: usize) -> Result<ContextHandle> {
        if self.find(ordinal).is_none() {
            return Err(GpuError::InvalidState(format!(
                "device #{ordinal} is not a supported accelerator"
            )));
        }
        self.contexts.activate(self.driver.as_ref(), ordinal)
    }

    /// Context bound to a device, if activated.
    pub fn context(&self, ordinal: usize) -> Option<ContextHandle> {
        self.contexts.context(ordinal)
    }

    /// Number of distinct contexts this registry created.
    pub fn contexts_created(&self) -> usize {
        self.contexts.contexts_created()
    }

    /// Driver backing this registry.
    pub fn driver(&self) -> &Arc<dyn AcceleratorDriver> {
        &self.driver
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.contexts.release_all(self.driver.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ComputeMode;
    use crate::mock::{mock_device, MockDriver};

    fn registry(driver: &Arc<MockDriver>) -> DeviceRegistry {
        driver.init().unwrap();
        DeviceRegistry::enumerate(driver.clone(), None).unwrap()
    }

    #[test]
    fn unsupported_devices_keep_other_ordinals() {
        let mut prohibited = mock_device("Prohibited", 8192);
        prohibited.compute_mode = ComputeMode::Prohibited;
        let driver = Arc::new(MockDriver::from_devices(vec![
            mock_device("A", 4096),
            prohibited,
            mock_device("C", 2048),
        ]));
        let registry = registry(&driver);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.enumerated_count(), 3);
        assert_eq!(registry.device(0).ordinal(), 0);
        assert_eq!(registry.device(1).ordinal(), 2);
        assert!(registry.find(1).is_none());
        assert!(registry.activate(1).is_err());
        registry.activate(2).unwrap();
        assert!(registry.context(2).is_some());
    }

    #[test]
    fn filter_rejects_devices() {
        let driver = Arc::new(MockDriver::from_devices(vec![
            mock_device("Tiny", 256),
            mock_device("Big", 16384),
        ]));
        driver.init().unwrap();
        let filter: Box<DeviceFilter> = Box::new(|d: &AcceleratorDevice| d.total_memory() >= 1024 * 1024 * 1024);
        let registry = DeviceRegistry::enumerate(driver.clone(), Some(filter.as_ref())).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.device(0).name(), "Big");
    }

    #[test]
    fn pick_best_device_is_stable() {
        let driver = Arc::new(MockDriver::from_devices(vec![
            mock_device("Small", 2048),
            mock_device("Large", 8192),
        ]));
        let registry = registry(&driver);

        let first = registry.pick_best_device().unwrap().ordinal();
        let second = registry.pick_best_device().unwrap().ordinal();
        assert_eq!(first, 1);
        assert_eq!(first, second);
        assert_eq!(registry.contexts_created(), 1);
        assert_eq!(driver.contexts_created(), 1);
        assert_eq!(driver.current_context(), registry.context(1));
    }

    #[test]
    fn contexts_created_counts_distinct_devices() {
        let driver = Arc::new(MockDriver::with_devices(3));
        let registry = registry(&driver);

        for ordinal in [0, 0, 2, 0, 2, 2] {
            registry.activate(ordinal).unwrap();
        }
        assert_eq!(registry.contexts_created(), 2);
        assert_eq!(driver.contexts_created(), 2);
    }

    #[test]
    fn empty_registry_has_no_best_device() {
        let driver = Arc::new(MockDriver::with_devices(0));
        let registry = registry(&driver);
        assert!(registry.is_empty());
        assert!(matches!(registry.pick_best_device(), Err(GpuError::NoDevice)));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn device_out_of_bounds_panics() {
        let driver = Arc::new(MockDriver::with_devices(1));
        let registry = registry(&driver);
        let _ = registry.device(1);
    }

    #[test]
    fn drop_releases_contexts() {
        let driver = Arc::new(MockDriver::with_devices(2));
        let registry = registry(&driver);
        registry.activate(0).unwrap();
        registry.activate(1).unwrap();
        assert_eq!(driver.live_contexts(), 2);

        drop(registry);
        assert_eq!(driver.live_contexts(), 0);
    }
}
