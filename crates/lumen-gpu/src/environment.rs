//! Caller-owned accelerator environment.
//!
//! Holds what would otherwise be process-wide state: the driver, its
//! one-time initialization gate and the device registry. Independent
//! environments can coexist in one process.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::capabilities::{AcceleratorDevice, DeviceFilter};
use crate::driver::AcceleratorDriver;
use crate::error::{DriverError, Result};
use crate::registry::DeviceRegistry;
use crate::vulkan::VulkanDriver;

/// Driver plus lazily-created registry.
pub struct AcceleratorEnvironment {
    driver: Arc<dyn AcceleratorDriver>,
    init: OnceLock<std::result::Result<(), DriverError>>,
    registry: Mutex<Option<Arc<DeviceRegistry>>>,
    filter: Option<Box<DeviceFilter>>,
}

impl AcceleratorEnvironment {
    /// Create an environment over a driver. Nothing is initialized yet.
    pub fn new(driver: Arc<dyn AcceleratorDriver>) -> Self {
        Self {
            driver,
            init: OnceLock::new(),
            registry: Mutex::new(None),
            filter: None,
        }
    }

    /// Create an environment over the Vulkan driver.
    pub fn vulkan() -> Self {
        Self::new(Arc::new(VulkanDriver::new()))
    }

    /// Add a predicate devices must pass to be registered.
    pub fn with_device_filter(
        mut self,
        filter: impl Fn(&AcceleratorDevice) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Driver used by this environment.
    pub fn driver(&self) -> &Arc<dyn AcceleratorDriver> {
        &self.driver
    }

    /// Start the driver. The underlying init call runs exactly once, even
    /// under concurrent first use; later calls return the cached outcome.
    pub fn initialize_driver(&self) -> Result<()> {
        self.init
            .get_or_init(|| {
                tracing::debug!("Initializing {} driver", self.driver.name());
                self.driver
                    .init()
                    .map_err(|status| DriverError::new(self.driver.as_ref(), status))
            })
            .clone()
            .map_err(Into::into)
    }

    /// Check if the driver was started successfully.
    pub fn is_initialized(&self) -> bool {
        matches!(self.init.get(), Some(Ok(())))
    }

    /// The device registry, enumerated on first access.
    ///
    /// Every call returns the same registry.
    pub fn registry(&self) -> Result<Arc<DeviceRegistry>> {
        self.initialize_driver()?;

        let mut slot = self.registry.lock();
        if let Some(registry) = slot.as_ref() {
            return Ok(Arc::clone(registry));
        }

        let registry = Arc::new(DeviceRegistry::enumerate(
            Arc::clone(&self.driver),
            self.filter.as_deref(),
        )?);
        tracing::debug!(
            "Enumerated {} supported accelerator(s) out of {}",
            registry.len(),
            registry.enumerated_count()
        );
        *slot = Some(Arc::clone(&registry));
        Ok(registry)
    }
}
