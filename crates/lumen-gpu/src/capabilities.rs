//! Accelerator device descriptors.

/// How many host threads may use a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComputeMode {
    /// Any number of contexts.
    #[default]
    Default,
    /// One context at a time.
    Exclusive,
    /// No compute contexts allowed.
    Prohibited,
}

/// Raw attributes reported by the driver for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttributes {
    /// Device name
    pub name: String,
    /// Compute capability (major, minor)
    pub compute_capability: (u32, u32),
    /// Compute mode
    pub compute_mode: ComputeMode,
    /// Total device memory in bytes
    pub total_memory: u64,

    // Execution limits
    /// Maximum threads per block
    pub max_threads_per_block: u32,
    /// Maximum block dimensions
    pub max_block_dim: [u32; 3],
    /// Maximum grid dimensions
    pub max_grid_dim: [u32; 3],
    /// Maximum registers per block, zero when the driver does not expose it
    pub max_registers: u32,
}

/// A physical accelerator, immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorDevice {
    ordinal: usize,
    attributes: DeviceAttributes,
}

/// Extra predicate a device must pass to be registered.
pub type DeviceFilter = dyn Fn(&AcceleratorDevice) -> bool + Send + Sync;

impl AcceleratorDevice {
    /// Wrap the attributes of the device at `ordinal`.
    pub fn new(ordinal: usize, attributes: DeviceAttributes) -> Self {
        Self {
            ordinal,
            attributes,
        }
    }

    /// Driver ordinal. Stable for the process lifetime only.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.attributes.name
    }

    /// All driver-reported attributes.
    pub fn attributes(&self) -> &DeviceAttributes {
        &self.attributes
    }

    /// Compute capability (major, minor).
    pub fn compute_capability(&self) -> (u32, u32) {
        self.attributes.compute_capability
    }

    /// Compute mode.
    pub fn compute_mode(&self) -> ComputeMode {
        self.attributes.compute_mode
    }

    /// Total device memory in bytes.
    pub fn total_memory(&self) -> u64 {
        self.attributes.total_memory
    }

    /// Check if the device can run our kernels at all.
    pub fn is_supported(&self) -> bool {
        self.attributes.compute_mode != ComputeMode::Prohibited
    }

    /// Ranking key for best-device selection. Larger is better.
    ///
    /// Devices are ranked by total memory, then compute capability, then by
    /// lowest ordinal so the choice is deterministic.
    pub fn selection_key(&self) -> (u64, (u32, u32), std::cmp::Reverse<usize>) {
        (
            self.attributes.total_memory,
            self.attributes.compute_capability,
            std::cmp::Reverse(self.ordinal),
        )
    }

    /// Get a human-readable summary of the device.
    pub fn summary(&self) -> String {
        let (major, minor) = self.attributes.compute_capability;
        format!(
            "#{} {} - compute {}.{} - {} MB - {:?} mode",
            self.ordinal,
            self.attributes.name,
            major,
            minor,
            self.attributes.total_memory / (1024 * 1024),
            self.attributes.compute_mode,
        )
    }
}
