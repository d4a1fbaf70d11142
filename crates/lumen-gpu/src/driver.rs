//! The accelerator driver API surface.
//!
//! Drivers follow the primary-context model: each device has one
//! reference-counted context, and each host thread has at most one current
//! context. Module, memory and launch calls act on the calling thread's
//! current context and fail with [`DriverStatus::InvalidContext`] when the
//! thread has none.

use crate::capabilities::DeviceAttributes;
use crate::error::{DriverError, GpuError};

/// Status returned by a failed driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    /// The driver has not been initialized.
    NotInitialized,
    /// No device is installed.
    NoDevice,
    /// The device ordinal does not exist.
    InvalidDevice,
    /// No current context, or the context was released.
    InvalidContext,
    /// Unknown module or memory handle.
    InvalidHandle,
    /// The module image could not be loaded.
    InvalidImage,
    /// A named symbol was not found.
    NotFound,
    /// Device memory is exhausted.
    OutOfMemory,
    /// An argument was out of range.
    InvalidValue,
    /// A kernel launch failed.
    LaunchFailed,
    /// Driver-specific status code.
    Native(i32),
}

impl DriverStatus {
    /// Generic description of the status, `None` for driver-specific codes.
    pub fn description(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("driver not initialized"),
            Self::NoDevice => Some("no device detected"),
            Self::InvalidDevice => Some("invalid device ordinal"),
            Self::InvalidContext => Some("invalid device context"),
            Self::InvalidHandle => Some("invalid resource handle"),
            Self::InvalidImage => Some("device kernel image is invalid"),
            Self::NotFound => Some("named symbol not found"),
            Self::OutOfMemory => Some("out of memory"),
            Self::InvalidValue => Some("invalid argument"),
            Self::LaunchFailed => Some("unspecified launch failure"),
            Self::Native(_) => None,
        }
    }
}

/// Result of a raw driver call.
pub type DriverResult<T> = std::result::Result<T, DriverStatus>;

/// Handle to a device primary context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Handle to a loaded device module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Device memory address. Zero is the null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// The null device pointer.
    pub const NULL: Self = Self(0);

    /// Check if this is the null pointer.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Driver API consumed by the device layer.
pub trait AcceleratorDriver: Send + Sync {
    /// Short driver name used in error messages, e.g. `"Vulkan"`.
    fn name(&self) -> &'static str;

    /// One-time global driver start-up.
    fn init(&self) -> DriverResult<()>;

    /// Number of physical devices.
    fn device_count(&self) -> DriverResult<usize>;

    /// Query the attributes of one device.
    fn device_attributes(&self, ordinal: usize) -> DriverResult<DeviceAttributes>;

    /// Acquire a reference to the device's primary context, creating it on
    /// first acquisition.
    fn primary_context_retain(&self, ordinal: usize) -> DriverResult<ContextHandle>;

    /// Drop a reference to the device's primary context.
    fn primary_context_release(&self, ordinal: usize) -> DriverResult<()>;

    /// Bind (or unbind, with `None`) a context to the calling thread.
    fn set_current_context(&self, context: Option<ContextHandle>) -> DriverResult<()>;

    /// Context bound to the calling thread.
    fn current_context(&self) -> Option<ContextHandle>;

    /// Load a module image into the current context.
    fn module_load(&self, image: &[u8]) -> DriverResult<ModuleHandle>;

    /// Unload a module.
    fn module_unload(&self, module: ModuleHandle) -> DriverResult<()>;

    /// Check if a module exports the named function.
    fn module_has_function(&self, module: ModuleHandle, name: &str) -> DriverResult<bool>;

    /// Allocate device memory in the current context.
    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr>;

    /// Free device memory.
    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()>;

    /// Copy host memory to the start of a device allocation.
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()>;

    /// Copy the start of a device allocation to host memory.
    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()>;

    /// Launch a module function over a grid and wait for it to finish.
    fn launch(&self, module: ModuleHandle, function: &str, grid: [u32; 3]) -> DriverResult<()>;

    /// Decode a status into a human-readable message.
    fn error_string(&self, status: DriverStatus) -> Option<String> {
        status.description().map(str::to_string)
    }
}

/// Conversion of raw driver results into [`GpuError`].
pub trait DriverResultExt<T> {
    /// Turn a failed status into a decoded [`DriverError`].
    fn check(self, driver: &dyn AcceleratorDriver) -> std::result::Result<T, GpuError>;
}

impl<T> DriverResultExt<T> for DriverResult<T> {
    fn check(self, driver: &dyn AcceleratorDriver) -> std::result::Result<T, GpuError> {
        self.map_err(|status| GpuError::from(DriverError::new(driver, status)))
    }
}
