//! Accelerator abstraction layer for the Lumen renderer.
//!
//! This crate provides:
//! - The driver API surface as a trait, with a Vulkan implementation
//! - Device enumeration, capability queries and best-device selection
//! - Primary context activation per host thread
//! - Typed device memory buffers
//! - A thread-safe cache of device module sources
//!
//! Everything hangs off an [`AcceleratorEnvironment`], a caller-owned handle
//! that replaces process-wide driver state.

pub mod capabilities;
pub mod context;
pub mod driver;
pub mod environment;
pub mod error;
pub mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod module_cache;
pub mod registry;
pub mod vulkan;

pub use capabilities::{AcceleratorDevice, ComputeMode, DeviceAttributes, DeviceFilter};
pub use context::ContextTable;
pub use driver::{
    AcceleratorDriver, ContextHandle, DevicePtr, DriverResult, DriverResultExt, DriverStatus,
    ModuleHandle,
};
pub use environment::AcceleratorEnvironment;
pub use error::{DriverError, GpuError, Result};
pub use memory::DeviceBuffer;
pub use module_cache::{ExecutableModule, ModuleCache, ProgramCompiler};
pub use registry::DeviceRegistry;
pub use vulkan::VulkanDriver;
