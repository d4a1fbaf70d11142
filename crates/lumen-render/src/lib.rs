//! Render devices for the Lumen renderer.
//!
//! This crate provides:
//! - The [`RenderDevice`] lifecycle shared by every device
//! - A CPU device rendering tiles on a rayon pool
//! - An accelerator device driving a [`lumen_accel::SceneContext`]
//! - [`RenderSettings`] read from project parameters
//!
//! [`RenderDeviceKind::create`] picks the device a project asked for and
//! falls back to the CPU when no accelerator is usable.

pub mod cpu;
pub mod device;
pub mod gpu;
pub mod project;
pub mod settings;
#[cfg(test)]
mod test_support;

pub use cpu::CpuRenderDevice;
pub use device::{DeviceState, RenderDevice, RenderDeviceKind};
pub use gpu::{GpuRenderDevice, RAYGEN_ENTRY_POINT};
pub use project::Project;
pub use settings::{DeviceChoice, RenderSettings, SpatialIndexBackend};
