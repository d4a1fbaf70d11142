//! The render device contract and device selection.

use std::sync::Arc;

use lumen_core::{AbortSwitch, FrameStatus, Result, TextureStore, TileCallbackFactory};
use lumen_gpu::AcceleratorEnvironment;

use crate::cpu::CpuRenderDevice;
use crate::gpu::GpuRenderDevice;
use crate::project::Project;
use crate::settings::{DeviceChoice, RenderSettings};

/// Lifecycle state of a render device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Created, caches not prepared yet.
    Constructed,
    /// Caches prepared, no scene built yet.
    Initialized,
    /// Scene built, ready to render.
    GraphBuilt,
    /// Inside `render_frame`.
    Rendering,
    /// Resources released, the device is unusable.
    TornDown,
}

impl DeviceState {
    /// Check if the acceleration structure can be (re)built.
    pub fn can_build(self) -> bool {
        matches!(self, Self::Initialized | Self::GraphBuilt)
    }

    /// Check if a frame can be rendered.
    pub fn can_render(self) -> bool {
        self == Self::GraphBuilt
    }
}

/// A device that turns a project's scene into frames.
///
/// Calls must follow the lifecycle: `initialize`, then
/// `build_or_update_acceleration_structure`, then any number of
/// `render_frame` calls, rebuilding between frames when the scene changed.
/// Out-of-order calls are logged and fail.
pub trait RenderDevice {
    /// Current lifecycle state.
    fn state(&self) -> DeviceState;

    /// Prepare device caches. Returns `false` if the device is not ready.
    fn initialize(&mut self, texture_store: &dyn TextureStore, abort_switch: &AbortSwitch) -> bool;

    /// Build or refresh the structures tracing runs against.
    fn build_or_update_acceleration_structure(&mut self) -> bool;

    /// Render every tile of a frame, blocking until completion or abort.
    ///
    /// Errors never escape this call; they are logged and reported as
    /// [`FrameStatus::Aborted`].
    fn render_frame(
        &mut self,
        tile_callback_factory: Option<&dyn TileCallbackFactory>,
        texture_store: &dyn TextureStore,
        abort_switch: &AbortSwitch,
    ) -> FrameStatus;

    /// Log the active configuration.
    fn print_settings(&self);

    /// Release every device resource.
    fn shutdown(&mut self);
}

pub(crate) fn out_of_order(device: &str, operation: &str, state: DeviceState) {
    tracing::error!("{device} render device: cannot {operation} in state {state:?}");
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Either render device, chosen from the settings.
pub enum RenderDeviceKind {
    Cpu(CpuRenderDevice),
    Gpu(GpuRenderDevice),
}

impl RenderDeviceKind {
    /// Create the device requested by `settings.device`.
    ///
    /// When an accelerator was requested but none can be used, a CPU device
    /// is returned instead if `settings.fallback_to_cpu` is set. Otherwise
    /// the accelerator device is returned as is and reports not-ready.
    pub fn create(
        project: Arc<dyn Project>,
        settings: RenderSettings,
        env: &Arc<AcceleratorEnvironment>,
    ) -> Result<Self> {
        if settings.device == DeviceChoice::Cpu {
            return CpuRenderDevice::new(project, settings).map(Self::Cpu);
        }

        let gpu = GpuRenderDevice::new(Arc::clone(&project), settings.clone(), Arc::clone(env));
        if gpu.has_device() || !settings.fallback_to_cpu {
            return Ok(Self::Gpu(gpu));
        }

        tracing::warn!("No usable accelerator, falling back to CPU rendering");
        drop(gpu);
        CpuRenderDevice::new(project, settings).map(Self::Cpu)
    }

    /// Check if this is the accelerator device.
    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Gpu(_))
    }

    fn device(&self) -> &dyn RenderDevice {
        match self {
            Self::Cpu(device) => device,
            Self::Gpu(device) => device,
        }
    }

    fn device_mut(&mut self) -> &mut dyn RenderDevice {
        match self {
            Self::Cpu(device) => device,
            Self::Gpu(device) => device,
        }
    }
}

impl RenderDevice for RenderDeviceKind {
    fn state(&self) -> DeviceState {
        self.device().state()
    }

    fn initialize(&mut self, texture_store: &dyn TextureStore, abort_switch: &AbortSwitch) -> bool {
        self.device_mut().initialize(texture_store, abort_switch)
    }

    fn build_or_update_acceleration_structure(&mut self) -> bool {
        self.device_mut().build_or_update_acceleration_structure()
    }

    fn render_frame(
        &mut self,
        tile_callback_factory: Option<&dyn TileCallbackFactory>,
        texture_store: &dyn TextureStore,
        abort_switch: &AbortSwitch,
    ) -> FrameStatus {
        self.device_mut()
            .render_frame(tile_callback_factory, texture_store, abort_switch)
    }

    fn print_settings(&self) {
        self.device().print_settings();
    }

    fn shutdown(&mut self) {
        self.device_mut().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{module_dir, ReadyTextures, TestProject};
    use lumen_gpu::mock::MockDriver;

    fn env(devices: usize) -> Arc<AcceleratorEnvironment> {
        Arc::new(AcceleratorEnvironment::new(Arc::new(MockDriver::with_devices(devices))))
    }

    #[test]
    fn state_transitions() {
        assert!(DeviceState::Initialized.can_build());
        assert!(DeviceState::GraphBuilt.can_build());
        assert!(!DeviceState::Constructed.can_build());
        assert!(DeviceState::GraphBuilt.can_render());
        assert!(!DeviceState::Rendering.can_render());
        assert!(!DeviceState::TornDown.can_render());
    }

    #[test]
    fn cpu_is_used_when_requested() {
        let dir = module_dir();
        let settings = RenderSettings::default()
            .module_dir(dir.path())
            .device(DeviceChoice::Cpu)
            .rendering_threads(2);
        let device = RenderDeviceKind::create(TestProject::shared(), settings, &env(1)).unwrap();
        assert!(!device.is_gpu());
    }

    #[test]
    fn accelerator_is_preferred() {
        let dir = module_dir();
        let settings = RenderSettings::default().module_dir(dir.path());
        let device = RenderDeviceKind::create(TestProject::shared(), settings, &env(1)).unwrap();
        assert!(device.is_gpu());
        assert_eq!(device.state(), DeviceState::Constructed);
    }

    #[test]
    fn falls_back_without_accelerator() {
        let dir = module_dir();
        let settings = RenderSettings::default()
            .module_dir(dir.path())
            .rendering_threads(1);
        let mut device =
            RenderDeviceKind::create(TestProject::shared(), settings, &env(0)).unwrap();
        assert!(!device.is_gpu());

        let abort = AbortSwitch::new();
        assert!(device.initialize(&ReadyTextures(true), &abort));
        assert!(device.build_or_update_acceleration_structure());
        assert_eq!(
            device.render_frame(None, &ReadyTextures(true), &abort),
            FrameStatus::Completed
        );
    }

    #[test]
    fn no_fallback_keeps_accelerator_device() {
        let dir = module_dir();
        let settings = RenderSettings::default()
            .module_dir(dir.path())
            .fallback_to_cpu(false);
        let mut device =
            RenderDeviceKind::create(TestProject::shared(), settings, &env(0)).unwrap();
        assert!(device.is_gpu());

        let abort = AbortSwitch::new();
        assert!(!device.initialize(&ReadyTextures(true), &abort));
        assert_eq!(
            device.render_frame(None, &ReadyTextures(true), &abort),
            FrameStatus::Aborted
        );
    }
}
