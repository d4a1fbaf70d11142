//! Accelerator render device.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use glam::UVec2;
use lumen_accel::{DeviceSelector, SceneConfig, SceneContext};
use lumen_core::{AbortSwitch, FrameStatus, TextureStore, TileCallbackFactory, TileLayout};
use lumen_gpu::{AcceleratorEnvironment, DeviceRegistry, GpuError, ModuleCache};

use crate::device::{out_of_order, panic_message, DeviceState, RenderDevice};
use crate::project::Project;
use crate::settings::{DeviceChoice, RenderSettings};

/// Name of the ray-generation entry point in the ray-generation module.
pub const RAYGEN_ENTRY_POINT: &str = "raygen";

/// Renders tiles by launching the ray-generation program on one accelerator.
///
/// Device selection happens at construction. When no device is usable the
/// failure is logged, construction still succeeds and every later call
/// reports not-ready or [`FrameStatus::Aborted`].
pub struct GpuRenderDevice {
    scene: Option<SceneContext>,
    project: Arc<dyn Project>,
    settings: RenderSettings,
    cache: Arc<ModuleCache>,
    device: Option<(Arc<DeviceRegistry>, usize)>,
    state: DeviceState,
}

impl GpuRenderDevice {
    /// Start the driver and bind the device requested by the settings.
    pub fn new(
        project: Arc<dyn Project>,
        settings: RenderSettings,
        env: Arc<AcceleratorEnvironment>,
    ) -> Self {
        let device = match select_device(&env, settings.device) {
            Ok(device) => Some(device),
            Err(e) => {
                tracing::error!("{e}");
                None
            }
        };
        let cache = Arc::new(ModuleCache::new(
            Arc::clone(env.driver()),
            settings.module_dir.clone(),
        ));

        Self {
            scene: None,
            project,
            settings,
            cache,
            device,
            state: DeviceState::Constructed,
        }
    }

    /// Check if an accelerator is bound.
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Driver ordinal of the bound accelerator.
    pub fn device_ordinal(&self) -> Option<usize> {
        self.device.as_ref().map(|(_, ordinal)| *ordinal)
    }

    /// The scene context, once built.
    pub fn scene(&self) -> Option<&SceneContext> {
        self.scene.as_ref()
    }

    fn build_scene(&mut self) -> lumen_gpu::Result<()> {
        let (registry, ordinal) = self.device.as_ref().ok_or(GpuError::NoDevice)?;

        if self.scene.is_none() {
            let scene = SceneContext::with_cache(
                Arc::clone(registry),
                DeviceSelector::Ordinal(*ordinal),
                Arc::clone(&self.cache),
                SceneConfig::default(),
            )?;
            self.scene = Some(scene);
        }
        let scene = self
            .scene
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("scene context missing".to_string()))?;

        scene.reset_graph();
        let raygen = scene.create_program(&self.settings.raygen_module, RAYGEN_ENTRY_POINT)?;
        scene.set_ray_generation_program(0, raygen)?;
        self.project.populate_scene(scene)?;
        let rebuilt = scene.build()?;
        scene.validate()?;

        tracing::debug!("Scene graph built, {rebuilt} acceleration structure(s) rebuilt");
        Ok(())
    }

    fn render_tiles(
        &mut self,
        tile_callback_factory: Option<&dyn TileCallbackFactory>,
        abort_switch: &AbortSwitch,
    ) -> lumen_gpu::Result<FrameStatus> {
        let scene = self
            .scene
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("scene context missing".to_string()))?;
        scene.activate()?;

        let frame = self.project.frame_size();
        scene.set_variable("frame_size", UVec2::new(frame.width, frame.height));
        let callback = tile_callback_factory.map(|factory| factory.create());

        for tile in TileLayout::square(frame, self.settings.tile_size).tiles() {
            if abort_switch.is_aborted() {
                return Ok(FrameStatus::Aborted);
            }
            if let Some(callback) = &callback {
                callback.on_tile_begin(&tile);
            }

            scene.set_variable("tile_origin", UVec2::new(tile.x, tile.y));
            scene.launch(0, tile.width, tile.height)?;

            if let Some(callback) = &callback {
                callback.on_tile_end(&tile);
            }
        }
        Ok(FrameStatus::Completed)
    }
}

fn select_device(
    env: &AcceleratorEnvironment,
    choice: DeviceChoice,
) -> lumen_gpu::Result<(Arc<DeviceRegistry>, usize)> {
    let registry = env.registry()?;
    let ordinal = match choice {
        DeviceChoice::Ordinal(ordinal) => {
            registry.activate(ordinal)?;
            ordinal
        }
        DeviceChoice::Auto | DeviceChoice::Cpu => registry.pick_best_device()?.ordinal(),
    };
    if let Some(device) = registry.find(ordinal) {
        tracing::debug!("Using accelerator {}", device.summary());
    }
    Ok((registry, ordinal))
}

impl RenderDevice for GpuRenderDevice {
    fn state(&self) -> DeviceState {
        self.state
    }

    fn initialize(&mut self, texture_store: &dyn TextureStore, abort_switch: &AbortSwitch) -> bool {
        if self.state == DeviceState::TornDown {
            out_of_order("Accelerator", "initialize", self.state);
            return false;
        }
        if !self.has_device() {
            tracing::error!("{}", GpuError::NoDevice);
            return false;
        }
        if !texture_store.prefetch(abort_switch) {
            tracing::debug!("Texture store not ready");
            return false;
        }
        if let Err(e) = self.cache.get_source(&self.settings.raygen_module) {
            tracing::error!("{e}");
            return false;
        }

        if self.state == DeviceState::Constructed {
            self.state = DeviceState::Initialized;
        }
        true
    }

    fn build_or_update_acceleration_structure(&mut self) -> bool {
        if !self.state.can_build() {
            out_of_order("Accelerator", "build the scene graph", self.state);
            return false;
        }

        match self.build_scene() {
            Ok(()) => {
                self.state = DeviceState::GraphBuilt;
                true
            }
            Err(e) => {
                tracing::error!("Failed to build the scene graph: {e}");
                false
            }
        }
    }

    fn render_frame(
        &mut self,
        tile_callback_factory: Option<&dyn TileCallbackFactory>,
        _texture_store: &dyn TextureStore,
        abort_switch: &AbortSwitch,
    ) -> FrameStatus {
        if !self.has_device() {
            tracing::error!("{}", GpuError::NoDevice);
            return FrameStatus::Aborted;
        }
        if !self.state.can_render() {
            out_of_order("Accelerator", "render a frame", self.state);
            return FrameStatus::Aborted;
        }
        self.state = DeviceState::Rendering;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.render_tiles(tile_callback_factory, abort_switch)
        }));
        self.state = DeviceState::GraphBuilt;

        match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                tracing::error!("Accelerator rendering failed: {e}");
                FrameStatus::Aborted
            }
            Err(payload) => {
                tracing::error!("Accelerator rendering panicked: {}", panic_message(&*payload));
                FrameStatus::Aborted
            }
        }
    }

    fn print_settings(&self) {
        let device = self
            .device
            .as_ref()
            .and_then(|(registry, ordinal)| registry.find(*ordinal))
            .map_or_else(|| "none".to_string(), |device| device.summary());
        tracing::info!(
            "Accelerator render device: {device}, {}px tiles, modules from {}",
            self.settings.tile_size,
            self.cache.root().display()
        );
        if let Some(scene) = &self.scene {
            let config = scene.config();
            tracing::info!(
                "Scene context: {} entry point(s), stack size {}, {} ray type(s)",
                config.entry_point_count,
                config.stack_size,
                config.ray_type_count
            );
        }
    }

    fn shutdown(&mut self) {
        self.scene = None;
        self.device = None;
        self.state = DeviceState::TornDown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{module_dir, CountingFactory, ReadyTextures, TestProject};
    use lumen_core::FrameSize;
    use lumen_gpu::mock::{MockCall, MockDriver};
    use lumen_gpu::DriverStatus;
    use std::sync::atomic::Ordering;

    struct Fixture {
        dir: tempfile::TempDir,
        driver: Arc<MockDriver>,
        env: Arc<AcceleratorEnvironment>,
    }

    impl Fixture {
        fn new(devices: usize) -> Self {
            let driver = Arc::new(MockDriver::with_devices(devices));
            Self {
                dir: module_dir(),
                env: Arc::new(AcceleratorEnvironment::new(driver.clone())),
                driver,
            }
        }

        fn device(&self, project: TestProject) -> (Arc<TestProject>, GpuRenderDevice) {
            let project = Arc::new(project);
            let settings = RenderSettings::default().module_dir(self.dir.path());
            let device = GpuRenderDevice::new(project.clone(), settings, Arc::clone(&self.env));
            (project, device)
        }
    }

    fn ready(device: &mut GpuRenderDevice) {
        assert!(device.initialize(&ReadyTextures(true), &AbortSwitch::new()));
        assert!(device.build_or_update_acceleration_structure());
    }

    #[test]
    fn no_accelerator_aborts_frames() {
        let fixture = Fixture::new(0);
        let (_project, mut device) = fixture.device(TestProject::new(64, 64));
        assert!(!device.has_device());
        assert_eq!(device.state(), DeviceState::Constructed);

        let abort = AbortSwitch::new();
        assert!(!device.initialize(&ReadyTextures(true), &abort));
        assert!(!device.build_or_update_acceleration_structure());
        assert_eq!(
            device.render_frame(None, &ReadyTextures(true), &abort),
            FrameStatus::Aborted
        );
        device.print_settings();
    }

    #[test]
    fn renders_one_launch_per_tile() {
        let fixture = Fixture::new(2);
        let (project, mut device) = fixture.device(TestProject::new(80, 40));
        ready(&mut device);

        let factory = CountingFactory::default();
        let status = device.render_frame(Some(&factory), &ReadyTextures(true), &AbortSwitch::new());
        assert_eq!(status, FrameStatus::Completed);

        let launches = fixture.driver.launches();
        assert_eq!(launches.len(), 6);
        assert_eq!(launches[0], ("raygen".to_string(), [32, 32, 1]));
        assert_eq!(launches[5], ("raygen".to_string(), [16, 8, 1]));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(factory.ends.load(Ordering::SeqCst), 6);
        assert_eq!(project.populate_calls.load(Ordering::SeqCst), 1);

        let scene = device.scene().unwrap();
        assert_eq!(
            scene.variable("tile_origin"),
            Some(&lumen_accel::Variable::UInt2(UVec2::new(64, 32)))
        );
    }

    #[test]
    fn rebuilding_does_not_leak() {
        let fixture = Fixture::new(1);
        let (project, mut device) = fixture.device(TestProject::new(32, 32));
        ready(&mut device);
        let live = fixture.driver.live_allocations();

        for _ in 0..3 {
            assert!(device.build_or_update_acceleration_structure());
            assert_eq!(fixture.driver.live_allocations(), live);
        }
        assert_eq!(project.populate_calls.load(Ordering::SeqCst), 4);
        assert_eq!(fixture.driver.module_loads(), 1);
        assert_eq!(fixture.driver.contexts_created(), 1);

        device.shutdown();
        assert_eq!(fixture.driver.live_allocations(), 0);
        assert_eq!(fixture.driver.live_modules(), 0);
        assert_eq!(device.state(), DeviceState::TornDown);
    }

    #[test]
    fn render_before_build_aborts() {
        let fixture = Fixture::new(1);
        let (_project, mut device) = fixture.device(TestProject::new(32, 32));
        assert!(!device.build_or_update_acceleration_structure());
        assert!(device.initialize(&ReadyTextures(true), &AbortSwitch::new()));
        assert_eq!(
            device.render_frame(None, &ReadyTextures(true), &AbortSwitch::new()),
            FrameStatus::Aborted
        );
        assert!(fixture.driver.launches().is_empty());
    }

    #[test]
    fn abort_switch_stops_frame() {
        let fixture = Fixture::new(1);
        let (_project, mut device) = fixture.device(TestProject::new(64, 64));
        ready(&mut device);

        let abort = AbortSwitch::new();
        abort.abort();
        assert_eq!(
            device.render_frame(None, &ReadyTextures(true), &abort),
            FrameStatus::Aborted
        );
        assert!(fixture.driver.launches().is_empty());
    }

    #[test]
    fn launch_failure_aborts_frame_only() {
        let fixture = Fixture::new(1);
        let (_project, mut device) = fixture.device(TestProject::new(64, 32));
        ready(&mut device);

        fixture.driver.fail_next(MockCall::Launch, DriverStatus::LaunchFailed);
        assert_eq!(
            device.render_frame(None, &ReadyTextures(true), &AbortSwitch::new()),
            FrameStatus::Aborted
        );
        assert_eq!(device.state(), DeviceState::GraphBuilt);
        assert_eq!(
            device.render_frame(None, &ReadyTextures(true), &AbortSwitch::new()),
            FrameStatus::Completed
        );
    }

    #[test]
    fn panicking_callback_aborts_frame() {
        let fixture = Fixture::new(1);
        let (_project, mut device) = fixture.device(TestProject::new(32, 32));
        ready(&mut device);

        let factory = CountingFactory {
            panic_on_begin: true,
            ..CountingFactory::default()
        };
        assert_eq!(
            device.render_frame(Some(&factory), &ReadyTextures(true), &AbortSwitch::new()),
            FrameStatus::Aborted
        );
        assert_eq!(device.state(), DeviceState::GraphBuilt);
    }

    #[test]
    fn failed_population_reports_false() {
        let fixture = Fixture::new(1);
        let project = TestProject {
            fail_populate: true,
            ..TestProject::new(32, 32)
        };
        let (_project, mut device) = fixture.device(project);
        assert!(device.initialize(&ReadyTextures(true), &AbortSwitch::new()));
        assert!(!device.build_or_update_acceleration_structure());
        assert_eq!(device.state(), DeviceState::Initialized);
    }

    #[test]
    fn missing_raygen_module_is_not_ready() {
        let fixture = Fixture::new(1);
        let project = Arc::new(TestProject::new(32, 32));
        let settings = RenderSettings::default()
            .module_dir(fixture.dir.path())
            .raygen_module("absent.spv");
        let mut device = GpuRenderDevice::new(project, settings, Arc::clone(&fixture.env));
        assert!(device.has_device());
        assert!(!device.initialize(&ReadyTextures(true), &AbortSwitch::new()));
    }

    #[test]
    fn explicit_ordinal_is_bound() {
        let fixture = Fixture::new(3);
        let project = Arc::new(TestProject {
            frame: FrameSize::new(16, 16),
            ..TestProject::default()
        });
        let settings = RenderSettings::default()
            .module_dir(fixture.dir.path())
            .device(DeviceChoice::Ordinal(2));
        let device = GpuRenderDevice::new(project, settings, Arc::clone(&fixture.env));
        assert_eq!(device.device_ordinal(), Some(2));
        assert_eq!(fixture.driver.context_refcount(2), 1);

        let settings = RenderSettings::default().device(DeviceChoice::Ordinal(9));
        let missing = GpuRenderDevice::new(TestProject::shared(), settings, Arc::clone(&fixture.env));
        assert!(!missing.has_device());
    }
}
