//! Host render device.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lumen_core::{
    AbortSwitch, Error, FrameStatus, Result, TextureStore, Tile, TileCallbackFactory, TileLayout,
};
use rayon::prelude::*;

use crate::device::{out_of_order, panic_message, DeviceState, RenderDevice};
use crate::project::Project;
use crate::settings::RenderSettings;

/// Renders tiles in parallel on a dedicated rayon pool.
pub struct CpuRenderDevice {
    project: Arc<dyn Project>,
    settings: RenderSettings,
    pool: rayon::ThreadPool,
    state: DeviceState,
}

impl CpuRenderDevice {
    /// Create the device and its worker pool.
    pub fn new(project: Arc<dyn Project>, settings: RenderSettings) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.rendering_threads)
            .thread_name(|i| format!("lumen-render-{i}"))
            .build()
            .map_err(|e| Error::InvalidParameter {
                name: "rendering_threads".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            project,
            settings,
            pool,
            state: DeviceState::Constructed,
        })
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl RenderDevice for CpuRenderDevice {
    fn state(&self) -> DeviceState {
        self.state
    }

    fn initialize(&mut self, texture_store: &dyn TextureStore, abort_switch: &AbortSwitch) -> bool {
        if self.state == DeviceState::TornDown {
            out_of_order("CPU", "initialize", self.state);
            return false;
        }
        if !texture_store.prefetch(abort_switch) {
            tracing::debug!("Texture store not ready");
            return false;
        }

        if self.state == DeviceState::Constructed {
            self.state = DeviceState::Initialized;
        }
        true
    }

    fn build_or_update_acceleration_structure(&mut self) -> bool {
        if !self.state.can_build() {
            out_of_order("CPU", "build the acceleration structure", self.state);
            return false;
        }

        match self.project.update_trace_context(self.settings.spatial_index) {
            Ok(()) => {
                self.state = DeviceState::GraphBuilt;
                true
            }
            Err(e) => {
                tracing::error!("Failed to update the trace context: {e}");
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
        if !self.state.can_render() {
            out_of_order("CPU", "render a frame", self.state);
            return FrameStatus::Aborted;
        }
        self.state = DeviceState::Rendering;

        let layout = TileLayout::square(self.project.frame_size(), self.settings.tile_size);
        let tiles: Vec<Tile> = layout.tiles().collect();
        let failed = AtomicBool::new(false);
        let project = &self.project;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pool.install(|| {
                tiles.par_iter().for_each_init(
                    || tile_callback_factory.map(|factory| factory.create()),
                    |callback, tile| {
                        if abort_switch.is_aborted() || failed.load(Ordering::Relaxed) {
                            return;
                        }
                        if let Some(callback) = callback {
                            callback.on_tile_begin(tile);
                        }
                        if let Err(e) = project.render_tile(tile, abort_switch) {
                            tracing::error!("{e}");
                            failed.store(true, Ordering::Relaxed);
                            return;
                        }
                        if let Some(callback) = callback {
                            callback.on_tile_end(tile);
                        }
                    },
                );
            });
        }));
        self.state = DeviceState::GraphBuilt;

        if let Err(payload) = outcome {
            tracing::error!("CPU rendering panicked: {}", panic_message(&*payload));
            return FrameStatus::Aborted;
        }
        if failed.into_inner() || abort_switch.is_aborted() {
            FrameStatus::Aborted
        } else {
            FrameStatus::Completed
        }
    }

    fn print_settings(&self) {
        tracing::info!(
            "CPU render device: {} thread(s), {}px tiles, {:?} spatial index",
            self.thread_count(),
            self.settings.tile_size,
            self.settings.spatial_index
        );
    }

    fn shutdown(&mut self) {
        self.state = DeviceState::TornDown;
    }
}
