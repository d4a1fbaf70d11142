//! The project collaborator render devices draw scene data from.

use lumen_accel::SceneContext;
use lumen_core::{AbortSwitch, FrameSize, Result, Tile};

use crate::settings::SpatialIndexBackend;

/// Scene data and host-side tracing for one project.
///
/// Render devices hold the project for their whole lifetime and call it from
/// the controlling thread, except [`render_tile`](Project::render_tile) which
/// CPU workers call concurrently.
pub trait Project: Send + Sync {
    /// Output frame dimensions.
    fn frame_size(&self) -> FrameSize;

    /// Rebuild the host trace context with the given spatial index.
    fn update_trace_context(&self, backend: SpatialIndexBackend) -> Result<()>;

    /// Populate an accelerator scene graph that was just reset.
    fn populate_scene(&self, scene: &mut SceneContext) -> lumen_gpu::Result<()>;

    /// Render one tile on the host.
    fn render_tile(&self, tile: &Tile, abort_switch: &AbortSwitch) -> Result<()>;
}
