//! Collaborators shared by the render device tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lumen_accel::{AccelerationBuilder, Node, SceneContext};
use lumen_core::{
    AbortSwitch, Error, FrameSize, Result, TextureStore, Tile, TileCallback, TileCallbackFactory,
};
use parking_lot::Mutex;

use crate::project::Project;
use crate::settings::SpatialIndexBackend;

pub const RAYGEN_MODULE: &str = ".entry raygen\n\
    .entry intersect\n\
    .entry bounds\n\
    .entry closest_hit\n";

/// Temporary module directory holding `raygen.spv`.
pub fn module_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("raygen.spv"), RAYGEN_MODULE).unwrap();
    dir
}

pub struct ReadyTextures(pub bool);

impl TextureStore for ReadyTextures {
    fn prefetch(&self, abort_switch: &AbortSwitch) -> bool {
        self.0 && !abort_switch.is_aborted()
    }
}

#[derive(Default)]
pub struct TestProject {
    pub frame: FrameSize,
    pub primitives: u32,
    pub failing_tile: Option<usize>,
    pub fail_populate: bool,
    pub backends: Mutex<Vec<SpatialIndexBackend>>,
    pub populate_calls: AtomicUsize,
    pub rendered_tiles: AtomicUsize,
}

impl TestProject {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            frame: FrameSize::new(width, height),
            primitives: 8,
            ..Self::default()
        }
    }

    pub fn shared() -> Arc<dyn Project> {
        Arc::new(Self::new(64, 64))
    }
}

impl Project for TestProject {
    fn frame_size(&self) -> FrameSize {
        self.frame
    }

    fn update_trace_context(&self, backend: SpatialIndexBackend) -> Result<()> {
        self.backends.lock().push(backend);
        Ok(())
    }

    fn populate_scene(&self, scene: &mut SceneContext) -> lumen_gpu::Result<()> {
        self.populate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_populate {
            return Err(lumen_gpu::GpuError::GraphValidation(
                "scene has no camera".to_string(),
            ));
        }

        let geometry = scene.create_geometry(self.primitives);
        let intersect = scene.create_program("raygen.spv", "intersect")?;
        let bounds = scene.create_program("raygen.spv", "bounds")?;
        scene.set_intersection_program(geometry, intersect)?;
        scene.set_bounding_box_program(geometry, bounds)?;

        let material = scene.create_material();
        let hit = scene.create_program("raygen.spv", "closest_hit")?;
        scene.set_closest_hit_program(material, 0, hit)?;

        let instance = scene.create_geometry_instance();
        scene.set_geometry(instance, geometry)?;
        scene.add_material(instance, material)?;

        let group = scene.create_geometry_group();
        let acceleration = scene.create_acceleration(AccelerationBuilder::Trbvh)?;
        scene.set_acceleration(Node::GeometryGroup(group), acceleration)?;
        scene.add_geometry_instance(group, instance)?;

        let root = scene.root();
        scene.add_child(root, Node::GeometryGroup(group))
    }

    fn render_tile(&self, tile: &Tile, _abort_switch: &AbortSwitch) -> Result<()> {
        if self.failing_tile == Some(tile.index) {
            return Err(Error::Tile {
                index: tile.index,
                reason: "shading failed".to_string(),
            });
        }
        self.rendered_tiles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts tile notifications across every callback it creates.
#[derive(Default)]
pub struct CountingFactory {
    pub created: AtomicUsize,
    pub begins: Arc<AtomicUsize>,
    pub ends: Arc<AtomicUsize>,
    pub panic_on_begin: bool,
}

struct CountingCallback {
    begins: Arc<AtomicUsize>,
    ends: Arc<AtomicUsize>,
    panic_on_begin: bool,
}

impl TileCallback for CountingCallback {
    fn on_tile_begin(&self, tile: &Tile) {
        assert!(!self.panic_on_begin, "callback failed on tile {}", tile.index);
        self.begins.fetch_add(1, Ordering::SeqCst);
    }

    fn on_tile_end(&self, _tile: &Tile) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

impl TileCallbackFactory for CountingFactory {
    fn create(&self) -> Box<dyn TileCallback> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(CountingCallback {
            begins: Arc::clone(&self.begins),
            ends: Arc::clone(&self.ends),
            panic_on_begin: self.panic_on_begin,
        })
    }
}
