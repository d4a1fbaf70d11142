//! The scene execution context.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::HashMap;
use lumen_gpu::{
    AcceleratorDriver, AcceleratorEnvironment, DeviceBuffer, DeviceRegistry, ExecutableModule,
    GpuError, ModuleCache, ProgramCompiler, Result,
};

use crate::acceleration::{Acceleration, AccelerationBuilder};
use crate::buffer::SceneBuffer;
use crate::graph::{
    AccelerationId, Geometry, GeometryGroup, GeometryInstance, Group, GroupId, Material, Node,
    ProgramId, Transform, Variable,
};
use crate::handle::Arena;
use crate::program::Program;

/// Name of the variable the root group is bound to.
pub const SCENE_VARIABLE: &str = "scene";

/// Which accelerator a context runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// The device preferred by the registry's selection policy.
    #[default]
    Auto,
    /// A specific driver ordinal.
    Ordinal(usize),
}

/// Execution parameters of a scene context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneConfig {
    /// Number of launchable entry points
    pub entry_point_count: usize,
    /// Per-thread stack size in bytes
    pub stack_size: usize,
    /// Number of ray types materials and miss programs are indexed by
    pub ray_type_count: u32,
    /// Device print buffer size, `None` to disable device printing
    pub print_buffer_size: Option<usize>,
    /// Report device exceptions
    pub exceptions_enabled: bool,
    /// Usage report detail forwarded to the log, 0 disables reports
    pub usage_report_verbosity: u8,
}

impl Default for SceneConfig {
    fn default() -> Self {
        let debug = cfg!(debug_assertions);
        Self {
            entry_point_count: 1,
            stack_size: 400,
            ray_type_count: 1,
            print_buffer_size: debug.then_some(4096),
            exceptions_enabled: debug,
            usage_report_verbosity: if debug { 3 } else { 0 },
        }
    }
}

/// Accelerator-side scene: the root group and its acceleration, every graph
/// object, the programs materialized from the module cache and the modules
/// backing them.
///
/// All device work happens on the device chosen at creation. Dropping the
/// context releases accelerations and the graph before programs and modules.
pub struct SceneContext {
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) driver: Arc<dyn AcceleratorDriver>,
    pub(crate) ordinal: usize,
    pub(crate) cache: Arc<ModuleCache>,
    pub(crate) config: SceneConfig,

    pub(crate) groups: Arena<Group>,
    pub(crate) geometry_groups: Arena<GeometryGroup>,
    pub(crate) transforms: Arena<Transform>,
    pub(crate) geometries: Arena<Geometry>,
    pub(crate) instances: Arena<GeometryInstance>,
    pub(crate) materials: Arena<Material>,
    pub(crate) accelerations: Arena<Acceleration>,
    pub(crate) buffers: Arena<SceneBuffer>,
    pub(crate) programs: Arena<Program>,
    pub(crate) modules: HashMap<String, Arc<ExecutableModule>>,
    pub(crate) variables: HashMap<String, Variable>,

    pub(crate) ray_generation: Vec<Option<ProgramId>>,
    pub(crate) exception: Vec<Option<ProgramId>>,
    pub(crate) miss: BTreeMap<u32, ProgramId>,

    pub(crate) root: GroupId,
    pub(crate) root_acceleration: AccelerationId,
    pub(crate) print_buffer: Option<DeviceBuffer<u8>>,
    pub(crate) validated: bool,
}

impl SceneContext {
    /// Create a context on the selected device with modules looked up under
    /// `module_dir`.
    pub fn new(
        env: &AcceleratorEnvironment,
        selector: DeviceSelector,
        module_dir: impl Into<PathBuf>,
        config: SceneConfig,
    ) -> Result<Self> {
        let registry = env.registry()?;
        let cache = Arc::new(ModuleCache::new(Arc::clone(env.driver()), module_dir));
        Self::with_cache(registry, selector, cache, config)
    }

    /// Create a context sharing an existing module cache.
    pub fn with_cache(
        registry: Arc<DeviceRegistry>,
        selector: DeviceSelector,
        cache: Arc<ModuleCache>,
        config: SceneConfig,
    ) -> Result<Self> {
        if config.entry_point_count == 0 || config.ray_type_count == 0 || config.stack_size == 0 {
            return Err(GpuError::InvalidState(format!(
                "invalid scene configuration {config:?}"
            )));
        }

        let ordinal = match selector {
            DeviceSelector::Auto => registry.pick_best_device()?.ordinal(),
            DeviceSelector::Ordinal(ordinal) => {
                registry.activate(ordinal)?;
                ordinal
            }
        };
        let driver = Arc::clone(registry.driver());

        let mut accelerations = Arena::default();
        let root_acceleration = accelerations.insert(Acceleration::new(
            Arc::clone(&driver),
            AccelerationBuilder::Trbvh,
        )?);
        let mut groups = Arena::default();
        let root = groups.insert(Group {
            children: Vec::new(),
            acceleration: Some(root_acceleration),
        });
        let mut variables = HashMap::new();
        variables.insert(SCENE_VARIABLE.to_string(), Variable::Node(Node::Group(root)));

        let print_buffer = config
            .print_buffer_size
            .map(|size| DeviceBuffer::new(Arc::clone(&driver), size))
            .transpose()?;

        tracing::debug!(
            "Scene context on device #{ordinal}: {} entry point(s), stack size {}, {} ray type(s)",
            config.entry_point_count,
            config.stack_size,
            config.ray_type_count
        );
        if let Some(size) = config.print_buffer_size {
            tracing::debug!("Device print buffer enabled ({size} bytes)");
        }
        if config.exceptions_enabled {
            tracing::debug!("Device exception reporting enabled");
        }

        Ok(Self {
            registry,
            driver,
            ordinal,
            cache,
            ray_generation: vec![None; config.entry_point_count],
            exception: vec![None; config.entry_point_count],
            miss: BTreeMap::new(),
            config,
            groups,
            geometry_groups: Arena::default(),
            transforms: Arena::default(),
            geometries: Arena::default(),
            instances: Arena::default(),
            materials: Arena::default(),
            accelerations,
            buffers: Arena::default(),
            programs: Arena::default(),
            modules: HashMap::new(),
            variables,
            root,
            root_acceleration,
            print_buffer,
            validated: false,
        })
    }

    /// Driver ordinal of the device this context runs on.
    pub fn device_ordinal(&self) -> usize {
        self.ordinal
    }

    /// Execution parameters.
    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Module cache programs are created from.
    pub fn cache(&self) -> &Arc<ModuleCache> {
        &self.cache
    }

    /// Device print buffer, when enabled.
    pub fn print_buffer(&self) -> Option<&DeviceBuffer<u8>> {
        self.print_buffer.as_ref()
    }

    /// Number of loaded modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Make this context's device current on the calling thread.
    pub fn activate(&self) -> Result<()> {
        self.registry.activate(self.ordinal).map(|_| ())
    }

    /// Program for `entry_point` of the module `filename`.
    ///
    /// Programs persist across [`reset_graph`](Self::reset_graph); asking for
    /// the same entry point twice returns the existing program.
    pub fn create_program(&mut self, filename: &str, entry_point: &str) -> Result<ProgramId> {
        let existing = self
            .programs
            .iter()
            .find(|(_, p)| p.filename == filename && p.entry_point == entry_point)
            .map(|(id, _)| id);
        if let Some(id) = existing {
            return Ok(id);
        }

        let cache = Arc::clone(&self.cache);
        cache.create_scene_program(self, filename, entry_point)
    }

    /// Rebuild every dirty acceleration. Returns how many were rebuilt.
    pub fn build(&mut self) -> Result<usize> {
        self.activate()?;

        let mut primitives: HashMap<AccelerationId, usize> = HashMap::new();
        for (_, group) in self.groups.iter() {
            if let Some(acceleration) = group.acceleration {
                *primitives.entry(acceleration).or_default() += group.children.len();
            }
        }
        for (_, group) in self.geometry_groups.iter() {
            if let Some(acceleration) = group.acceleration {
                let count: usize = group
                    .instances
                    .iter()
                    .filter_map(|&i| self.instances.get(i)?.geometry)
                    .filter_map(|g| self.geometries.get(g))
                    .map(|g| g.primitive_count as usize)
                    .sum();
                *primitives.entry(acceleration).or_default() += count;
            }
        }

        let verbosity = self.config.usage_report_verbosity;
        let mut rebuilt = 0;
        for (id, acceleration) in self.accelerations.iter_mut() {
            if !acceleration.is_dirty() {
                continue;
            }
            let count = primitives.get(&id).copied().unwrap_or(0);
            acceleration.rebuild(count)?;
            rebuilt += 1;
            report(
                verbosity,
                2,
                "build",
                &format!(
                    "{id:?} ({}) over {count} primitive(s), {} node(s)",
                    acceleration.builder().name(),
                    acceleration.nodes().size()
                ),
            );
        }
        Ok(rebuilt)
    }

    /// Dispatch the ray-generation program of `entry` over `width * height`
    /// threads. Dirty accelerations are rebuilt and the graph validated first.
    pub fn launch(&mut self, entry: usize, width: u32, height: u32) -> Result<()> {
        if entry >= self.config.entry_point_count {
            return Err(GpuError::InvalidState(format!(
                "entry point {entry} out of range"
            )));
        }
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidState(format!(
                "empty launch extent {width}x{height}"
            )));
        }

        self.build()?;
        if !self.validated {
            self.validate()?;
            self.validated = true;
        }

        let program = self.ray_generation[entry]
            .and_then(|id| self.programs.get(id))
            .ok_or_else(|| {
                GpuError::GraphValidation(format!("entry point {entry} has no ray generation program"))
            })?;
        report(
            self.config.usage_report_verbosity,
            3,
            "launch",
            &format!("{} over {width}x{height}", program.entry_point()),
        );
        program.launch([width, height, 1])
    }
}

fn report(verbosity: u8, level: u8, tag: &str, message: &str) {
    if verbosity >= level {
        tracing::debug!("{tag}: {message}");
    }
}

impl ProgramCompiler for SceneContext {
    type Program = ProgramId;

    fn compile_program(
        &mut self,
        filename: &str,
        source: &[u8],
        entry_point: &str,
    ) -> Result<ProgramId> {
        let module = if let Some(module) = self.modules.get(filename) {
            Arc::clone(module)
        } else {
            self.activate()?;
            let module = Arc::new(ExecutableModule::load(
                Arc::clone(&self.driver),
                filename,
                source,
            )?);
            self.modules.insert(filename.to_string(), Arc::clone(&module));
            module
        };

        if !module.has_function(entry_point)? {
            return Err(GpuError::Compilation {
                filename: filename.to_string(),
                message: format!("entry point {entry_point} not found"),
            });
        }
        Ok(self.programs.insert(Program::new(module, entry_point)))
    }
}

impl Drop for SceneContext {
    fn drop(&mut self) {
        tracing::debug!("Destroying scene context on device #{}", self.ordinal);

        self.accelerations.clear();
        self.groups.clear();
        self.geometry_groups.clear();
        self.transforms.clear();
        self.instances.clear();
        self.geometries.clear();
        self.materials.clear();
        self.buffers.clear();
        self.variables.clear();
        self.print_buffer = None;

        self.programs.clear();
        self.modules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferKind, ElementFormat};
    use lumen_gpu::mock::{mock_device, MockDriver};
    use lumen_gpu::AcceleratorDevice;

    const SCENE_MODULE: &str = ".version 6.0\n\
        .entry raygen\n\
        .entry miss\n\
        .entry exception\n\
        .entry closest_hit\n\
        .entry intersect\n\
        .entry bounds\n";

    fn quiet_config() -> SceneConfig {
        SceneConfig {
            print_buffer_size: None,
            ..SceneConfig::default()
        }
    }

    fn setup(driver: MockDriver) -> (tempfile::TempDir, Arc<MockDriver>, AcceleratorEnvironment) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scene.ptx"), SCENE_MODULE).unwrap();
        let driver = Arc::new(driver);
        let env = AcceleratorEnvironment::new(driver.clone());
        (dir, driver, env)
    }

    fn populate(ctx: &mut SceneContext, primitives: u32) -> Result<()> {
        let raygen = ctx.create_program("scene.ptx", "raygen")?;
        ctx.set_ray_generation_program(0, raygen)?;
        let miss = ctx.create_program("scene.ptx", "miss")?;
        ctx.set_miss_program(0, miss);

        let geometry = ctx.create_geometry(primitives);
        let intersect = ctx.create_program("scene.ptx", "intersect")?;
        let bounds = ctx.create_program("scene.ptx", "bounds")?;
        ctx.set_intersection_program(geometry, intersect)?;
        ctx.set_bounding_box_program(geometry, bounds)?;

        let material = ctx.create_material();
        let hit = ctx.create_program("scene.ptx", "closest_hit")?;
        ctx.set_closest_hit_program(material, 0, hit)?;

        let instance = ctx.create_geometry_instance();
        ctx.set_geometry(instance, geometry)?;
        ctx.add_material(instance, material)?;

        let group = ctx.create_geometry_group();
        let acceleration = ctx.create_acceleration(AccelerationBuilder::Trbvh)?;
        ctx.set_acceleration(Node::GeometryGroup(group), acceleration)?;
        ctx.add_geometry_instance(group, instance)?;

        let transform = ctx.create_transform(glam::Mat4::from_translation(glam::Vec3::X));
        ctx.set_transform_child(transform, Node::GeometryGroup(group))?;
        let root = ctx.root();
        ctx.add_child(root, Node::Transform(transform))
    }

    #[test]
    fn new_context_has_bound_root() {
        let (dir, driver, env) = setup(MockDriver::with_devices(1));
        let ctx = SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();

        assert_eq!(ctx.config().entry_point_count, 1);
        assert_eq!(ctx.config().stack_size, 400);
        assert_eq!(ctx.config().ray_type_count, 1);
        assert_eq!(
            ctx.variable(SCENE_VARIABLE),
            Some(&Variable::Node(Node::Group(ctx.root())))
        );
        let root_accel = ctx.acceleration(ctx.root_acceleration()).unwrap();
        assert_eq!(root_accel.builder(), AccelerationBuilder::Trbvh);
        assert!(root_accel.is_dirty());
        assert_eq!(driver.contexts_created(), 1);
        assert_eq!(driver.live_allocations(), 0);
    }

    #[test]
    fn explicit_ordinal_is_used() {
        let (dir, driver, env) = setup(MockDriver::with_devices(2));
        let ctx =
            SceneContext::new(&env, DeviceSelector::Ordinal(1), dir.path(), quiet_config()).unwrap();
        assert_eq!(ctx.device_ordinal(), 1);
        assert_eq!(driver.context_refcount(1), 1);
        assert_eq!(driver.context_refcount(0), 0);

        let missing = SceneContext::new(&env, DeviceSelector::Ordinal(7), dir.path(), quiet_config());
        assert!(missing.is_err());
    }

    #[test]
    fn auto_selection_prefers_larger_device() {
        let (dir, _driver, env) = setup(MockDriver::from_devices(vec![
            mock_device("Small", 2048),
            mock_device("Large", 8192),
        ]));
        let ctx = SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        let registry = env.registry().unwrap();
        let best: &AcceleratorDevice = registry.best_device().unwrap();
        assert_eq!(ctx.device_ordinal(), best.ordinal());
        assert_eq!(ctx.device_ordinal(), 1);
    }

    #[test]
    fn no_device_is_an_error() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(0));
        let result = SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config());
        assert!(matches!(result, Err(GpuError::NoDevice)));
    }

    #[test]
    fn debug_config_allocates_print_buffer() {
        let (dir, driver, env) = setup(MockDriver::with_devices(1));
        let config = SceneConfig {
            print_buffer_size: Some(4096),
            exceptions_enabled: true,
            ..SceneConfig::default()
        };
        let ctx = SceneContext::new(&env, DeviceSelector::Auto, dir.path(), config).unwrap();
        assert_eq!(ctx.print_buffer().map(DeviceBuffer::size), Some(4096));
        assert_eq!(driver.live_bytes(), 4096);
    }

    #[test]
    fn populated_scene_launches() {
        let (dir, driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        populate(&mut ctx, 12).unwrap();

        assert_eq!(ctx.build().unwrap(), 2);
        ctx.validate().unwrap();
        ctx.launch(0, 8, 4).unwrap();

        assert_eq!(driver.launches(), vec![("raygen".to_string(), [8, 4, 1])]);
        assert_eq!(driver.module_loads(), 1);
        assert_eq!(ctx.cache().disk_reads(), 1);
        assert_eq!(ctx.module_count(), 1);
    }

    #[test]
    fn repeated_rebuilds_do_not_leak() {
        let (dir, driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();

        populate(&mut ctx, 12).unwrap();
        ctx.build().unwrap();
        let live = driver.live_allocations();
        assert_eq!(live, 2);

        for primitives in [64, 3] {
            ctx.reset_graph();
            populate(&mut ctx, primitives).unwrap();
            ctx.build().unwrap();
            assert_eq!(driver.live_allocations(), live);
        }
        assert_eq!(driver.module_loads(), 1);
        assert_eq!(ctx.programs.len(), 5);

        drop(ctx);
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(driver.live_modules(), 0);
    }

    #[test]
    fn clean_accelerations_are_not_rebuilt() {
        let (dir, driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        populate(&mut ctx, 4).unwrap();
        ctx.build().unwrap();
        let allocations = driver.total_allocations();

        assert_eq!(ctx.build().unwrap(), 0);
        assert_eq!(driver.total_allocations(), allocations);

        let root_accel = ctx.root_acceleration();
        ctx.mark_dirty(root_accel).unwrap();
        assert_eq!(ctx.build().unwrap(), 1);
        assert_eq!(ctx.acceleration(root_accel).unwrap().builds(), 2);
    }

    #[test]
    fn reset_graph_keeps_root_and_programs() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        populate(&mut ctx, 4).unwrap();
        ctx.set_variable("exposure", 1.5_f32);

        ctx.reset_graph();
        assert!(ctx.groups.contains(ctx.root()));
        assert_eq!(ctx.groups.len(), 1);
        assert_eq!(ctx.accelerations.len(), 1);
        assert_eq!(ctx.instances.len(), 0);
        assert_eq!(ctx.programs.len(), 5);
        assert!(ctx.variable("exposure").is_none());
        assert!(ctx.variable(SCENE_VARIABLE).is_some());
    }

    #[test]
    fn validation_reports_missing_ray_generation() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let ctx = SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        let err = ctx.validate().unwrap_err();
        assert!(matches!(err, GpuError::GraphValidation(_)));
        assert!(err.to_string().contains("no ray generation program"));
    }

    #[test]
    fn validation_reports_structural_defects() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        populate(&mut ctx, 4).unwrap();
        ctx.validate().unwrap();

        let instance = ctx.create_geometry_instance();
        assert!(ctx.validate().unwrap_err().to_string().contains("has no geometry"));

        let geometry = ctx.create_geometry(1);
        ctx.set_geometry(instance, geometry).unwrap();
        assert!(ctx.validate().unwrap_err().to_string().contains("has no materials"));

        let material = ctx.create_material();
        ctx.add_material(instance, material).unwrap();
        assert!(ctx
            .validate()
            .unwrap_err()
            .to_string()
            .contains("has no intersection program"));
    }

    #[test]
    fn validation_reports_group_without_acceleration() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        populate(&mut ctx, 4).unwrap();

        let group = ctx.create_group();
        let root = ctx.root();
        ctx.add_child(root, Node::Group(group)).unwrap();
        assert!(ctx.validate().unwrap_err().to_string().contains("has no acceleration"));
    }

    #[test]
    fn validation_reports_dangling_handles() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        populate(&mut ctx, 4).unwrap();
        let stale = ctx.create_geometry_group();

        ctx.reset_graph();
        let raygen = ctx.create_program("scene.ptx", "raygen").unwrap();
        ctx.set_ray_generation_program(0, raygen).unwrap();
        let root = ctx.root();
        ctx.add_child(root, Node::GeometryGroup(stale)).unwrap();

        let message = ctx.validate().unwrap_err().to_string();
        assert!(message.contains("references missing"), "{message}");
    }

    #[test]
    fn validation_reports_ray_type_out_of_range() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        populate(&mut ctx, 4).unwrap();
        let miss = ctx.create_program("scene.ptx", "miss").unwrap();
        ctx.set_miss_program(1, miss);

        let message = ctx.validate().unwrap_err().to_string();
        assert!(message.contains("ray type 1"), "{message}");
    }

    #[test]
    fn validation_reports_unbound_required_variable() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        populate(&mut ctx, 4).unwrap();
        let raygen = ctx.create_program("scene.ptx", "raygen").unwrap();
        ctx.require_variable(raygen, "output_buffer").unwrap();

        let message = ctx.validate().unwrap_err().to_string();
        assert!(message.contains("'output_buffer'"), "{message}");

        let output = ctx
            .create_buffer_2d(BufferKind::OUTPUT, ElementFormat::Float4, 8, 4)
            .unwrap();
        ctx.set_variable("output_buffer", output);
        ctx.validate().unwrap();
        assert_eq!(ctx.read_buffer(output).unwrap().len(), 8 * 4 * 16);
        assert!(ctx.write_buffer(output, &[0; 512]).is_err());
    }

    #[test]
    fn required_variables_do_not_outlive_reset() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();

        for _ in 0..3 {
            ctx.reset_graph();
            populate(&mut ctx, 4).unwrap();
            let raygen = ctx.create_program("scene.ptx", "raygen").unwrap();
            ctx.require_variable(raygen, "output").unwrap();
            ctx.require_variable(raygen, "output").unwrap();
            ctx.set_variable("output", 1.0_f32);
            ctx.validate().unwrap();
            assert_eq!(ctx.program(raygen).unwrap().required_variables(), ["output"]);
        }

        ctx.reset_graph();
        populate(&mut ctx, 4).unwrap();
        let intersect = ctx.create_program("scene.ptx", "intersect").unwrap();
        ctx.set_ray_generation_program(0, intersect).unwrap();
        ctx.validate().unwrap();
        assert!(ctx.variable("output").is_none());
    }

    #[test]
    fn launch_validates_first() {
        let (dir, driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        assert!(matches!(ctx.launch(0, 4, 4), Err(GpuError::GraphValidation(_))));
        assert!(ctx.launch(1, 4, 4).is_err());
        assert!(driver.launches().is_empty());
    }

    #[test]
    fn program_errors() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();

        let missing = ctx.create_program("absent.ptx", "raygen").unwrap_err();
        assert!(missing.to_string().contains("absent.ptx"));

        let unknown_entry = ctx.create_program("scene.ptx", "shade").unwrap_err();
        assert!(matches!(unknown_entry, GpuError::Compilation { .. }));
        assert!(unknown_entry.to_string().contains("shade"));
    }

    #[test]
    fn repeated_program_requests_share_one_program() {
        let (dir, driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        let a = ctx.create_program("scene.ptx", "raygen").unwrap();
        let b = ctx.create_program("scene.ptx", "raygen").unwrap();
        let c = ctx.create_program("scene.ptx", "miss").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ctx.program(c).unwrap().entry_point(), "miss");
        assert_eq!(driver.module_loads(), 1);
    }

    #[test]
    fn transforms_need_no_acceleration() {
        let (dir, _driver, env) = setup(MockDriver::with_devices(1));
        let mut ctx =
            SceneContext::new(&env, DeviceSelector::Auto, dir.path(), quiet_config()).unwrap();
        let transform = ctx.create_transform(glam::Mat4::IDENTITY);
        let accel = ctx.create_acceleration(AccelerationBuilder::Bvh).unwrap();
        assert!(ctx.set_acceleration(Node::Transform(transform), accel).is_err());
        assert_eq!(ctx.transform_matrix(transform), Some(glam::Mat4::IDENTITY));
    }
}
