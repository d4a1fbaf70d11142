//! Scene graph objects, factories and wiring.

use std::collections::BTreeMap;

use glam::{Mat4, UVec2, Vec3};
use lumen_gpu::{GpuError, Result};

use crate::acceleration::{Acceleration, AccelerationBuilder};
use crate::buffer::{BufferKind, ElementFormat, SceneBuffer};
use crate::context::SceneContext;
use crate::handle::Id;
use crate::program::Program;

pub type GroupId = Id<Group>;
pub type GeometryGroupId = Id<GeometryGroup>;
pub type TransformId = Id<Transform>;
pub type GeometryId = Id<Geometry>;
pub type InstanceId = Id<GeometryInstance>;
pub type MaterialId = Id<Material>;
pub type AccelerationId = Id<Acceleration>;
pub type BufferId = Id<SceneBuffer>;
pub type ProgramId = Id<Program>;

/// A graph node that can be the child of a group or transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Group(GroupId),
    GeometryGroup(GeometryGroupId),
    Transform(TransformId),
}

/// Interior node over other nodes.
#[derive(Debug, Default)]
pub struct Group {
    pub(crate) children: Vec<Node>,
    pub(crate) acceleration: Option<AccelerationId>,
}

/// Leaf group over geometry instances.
#[derive(Debug, Default)]
pub struct GeometryGroup {
    pub(crate) instances: Vec<InstanceId>,
    pub(crate) acceleration: Option<AccelerationId>,
}

/// Affine transform applied to a single child.
#[derive(Debug)]
pub struct Transform {
    pub(crate) matrix: Mat4,
    pub(crate) child: Option<Node>,
}

/// Primitives defined by intersection and bounding-box programs.
#[derive(Debug, Default)]
pub struct Geometry {
    pub(crate) primitive_count: u32,
    pub(crate) intersection: Option<ProgramId>,
    pub(crate) bounding_box: Option<ProgramId>,
}

/// Geometry bound to its materials.
#[derive(Debug, Default)]
pub struct GeometryInstance {
    pub(crate) geometry: Option<GeometryId>,
    pub(crate) materials: Vec<MaterialId>,
}

/// Hit programs per ray type.
#[derive(Debug, Default)]
pub struct Material {
    pub(crate) closest_hit: BTreeMap<u32, ProgramId>,
    pub(crate) any_hit: BTreeMap<u32, ProgramId>,
}

/// Value bound to a named context variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Variable {
    Node(Node),
    Buffer(BufferId),
    Int(i32),
    UInt(u32),
    UInt2(UVec2),
    Float(f32),
    Float3(Vec3),
    Matrix(Mat4),
}

macro_rules! variable_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Variable {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

variable_from! {
    Node => Node,
    BufferId => Buffer,
    i32 => Int,
    u32 => UInt,
    UVec2 => UInt2,
    f32 => Float,
    Vec3 => Float3,
    Mat4 => Matrix,
}

fn unknown<T>(id: Id<T>) -> GpuError {
    GpuError::InvalidState(format!("unknown {id:?}"))
}

impl SceneContext {
    /// Root group, bound to the `scene` variable.
    pub fn root(&self) -> GroupId {
        self.root
    }

    /// Acceleration attached to the root group.
    pub fn root_acceleration(&self) -> AccelerationId {
        self.root_acceleration
    }

    /// Create a transform with the given matrix.
    pub fn create_transform(&mut self, matrix: Mat4) -> TransformId {
        self.transforms.insert(Transform {
            matrix,
            child: None,
        })
    }

    /// Create an empty group.
    pub fn create_group(&mut self) -> GroupId {
        self.groups.insert(Group::default())
    }

    /// Create an empty geometry group.
    pub fn create_geometry_group(&mut self) -> GeometryGroupId {
        self.geometry_groups.insert(GeometryGroup::default())
    }

    /// Create a geometry with `primitive_count` primitives.
    pub fn create_geometry(&mut self, primitive_count: u32) -> GeometryId {
        self.geometries.insert(Geometry {
            primitive_count,
            ..Geometry::default()
        })
    }

    /// Create a geometry instance.
    pub fn create_geometry_instance(&mut self) -> InstanceId {
        self.instances.insert(GeometryInstance::default())
    }

    /// Create a dirty acceleration structure.
    pub fn create_acceleration(&mut self, builder: AccelerationBuilder) -> Result<AccelerationId> {
        let acceleration = Acceleration::new(self.driver.clone(), builder)?;
        Ok(self.accelerations.insert(acceleration))
    }

    /// Create a material without hit programs.
    pub fn create_material(&mut self) -> MaterialId {
        self.materials.insert(Material::default())
    }

    /// Create a 1D buffer of `width` elements.
    pub fn create_buffer_1d(
        &mut self,
        kind: BufferKind,
        format: ElementFormat,
        width: usize,
    ) -> Result<BufferId> {
        self.create_buffer_2d(kind, format, width, 1)
    }

    /// Create a 2D buffer of `width * height` elements.
    pub fn create_buffer_2d(
        &mut self,
        kind: BufferKind,
        format: ElementFormat,
        width: usize,
        height: usize,
    ) -> Result<BufferId> {
        self.activate()?;
        let buffer = SceneBuffer::new(self.driver.clone(), kind, format, width, height)?;
        Ok(self.buffers.insert(buffer))
    }

    /// Buffer by handle.
    pub fn buffer(&self, id: BufferId) -> Option<&SceneBuffer> {
        self.buffers.get(id)
    }

    /// Fill a host-writable buffer. `data` must match its byte size.
    pub fn write_buffer(&mut self, id: BufferId, data: &[u8]) -> Result<()> {
        self.buffers.get_mut(id).ok_or_else(|| unknown(id))?.write(data)
    }

    /// Read back a host-readable buffer.
    pub fn read_buffer(&self, id: BufferId) -> Result<Vec<u8>> {
        self.buffers.get(id).ok_or_else(|| unknown(id))?.read()
    }

    /// Bind a context variable, replacing any previous value.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Variable>) {
        let value = value.into();
        if matches!(value, Variable::Node(_) | Variable::Buffer(_)) {
            self.validated = false;
        }
        self.variables.insert(name.into(), value);
    }

    /// Value of a context variable.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Program by handle.
    pub fn program(&self, id: ProgramId) -> Option<&Program> {
        self.programs.get(id)
    }

    /// Acceleration by handle.
    pub fn acceleration(&self, id: AccelerationId) -> Option<&Acceleration> {
        self.accelerations.get(id)
    }

    /// Append a child to a group.
    pub fn add_child(&mut self, group: GroupId, child: Node) -> Result<()> {
        let target = self.groups.get_mut(group).ok_or_else(|| unknown(group))?;
        target.children.push(child);
        let acceleration = target.acceleration;
        self.touch(acceleration);
        Ok(())
    }

    /// Append an instance to a geometry group.
    pub fn add_geometry_instance(
        &mut self,
        group: GeometryGroupId,
        instance: InstanceId,
    ) -> Result<()> {
        let target = self
            .geometry_groups
            .get_mut(group)
            .ok_or_else(|| unknown(group))?;
        target.instances.push(instance);
        let acceleration = target.acceleration;
        self.touch(acceleration);
        Ok(())
    }

    /// Attach an acceleration to a group or geometry group.
    pub fn set_acceleration(&mut self, node: Node, acceleration: AccelerationId) -> Result<()> {
        match node {
            Node::Group(id) => {
                self.groups.get_mut(id).ok_or_else(|| unknown(id))?.acceleration =
                    Some(acceleration);
            }
            Node::GeometryGroup(id) => {
                self.geometry_groups
                    .get_mut(id)
                    .ok_or_else(|| unknown(id))?
                    .acceleration = Some(acceleration);
            }
            Node::Transform(id) => {
                return Err(GpuError::InvalidState(format!(
                    "{id:?} cannot carry an acceleration"
                )));
            }
        }
        self.touch(Some(acceleration));
        Ok(())
    }

    /// Set the single child of a transform.
    pub fn set_transform_child(&mut self, transform: TransformId, child: Node) -> Result<()> {
        self.transforms
            .get_mut(transform)
            .ok_or_else(|| unknown(transform))?
            .child = Some(child);
        self.validated = false;
        Ok(())
    }

    /// Replace a transform's matrix.
    pub fn set_transform_matrix(&mut self, transform: TransformId, matrix: Mat4) -> Result<()> {
        self.transforms
            .get_mut(transform)
            .ok_or_else(|| unknown(transform))?
            .matrix = matrix;
        Ok(())
    }

    /// Matrix of a transform.
    pub fn transform_matrix(&self, transform: TransformId) -> Option<Mat4> {
        self.transforms.get(transform).map(|t| t.matrix)
    }

    /// Bind the geometry of an instance.
    pub fn set_geometry(&mut self, instance: InstanceId, geometry: GeometryId) -> Result<()> {
        self.instances
            .get_mut(instance)
            .ok_or_else(|| unknown(instance))?
            .geometry = Some(geometry);
        self.mark_instance_owners_dirty(instance);
        Ok(())
    }

    /// Append a material to an instance.
    pub fn add_material(&mut self, instance: InstanceId, material: MaterialId) -> Result<()> {
        self.instances
            .get_mut(instance)
            .ok_or_else(|| unknown(instance))?
            .materials
            .push(material);
        self.validated = false;
        Ok(())
    }

    /// Change the primitive count of a geometry, dirtying the accelerations
    /// built over it.
    pub fn set_primitive_count(&mut self, geometry: GeometryId, count: u32) -> Result<()> {
        self.geometries
            .get_mut(geometry)
            .ok_or_else(|| unknown(geometry))?
            .primitive_count = count;

        let users: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, i)| i.geometry == Some(geometry))
            .map(|(id, _)| id)
            .collect();
        for instance in users {
            self.mark_instance_owners_dirty(instance);
        }
        Ok(())
    }

    /// Set the closest-hit program of a material for one ray type.
    pub fn set_closest_hit_program(
        &mut self,
        material: MaterialId,
        ray_type: u32,
        program: ProgramId,
    ) -> Result<()> {
        self.materials
            .get_mut(material)
            .ok_or_else(|| unknown(material))?
            .closest_hit
            .insert(ray_type, program);
        self.validated = false;
        Ok(())
    }

    /// Set the any-hit program of a material for one ray type.
    pub fn set_any_hit_program(
        &mut self,
        material: MaterialId,
        ray_type: u32,
        program: ProgramId,
    ) -> Result<()> {
        self.materials
            .get_mut(material)
            .ok_or_else(|| unknown(material))?
            .any_hit
            .insert(ray_type, program);
        self.validated = false;
        Ok(())
    }

    /// Set the ray-generation program of an entry point.
    pub fn set_ray_generation_program(&mut self, entry: usize, program: ProgramId) -> Result<()> {
        let slot = self
            .ray_generation
            .get_mut(entry)
            .ok_or_else(|| GpuError::InvalidState(format!("entry point {entry} out of range")))?;
        *slot = Some(program);
        self.validated = false;
        Ok(())
    }

    /// Set the exception program of an entry point.
    pub fn set_exception_program(&mut self, entry: usize, program: ProgramId) -> Result<()> {
        let slot = self
            .exception
            .get_mut(entry)
            .ok_or_else(|| GpuError::InvalidState(format!("entry point {entry} out of range")))?;
        *slot = Some(program);
        self.validated = false;
        Ok(())
    }

    /// Set the miss program of a ray type.
    pub fn set_miss_program(&mut self, ray_type: u32, program: ProgramId) {
        self.miss.insert(ray_type, program);
        self.validated = false;
    }

    /// Set the intersection program of a geometry.
    pub fn set_intersection_program(&mut self, geometry: GeometryId, program: ProgramId) -> Result<()> {
        self.geometries
            .get_mut(geometry)
            .ok_or_else(|| unknown(geometry))?
            .intersection = Some(program);
        self.validated = false;
        Ok(())
    }

    /// Set the bounding-box program of a geometry.
    pub fn set_bounding_box_program(&mut self, geometry: GeometryId, program: ProgramId) -> Result<()> {
        self.geometries
            .get_mut(geometry)
            .ok_or_else(|| unknown(geometry))?
            .bounding_box = Some(program);
        self.validated = false;
        Ok(())
    }

    /// Declare a context variable the program reads.
    ///
    /// Declarations last until the next [`reset_graph`](Self::reset_graph).
    pub fn require_variable(&mut self, program: ProgramId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let required = &mut self
            .programs
            .get_mut(program)
            .ok_or_else(|| unknown(program))?
            .required_variables;
        if !required.contains(&name) {
            required.push(name);
        }
        self.validated = false;
        Ok(())
    }

    /// Force a rebuild of an acceleration at the next build.
    pub fn mark_dirty(&mut self, acceleration: AccelerationId) -> Result<()> {
        self.accelerations
            .get_mut(acceleration)
            .ok_or_else(|| unknown(acceleration))?
            .mark_dirty();
        Ok(())
    }

    /// Drop every graph object except the root, its acceleration and the
    /// programs. Variable requirements of the kept programs are cleared
    /// along with the variables.
    pub fn reset_graph(&mut self) {
        let root = self.root;
        let root_acceleration = self.root_acceleration;

        self.groups.retain(|id, _| id == root);
        if let Some(group) = self.groups.get_mut(root) {
            group.children.clear();
            group.acceleration = Some(root_acceleration);
        }
        self.geometry_groups.clear();
        self.transforms.clear();
        self.geometries.clear();
        self.instances.clear();
        self.materials.clear();
        self.buffers.clear();
        self.accelerations.retain(|id, _| id == root_acceleration);
        if let Some(acceleration) = self.accelerations.get_mut(root_acceleration) {
            acceleration.mark_dirty();
        }
        self.variables.retain(|name, _| name == crate::context::SCENE_VARIABLE);
        for (_, program) in self.programs.iter_mut() {
            program.required_variables.clear();
        }
        self.validated = false;
    }

    fn touch(&mut self, acceleration: Option<AccelerationId>) {
        if let Some(acceleration) = acceleration.and_then(|id| self.accelerations.get_mut(id)) {
            acceleration.mark_dirty();
        }
        self.validated = false;
    }

    fn mark_instance_owners_dirty(&mut self, instance: InstanceId) {
        let owners: Vec<AccelerationId> = self
            .geometry_groups
            .iter()
            .filter(|(_, g)| g.instances.contains(&instance))
            .filter_map(|(_, g)| g.acceleration)
            .collect();
        for acceleration in owners {
            self.touch(Some(acceleration));
        }
        self.validated = false;
    }
}
