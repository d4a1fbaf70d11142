//! Accelerator-side scene execution for the Lumen renderer.
//!
//! A [`SceneContext`] owns the scene graph that device programs traverse:
//! groups, transforms, geometry and materials, the acceleration structures
//! built over them and the named variables programs read. Programs are
//! materialized from a shared [`lumen_gpu::ModuleCache`].

pub mod acceleration;
pub mod buffer;
pub mod context;
pub mod graph;
pub mod handle;
pub mod program;
mod validate;

pub use acceleration::{Acceleration, AccelerationBuilder, BvhNode};
pub use buffer::{BufferKind, ElementFormat, SceneBuffer};
pub use context::{DeviceSelector, SceneConfig, SceneContext, SCENE_VARIABLE};
pub use graph::{
    AccelerationId, BufferId, Geometry, GeometryGroup, GeometryGroupId, GeometryId,
    GeometryInstance, Group, GroupId, InstanceId, Material, MaterialId, Node, ProgramId,
    Transform, TransformId, Variable,
};
pub use handle::Id;
pub use program::Program;
