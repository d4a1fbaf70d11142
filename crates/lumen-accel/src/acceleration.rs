//! Acceleration structures over groups.

use std::str::FromStr;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use lumen_gpu::{AcceleratorDriver, DeviceBuffer, GpuError, Result};

/// Construction algorithm of an acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccelerationBuilder {
    /// Linear list, no hierarchy.
    NoAccel,
    /// Classic binned BVH.
    Bvh,
    /// Spatial-split BVH.
    Sbvh,
    /// Treelet-restructured BVH.
    #[default]
    Trbvh,
}

impl AccelerationBuilder {
    /// Builder name as used in scene descriptions.
    pub fn name(self) -> &'static str {
        match self {
            Self::NoAccel => "NoAccel",
            Self::Bvh => "Bvh",
            Self::Sbvh => "Sbvh",
            Self::Trbvh => "Trbvh",
        }
    }

    /// Number of nodes reserved for `primitives` primitives.
    pub fn node_count(self, primitives: usize) -> usize {
        if primitives == 0 {
            return 0;
        }
        match self {
            Self::NoAccel => 0,
            Self::Bvh | Self::Trbvh => 2 * primitives - 1,
            // Spatial splits can reference a primitive from several leaves.
            Self::Sbvh => 2 * (2 * primitives - 1),
        }
    }
}

impl FromStr for AccelerationBuilder {
    type Err = GpuError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NoAccel" => Ok(Self::NoAccel),
            "Bvh" => Ok(Self::Bvh),
            "Sbvh" => Ok(Self::Sbvh),
            "Trbvh" => Ok(Self::Trbvh),
            other => Err(GpuError::InvalidState(format!(
                "unknown acceleration builder {other}"
            ))),
        }
    }
}

/// Device-side BVH node.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub min: [f32; 3],
    pub left_or_first: u32,
    pub max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    /// Node with inverted bounds, refitted by the traversal kernels.
    pub const EMPTY: Self = Self {
        min: [f32::INFINITY; 3],
        left_or_first: 0,
        max: [f32::NEG_INFINITY; 3],
        count: 0,
    };
}

/// An acceleration structure and its device node storage.
pub struct Acceleration {
    builder: AccelerationBuilder,
    dirty: bool,
    primitive_count: usize,
    builds: usize,
    nodes: DeviceBuffer<BvhNode>,
}

impl Acceleration {
    pub(crate) fn new(
        driver: Arc<dyn AcceleratorDriver>,
        builder: AccelerationBuilder,
    ) -> Result<Self> {
        Ok(Self {
            builder,
            dirty: true,
            primitive_count: 0,
            builds: 0,
            nodes: DeviceBuffer::new(driver, 0)?,
        })
    }

    /// Construction algorithm.
    pub fn builder(&self) -> AccelerationBuilder {
        self.builder
    }

    /// Check if the structure needs a rebuild before the next launch.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Primitive count at the last build.
    pub fn primitive_count(&self) -> usize {
        self.primitive_count
    }

    /// Number of completed builds.
    pub fn builds(&self) -> usize {
        self.builds
    }

    /// Device node storage.
    pub fn nodes(&self) -> &DeviceBuffer<BvhNode> {
        &self.nodes
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Rebuild the node storage for `primitives` primitives.
    ///
    /// The previous allocation is released before the new one is made. On
    /// failure the structure stays dirty with no node storage.
    pub(crate) fn rebuild(&mut self, primitives: usize) -> Result<()> {
        let count = self.builder.node_count(primitives);
        self.nodes.reset(count)?;
        if count > 0 {
            self.nodes.upload(&vec![BvhNode::EMPTY; count])?;
        }

        self.primitive_count = primitives;
        self.builds += 1;
        self.dirty = false;
        Ok(())
    }
}
