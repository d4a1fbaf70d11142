//! Render device settings read from project parameters.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use lumen_core::constants::DEFAULT_TILE_SIZE;
use lumen_core::{Error, ParamArray, Result};

/// Spatial index used by the CPU trace context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatialIndexBackend {
    /// The renderer's own BVH.
    #[default]
    Builtin,
    /// Embree scenes.
    Embree,
}

/// Which render device a project should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceChoice {
    /// Render on the host.
    Cpu,
    /// Best available accelerator.
    #[default]
    Auto,
    /// Accelerator with the given driver ordinal.
    Ordinal(usize),
}

impl FromStr for DeviceChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            other => other
                .parse()
                .map(Self::Ordinal)
                .map_err(|_| format!("expected \"cpu\", \"auto\" or a device ordinal, got \"{other}\"")),
        }
    }
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Auto => f.write_str("auto"),
            Self::Ordinal(ordinal) => write!(f, "{ordinal}"),
        }
    }
}

/// Configuration shared by the CPU and accelerator render devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    /// Spatial index for CPU tracing
    pub spatial_index: SpatialIndexBackend,
    /// Directory device modules are loaded from
    pub module_dir: PathBuf,
    /// Module holding the ray-generation program
    pub raygen_module: String,
    /// Tile edge length in pixels
    pub tile_size: u32,
    /// Worker threads for CPU rendering, 0 for one per core
    pub rendering_threads: usize,
    /// Requested device
    pub device: DeviceChoice,
    /// Render on the host when no accelerator can be used
    pub fallback_to_cpu: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            spatial_index: SpatialIndexBackend::Builtin,
            module_dir: PathBuf::from("modules"),
            raygen_module: "raygen.spv".to_string(),
            tile_size: DEFAULT_TILE_SIZE,
            rendering_threads: 0,
            device: DeviceChoice::Auto,
            fallback_to_cpu: true,
        }
    }
}

impl RenderSettings {
    /// Read settings from project parameters.
    ///
    /// Absent or malformed optional values fall back to their defaults. A
    /// malformed `device` or a zero `tile_size` is an error.
    pub fn from_params(params: &ParamArray) -> Result<Self> {
        let defaults = Self::default();

        let spatial_index = if params.get_optional("use_embree", false) {
            SpatialIndexBackend::Embree
        } else {
            SpatialIndexBackend::Builtin
        };

        let tile_size = params.get_optional("tile_size", defaults.tile_size);
        if tile_size == 0 {
            return Err(Error::InvalidParameter {
                name: "tile_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let device = if params.contains("device") {
            params.get("device")?
        } else {
            defaults.device
        };

        Ok(Self {
            spatial_index,
            module_dir: params.get_optional("module_dir", defaults.module_dir),
            raygen_module: params.get_optional("raygen_module", defaults.raygen_module),
            tile_size,
            rendering_threads: params.get_optional("rendering_threads", defaults.rendering_threads),
            device,
            fallback_to_cpu: params.get_optional("fallback_to_cpu", defaults.fallback_to_cpu),
        })
    }

    /// Set the spatial index backend.
    pub fn spatial_index(mut self, backend: SpatialIndexBackend) -> Self {
        self.spatial_index = backend;
        self
    }

    /// Set the module directory.
    pub fn module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.module_dir = dir.into();
        self
    }

    /// Set the ray-generation module filename.
    pub fn raygen_module(mut self, filename: impl Into<String>) -> Self {
        self.raygen_module = filename.into();
        self
    }

    /// Set the tile edge length. Zero is clamped to one pixel.
    pub fn tile_size(mut self, size: u32) -> Self {
        self.tile_size = size.max(1);
        self
    }

    /// Set the CPU worker count.
    pub fn rendering_threads(mut self, threads: usize) -> Self {
        self.rendering_threads = threads;
        self
    }

    /// Set the requested device.
    pub fn device(mut self, device: DeviceChoice) -> Self {
        self.device = device;
        self
    }

    /// Enable or disable the CPU fallback.
    pub fn fallback_to_cpu(mut self, enabled: bool) -> Self {
        self.fallback_to_cpu = enabled;
        self
    }
}
