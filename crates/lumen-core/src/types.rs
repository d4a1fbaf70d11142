//! Frame types and the contracts render devices consume.

use crate::abort::AbortSwitch;
use crate::tile::Tile;

/// Output frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    /// Create a frame size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in the frame.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Outcome of a `render_frame` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Every tile was rendered.
    Completed,
    /// The frame stopped early, either on request or because of an error.
    Aborted,
}

impl FrameStatus {
    /// Check if the frame was aborted.
    pub fn is_aborted(self) -> bool {
        self == Self::Aborted
    }
}

/// Receives tile progress notifications.
///
/// Render devices may call these from several worker threads at once.
pub trait TileCallback: Send + Sync {
    /// Called before a tile is rendered.
    fn on_tile_begin(&self, _tile: &Tile) {}

    /// Called after a tile finished rendering.
    fn on_tile_end(&self, _tile: &Tile) {}
}

/// Creates the tile callback for a frame.
pub trait TileCallbackFactory: Send + Sync {
    /// Create a callback for the frame about to be rendered.
    fn create(&self) -> Box<dyn TileCallback>;
}

/// Texture cache shared by render devices.
pub trait TextureStore: Send + Sync {
    /// Warm the cache before rendering starts.
    ///
    /// Returns `false` if the store is not ready (for example, when the
    /// abort switch fired while loading).
    fn prefetch(&self, abort_switch: &AbortSwitch) -> bool;
}
