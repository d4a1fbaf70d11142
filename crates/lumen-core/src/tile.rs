//! Frame subdivision into tiles.

use crate::types::FrameSize;

/// A rectangular region of the frame rendered as one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    /// Row-major tile index within the frame.
    pub index: usize,
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Tile {
    /// Number of pixels covered by this tile.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Row-major tiling of a frame. Edge tiles are clipped to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    frame: FrameSize,
    tile_width: u32,
    tile_height: u32,
    tiles_x: u32,
    tiles_y: u32,
}

impl TileLayout {
    /// Create a layout. Zero tile dimensions are clamped to one pixel.
    pub fn new(frame: FrameSize, tile_width: u32, tile_height: u32) -> Self {
        let tile_width = tile_width.max(1);
        let tile_height = tile_height.max(1);

        Self {
            frame,
            tile_width,
            tile_height,
            tiles_x: frame.width.div_ceil(tile_width),
            tiles_y: frame.height.div_ceil(tile_height),
        }
    }

    /// Create a layout with square tiles.
    pub fn square(frame: FrameSize, tile_size: u32) -> Self {
        Self::new(frame, tile_size, tile_size)
    }

    /// Frame being tiled.
    pub fn frame(&self) -> FrameSize {
        self.frame
    }

    /// Total number of tiles.
    pub fn tile_count(&self) -> usize {
        self.tiles_x as usize * self.tiles_y as usize
    }

    /// Get a tile by row-major index.
    pub fn tile(&self, index: usize) -> Option<Tile> {
        if index >= self.tile_count() {
            return None;
        }

        let tx = (index % self.tiles_x as usize) as u32;
        let ty = (index / self.tiles_x as usize) as u32;
        let x = tx * self.tile_width;
        let y = ty * self.tile_height;

        Some(Tile {
            index,
            x,
            y,
            width: self.tile_width.min(self.frame.width - x),
            height: self.tile_height.min(self.frame.height - y),
        })
    }

    /// Iterate over all tiles in row-major order.
    pub fn tiles(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.tile_count()).filter_map(|i| self.tile(i))
    }
}
