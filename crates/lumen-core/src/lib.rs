//! Core types and collaborator traits for the Lumen renderer.
//!
//! This crate provides the foundational types shared by every render device:
//! - Frame and tile geometry
//! - The abort switch polled during rendering
//! - Project parameter lookup
//! - Contracts for the collaborators a render device drives
//!   (tile callbacks, texture store)
//! - Common error types

pub mod abort;
pub mod error;
pub mod params;
pub mod tile;
pub mod types;

pub use abort::AbortSwitch;
pub use error::{Error, Result};
pub use params::ParamArray;
pub use tile::{Tile, TileLayout};
pub use types::{FrameSize, FrameStatus, TextureStore, TileCallback, TileCallbackFactory};

/// Renderer-wide constants
pub mod constants {
    /// Default tile edge length in pixels
    pub const DEFAULT_TILE_SIZE: u32 = 32;
}
