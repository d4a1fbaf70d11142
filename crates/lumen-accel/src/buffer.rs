//! Scene buffers shared between host and device programs.

use std::sync::Arc;

use bitflags::bitflags;
use lumen_gpu::{AcceleratorDriver, DeviceBuffer, GpuError, Result};

bitflags! {
    /// Access pattern of a scene buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferKind: u32 {
        /// Written by the host, read by device programs.
        const INPUT = 1 << 0;
        /// Written by device programs, read back by the host.
        const OUTPUT = 1 << 1;
        /// Both directions.
        const INPUT_OUTPUT = Self::INPUT.bits() | Self::OUTPUT.bits();
        /// Never read back; the host may not map it.
        const DEVICE_LOCAL = 1 << 2;
    }
}

/// Element layout of a scene buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementFormat {
    Float,
    Float2,
    Float3,
    Float4,
    Int,
    Int2,
    Int3,
    Int4,
    UnsignedInt,
    UnsignedByte4,
    /// Opaque element of the given byte size.
    User(usize),
}

impl ElementFormat {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Float | Self::Int | Self::UnsignedInt | Self::UnsignedByte4 => 4,
            Self::Float2 | Self::Int2 => 8,
            Self::Float3 | Self::Int3 => 12,
            Self::Float4 | Self::Int4 => 16,
            Self::User(size) => size,
        }
    }
}

/// A 1D or 2D buffer of formatted elements.
pub struct SceneBuffer {
    kind: BufferKind,
    format: ElementFormat,
    width: usize,
    height: usize,
    storage: DeviceBuffer<u8>,
}

impl SceneBuffer {
    pub(crate) fn new(
        driver: Arc<dyn AcceleratorDriver>,
        kind: BufferKind,
        format: ElementFormat,
        width: usize,
        height: usize,
    ) -> Result<Self> {
        if format.size() == 0 {
            return Err(GpuError::InvalidState(
                "buffer element size must be non-zero".to_string(),
            ));
        }
        let bytes = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(format.size()))
            .ok_or_else(|| {
                GpuError::InvalidState(format!("buffer of {width}x{height} elements is too large"))
            })?;

        Ok(Self {
            kind,
            format,
            width,
            height,
            storage: DeviceBuffer::new(driver, bytes)?,
        })
    }

    /// Access pattern.
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Element layout.
    pub fn format(&self) -> ElementFormat {
        self.format
    }

    /// Dimensions in elements; `height` is 1 for 1D buffers.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Size in bytes.
    pub fn byte_size(&self) -> usize {
        self.storage.size()
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.kind.contains(BufferKind::INPUT) {
            return Err(GpuError::InvalidState(
                "buffer is not host-writable".to_string(),
            ));
        }
        self.storage.upload(data)
    }

    pub(crate) fn read(&self) -> Result<Vec<u8>> {
        if !self.kind.contains(BufferKind::OUTPUT) || self.kind.contains(BufferKind::DEVICE_LOCAL) {
            return Err(GpuError::InvalidState(
                "buffer is not host-readable".to_string(),
            ));
        }
        self.storage.download()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_sizes() {
        assert_eq!(ElementFormat::Float3.size(), 12);
        assert_eq!(ElementFormat::UnsignedByte4.size(), 4);
        assert_eq!(ElementFormat::User(48).size(), 48);
    }

    #[test]
    fn input_output_covers_both() {
        assert!(BufferKind::INPUT_OUTPUT.contains(BufferKind::INPUT));
        assert!(BufferKind::INPUT_OUTPUT.contains(BufferKind::OUTPUT));
        assert!(!BufferKind::INPUT.contains(BufferKind::OUTPUT));
    }
}
