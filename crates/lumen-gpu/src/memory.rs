//! Typed device memory.

use std::marker::PhantomData;
use std::sync::Arc;

use bytemuck::Pod;

use crate::driver::{AcceleratorDriver, DevicePtr, DriverResultExt};
use crate::error::{GpuError, Result};

/// An exclusively-owned device allocation of `size` elements of `T`.
///
/// `size() == 0` always means there is no backing allocation, including
/// after a failed [`reset`](Self::reset).
pub struct DeviceBuffer<T: Pod> {
    driver: Arc<dyn AcceleratorDriver>,
    ptr: DevicePtr,
    size: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceBuffer<T> {
    /// Allocate a buffer of `size` elements in the calling thread's current
    /// context. A zero size allocates nothing.
    pub fn new(driver: Arc<dyn AcceleratorDriver>, size: usize) -> Result<Self> {
        let mut buffer = Self {
            driver,
            ptr: DevicePtr::NULL,
            size: 0,
            _marker: PhantomData,
        };
        buffer.reset(size)?;
        Ok(buffer)
    }

    /// Release the current allocation, if any, then allocate exactly `size`
    /// elements when `size > 0`.
    ///
    /// On failure the buffer is left empty.
    pub fn reset(&mut self, size: usize) -> Result<()> {
        self.release()?;

        if size == 0 {
            return Ok(());
        }

        let bytes = size.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
            GpuError::InvalidState(format!("buffer of {size} elements overflows usize"))
        })?;

        self.ptr = self.driver.mem_alloc(bytes).check(self.driver.as_ref())?;
        self.size = size;
        Ok(())
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if the buffer has no allocation.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Size of the allocation in bytes.
    pub fn byte_size(&self) -> usize {
        self.size * std::mem::size_of::<T>()
    }

    /// Device address of the first element, null when empty.
    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Copy `data` into the buffer. `data` must hold exactly `size()` elements.
    pub fn upload(&mut self, data: &[T]) -> Result<()> {
        if data.len() != self.size {
            return Err(GpuError::InvalidState(format!(
                "upload of {} elements into buffer of {}",
                data.len(),
                self.size
            )));
        }
        if self.is_empty() {
            return Ok(());
        }

        self.driver
            .memcpy_htod(self.ptr, bytemuck::cast_slice(data))
            .check(self.driver.as_ref())
    }

    /// Copy the buffer contents back to the host.
    pub fn download(&self) -> Result<Vec<T>> {
        let mut data = vec![T::zeroed(); self.size];
        if !self.is_empty() {
            self.driver
                .memcpy_dtoh(bytemuck::cast_slice_mut(&mut data), self.ptr)
                .check(self.driver.as_ref())?;
        }
        Ok(data)
    }

    /// Free the allocation. The buffer is empty afterwards even if the free
    /// call fails.
    fn release(&mut self) -> Result<()> {
        let ptr = std::mem::replace(&mut self.ptr, DevicePtr::NULL);
        self.size = 0;

        if ptr.is_null() {
            return Ok(());
        }
        self.driver.mem_free(ptr).check(self.driver.as_ref())
    }
}

impl<T: Pod> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to free device buffer: {e}");
        }
    }
}

impl<T: Pod> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}
