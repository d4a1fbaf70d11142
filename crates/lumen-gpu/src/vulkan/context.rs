//! Per-device Vulkan state behind a primary context.

use std::ffi::CStr;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};

use crate::driver::{DriverResult, DriverStatus};

/// A device buffer and its memory.
pub(super) struct VulkanBuffer {
    pub ordinal: usize,
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: usize,
}

/// Logical device, compute queue and allocator for one physical device.
pub(super) struct VulkanContext {
    pub device: ash::Device,
    pub refcount: usize,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    allocator: Option<Allocator>,
}

impl VulkanContext {
    /// Create the logical device and submission resources.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn create(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> DriverResult<Self> {
        let queue_family =
            find_compute_queue_family(instance, physical_device).ok_or(DriverStatus::InvalidDevice)?;

        let queue_priority = 1.0_f32;
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(std::slice::from_ref(&queue_priority));
        let device_info =
            vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_info));
        let device = instance.create_device(physical_device, &device_info, None)?;

        match Self::create_submission(&device, queue_family) {
            Ok((command_pool, command_buffer, fence)) => {
                let allocator = Allocator::new(&AllocatorCreateDesc {
                    instance: instance.clone(),
                    device: device.clone(),
                    physical_device,
                    debug_settings: gpu_allocator::AllocatorDebugSettings {
                        log_memory_information: cfg!(debug_assertions),
                        log_leaks_on_shutdown: true,
                        store_stack_traces: false,
                        log_allocations: false,
                        log_frees: false,
                        log_stack_traces: false,
                    },
                    buffer_device_address: false,
                    allocation_sizes: Default::default(),
                });

                match allocator {
                    Ok(allocator) => Ok(Self {
                        queue: device.get_device_queue(queue_family, 0),
                        device,
                        refcount: 1,
                        command_pool,
                        command_buffer,
                        fence,
                        allocator: Some(allocator),
                    }),
                    Err(e) => {
                        tracing::warn!("Failed to create device allocator: {e}");
                        device.destroy_fence(fence, None);
                        device.destroy_command_pool(command_pool, None);
                        device.destroy_device(None);
                        Err(allocation_status(&e))
                    }
                }
            }
            Err(status) => {
                device.destroy_device(None);
                Err(status)
            }
        }
    }

    unsafe fn create_submission(
        device: &ash::Device,
        queue_family: u32,
    ) -> DriverResult<(vk::CommandPool, vk::CommandBuffer, vk::Fence)> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = device.create_command_pool(&pool_info, None)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match device.allocate_command_buffers(&alloc_info) {
            Ok(buffers) => buffers[0],
            Err(e) => {
                device.destroy_command_pool(pool, None);
                return Err(e.into());
            }
        };

        match device.create_fence(&vk::FenceCreateInfo::default(), None) {
            Ok(fence) => Ok((pool, command_buffer, fence)),
            Err(e) => {
                device.destroy_command_pool(pool, None);
                Err(e.into())
            }
        }
    }

    /// Create a host-visible storage buffer of `size` bytes.
    pub fn create_buffer(&mut self, ordinal: usize, size: usize) -> DriverResult<VulkanBuffer> {
        let allocator = self.allocator.as_mut().ok_or(DriverStatus::InvalidContext)?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size as u64)
            .usage(
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name: "device buffer",
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                tracing::debug!("Device allocation of {size} bytes failed: {e}");
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(allocation_status(&e));
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            let _ = allocator.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        Ok(VulkanBuffer {
            ordinal,
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Free a buffer created by this context.
    pub fn free_buffer(&mut self, mut buffer: VulkanBuffer) -> DriverResult<()> {
        let allocator = self.allocator.as_mut().ok_or(DriverStatus::InvalidContext)?;
        let freed = match buffer.allocation.take() {
            Some(allocation) => allocator.free(allocation).map_err(|e| allocation_status(&e)),
            None => Ok(()),
        };
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        freed
    }

    /// Create a compute pipeline for one entry point of a shader module.
    pub fn create_pipeline(
        &self,
        module: vk::ShaderModule,
        entry_point: &CStr,
    ) -> DriverResult<(vk::Pipeline, vk::PipelineLayout)> {
        let layout = unsafe {
            self.device
                .create_pipeline_layout(&vk::PipelineLayoutCreateInfo::default(), None)?
        };

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry_point);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        match pipelines {
            Ok(pipelines) => Ok((pipelines[0], layout)),
            Err((_, e)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                Err(e.into())
            }
        }
    }

    /// Record, submit and wait for a single dispatch.
    pub fn dispatch(&self, pipeline: vk::Pipeline, grid: [u32; 3]) -> DriverResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let command_buffers = [self.command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);

        unsafe {
            self.device.reset_fences(&[self.fence])?;
            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)?;
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline,
            );
            self.device
                .cmd_dispatch(self.command_buffer, grid[0], grid[1], grid[2]);
            self.device.end_command_buffer(self.command_buffer)?;
            self.device.queue_submit(self.queue, &[submit], self.fence)?;
            self.device.wait_for_fences(&[self.fence], true, u64::MAX)?;
        }
        Ok(())
    }

    /// Destroy the device and everything created from it.
    ///
    /// # Safety
    /// All buffers, modules and pipelines of this context must already be
    /// destroyed.
    pub unsafe fn destroy(&mut self) {
        let _ = self.device.device_wait_idle();

        // The allocator frees its memory blocks, so it goes before the device.
        self.allocator.take();

        self.device.destroy_fence(self.fence, None);
        self.device.destroy_command_pool(self.command_pool, None);
        self.device.destroy_device(None);
    }
}

/// Prefer a dedicated compute family, fall back to any that supports compute.
///
/// # Safety
/// The instance and physical device must be valid.
pub(super) unsafe fn find_compute_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);

    let dedicated = families.iter().position(|f| {
        f.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    });
    let any = || {
        families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
    };

    dedicated.or_else(any).and_then(|i| u32::try_from(i).ok())
}

fn allocation_status(error: &AllocationError) -> DriverStatus {
    match error {
        AllocationError::OutOfMemory => DriverStatus::OutOfMemory,
        _ => DriverStatus::InvalidValue,
    }
}
