//! Vulkan compute driver.
//!
//! Maps the primary-context model onto Vulkan: a context is a logical device
//! with one compute queue, created on first retain and destroyed when the
//! last reference is released. Modules are SPIR-V binaries whose compute
//! entry points are the launchable functions. Device memory is host-visible
//! so copies go through mapped pointers.

mod context;
mod instance;
pub mod spirv;

use std::ffi::CString;
use std::thread::ThreadId;

use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::capabilities::{ComputeMode, DeviceAttributes};
use crate::driver::{
    AcceleratorDriver, ContextHandle, DevicePtr, DriverResult, DriverStatus, ModuleHandle,
};
use context::{find_compute_queue_family, VulkanBuffer, VulkanContext};
use instance::create_instance;

impl From<vk::Result> for DriverStatus {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::OutOfMemory
            }
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::NotInitialized,
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => Self::NoDevice,
            vk::Result::ERROR_DEVICE_LOST => Self::LaunchFailed,
            vk::Result::ERROR_INVALID_SHADER_NV => Self::InvalidImage,
            other => Self::Native(other.as_raw()),
        }
    }
}

/// Message for Vulkan results without a generic equivalent.
fn vulkan_message(result: vk::Result) -> Option<&'static str> {
    let message = match result {
        vk::Result::TIMEOUT => "wait timed out",
        vk::Result::ERROR_MEMORY_MAP_FAILED => "memory map failed",
        vk::Result::ERROR_LAYER_NOT_PRESENT => "layer not present",
        vk::Result::ERROR_EXTENSION_NOT_PRESENT => "extension not present",
        vk::Result::ERROR_FEATURE_NOT_PRESENT => "feature not present",
        vk::Result::ERROR_TOO_MANY_OBJECTS => "too many objects",
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED => "format not supported",
        vk::Result::ERROR_FRAGMENTED_POOL => "fragmented pool",
        vk::Result::ERROR_OUT_OF_POOL_MEMORY => "out of pool memory",
        _ => return None,
    };
    Some(message)
}

struct Loaded {
    // Keeps the loader library alive for the instance.
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_devices: Vec<vk::PhysicalDevice>,
}

struct VulkanModule {
    ordinal: usize,
    module: vk::ShaderModule,
    entry_points: Vec<String>,
    pipelines: HashMap<String, (vk::Pipeline, vk::PipelineLayout)>,
}

#[derive(Default)]
struct VulkanState {
    loaded: Option<Loaded>,
    contexts: HashMap<usize, VulkanContext>,
    current: HashMap<ThreadId, ContextHandle>,
    modules: HashMap<ModuleHandle, VulkanModule>,
    buffers: HashMap<DevicePtr, VulkanBuffer>,
    next_handle: u64,
}

impl VulkanState {
    fn loaded(&self) -> DriverResult<&Loaded> {
        self.loaded.as_ref().ok_or(DriverStatus::NotInitialized)
    }

    fn current_ordinal(&self) -> DriverResult<usize> {
        self.loaded()?;
        let context = self
            .current
            .get(&std::thread::current().id())
            .ok_or(DriverStatus::InvalidContext)?;
        let ordinal = ordinal_of(*context)?;
        if self.contexts.contains_key(&ordinal) {
            Ok(ordinal)
        } else {
            Err(DriverStatus::InvalidContext)
        }
    }

    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Destroy every module and buffer created on `ordinal`, then the
    /// context itself.
    fn destroy_context(&mut self, ordinal: usize, mut context: VulkanContext) {
        let modules: Vec<ModuleHandle> = self
            .modules
            .iter()
            .filter(|(_, m)| m.ordinal == ordinal)
            .map(|(h, _)| *h)
            .collect();
        let buffers: Vec<DevicePtr> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.ordinal == ordinal)
            .map(|(p, _)| *p)
            .collect();

        if !modules.is_empty() || !buffers.is_empty() {
            tracing::warn!(
                "Destroying context of device #{ordinal} with {} module(s) and {} buffer(s) alive",
                modules.len(),
                buffers.len()
            );
        }

        for handle in modules {
            if let Some(module) = self.modules.remove(&handle) {
                destroy_module(&context, module);
            }
        }
        for ptr in buffers {
            if let Some(buffer) = self.buffers.remove(&ptr) {
                let _ = context.free_buffer(buffer);
            }
        }

        unsafe { context.destroy() };
    }
}

fn ordinal_of(context: ContextHandle) -> DriverResult<usize> {
    context
        .0
        .checked_sub(1)
        .and_then(|o| usize::try_from(o).ok())
        .ok_or(DriverStatus::InvalidContext)
}

fn destroy_module(context: &VulkanContext, module: VulkanModule) {
    unsafe {
        for (pipeline, layout) in module.pipelines.into_values() {
            context.device.destroy_pipeline(pipeline, None);
            context.device.destroy_pipeline_layout(layout, None);
        }
        context.device.destroy_shader_module(module.module, None);
    }
}

/// [`AcceleratorDriver`] backed by Vulkan compute.
pub struct VulkanDriver {
    app_name: String,
    validation: bool,
    state: Mutex<VulkanState>,
}

impl Default for VulkanDriver {
    fn default() -> Self {
        Self {
            app_name: "Lumen".to_string(),
            validation: cfg!(debug_assertions),
            state: Mutex::new(VulkanState::default()),
        }
    }
}

impl VulkanDriver {
    /// Create an unloaded driver. The Vulkan loader is opened by `init`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name reported to the loader.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }
}

impl AcceleratorDriver for VulkanDriver {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn init(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.loaded.is_some() {
            return Ok(());
        }

        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            tracing::warn!("Failed to load Vulkan: {e}");
            DriverStatus::NotInitialized
        })?;
        let instance = unsafe { create_instance(&entry, &self.app_name, self.validation) }?;

        let physical_devices = match unsafe { instance.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e.into());
            }
        };
        tracing::debug!("Vulkan reports {} physical device(s)", physical_devices.len());

        state.loaded = Some(Loaded {
            entry,
            instance,
            physical_devices,
        });
        Ok(())
    }

    fn device_count(&self) -> DriverResult<usize> {
        Ok(self.state.lock().loaded()?.physical_devices.len())
    }

    fn device_attributes(&self, ordinal: usize) -> DriverResult<DeviceAttributes> {
        let state = self.state.lock();
        let loaded = state.loaded()?;
        let physical_device = *loaded
            .physical_devices
            .get(ordinal)
            .ok_or(DriverStatus::InvalidDevice)?;
        let instance = &loaded.instance;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let has_compute =
            unsafe { find_compute_queue_family(instance, physical_device) }.is_some();

        let name = properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let total_memory = memory
            .memory_heaps
            .iter()
            .take(memory.memory_heap_count as usize)
            .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|h| h.size)
            .sum();
        let limits = properties.limits;

        Ok(DeviceAttributes {
            name,
            compute_capability: (
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version),
            ),
            compute_mode: if has_compute {
                ComputeMode::Default
            } else {
                ComputeMode::Prohibited
            },
            total_memory,
            max_threads_per_block: limits.max_compute_work_group_invocations,
            max_block_dim: limits.max_compute_work_group_size,
            max_grid_dim: limits.max_compute_work_group_count,
            max_registers: 0,
        })
    }

    fn primary_context_retain(&self, ordinal: usize) -> DriverResult<ContextHandle> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let loaded = state.loaded.as_ref().ok_or(DriverStatus::NotInitialized)?;
        let physical_device = *loaded
            .physical_devices
            .get(ordinal)
            .ok_or(DriverStatus::InvalidDevice)?;

        if let Some(context) = state.contexts.get_mut(&ordinal) {
            context.refcount += 1;
        } else {
            let context = unsafe { VulkanContext::create(&loaded.instance, physical_device) }?;
            tracing::debug!("Created Vulkan device for #{ordinal}");
            state.contexts.insert(ordinal, context);
        }
        Ok(ContextHandle(ordinal as u64 + 1))
    }

    fn primary_context_release(&self, ordinal: usize) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.loaded()?;

        let context = state
            .contexts
            .get_mut(&ordinal)
            .ok_or(DriverStatus::InvalidContext)?;
        context.refcount -= 1;
        if context.refcount == 0 {
            if let Some(context) = state.contexts.remove(&ordinal) {
                state.destroy_context(ordinal, context);
                tracing::debug!("Destroyed Vulkan device for #{ordinal}");
            }
        }
        Ok(())
    }

    fn set_current_context(&self, context: Option<ContextHandle>) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.loaded()?;
        let thread = std::thread::current().id();

        match context {
            Some(context) => {
                let ordinal = ordinal_of(context)?;
                if !state.contexts.contains_key(&ordinal) {
                    return Err(DriverStatus::InvalidContext);
                }
                state.current.insert(thread, context);
            }
            None => {
                state.current.remove(&thread);
            }
        }
        Ok(())
    }

    fn current_context(&self) -> Option<ContextHandle> {
        self.state
            .lock()
            .current
            .get(&std::thread::current().id())
            .copied()
    }

    fn module_load(&self, image: &[u8]) -> DriverResult<ModuleHandle> {
        let mut state = self.state.lock();
        let ordinal = state.current_ordinal()?;

        let words = spirv::words_from_bytes(image).ok_or(DriverStatus::InvalidImage)?;
        let entry_points = spirv::entry_points(&words).ok_or(DriverStatus::InvalidImage)?;

        let context = state
            .contexts
            .get(&ordinal)
            .ok_or(DriverStatus::InvalidContext)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { context.device.create_shader_module(&info, None)? };

        let handle = ModuleHandle(state.next_handle());
        state.modules.insert(
            handle,
            VulkanModule {
                ordinal,
                module,
                entry_points,
                pipelines: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn module_unload(&self, module: ModuleHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        let module = state
            .modules
            .remove(&module)
            .ok_or(DriverStatus::InvalidHandle)?;
        let context = state
            .contexts
            .get(&module.ordinal)
            .ok_or(DriverStatus::InvalidContext)?;
        destroy_module(context, module);
        Ok(())
    }

    fn module_has_function(&self, module: ModuleHandle, name: &str) -> DriverResult<bool> {
        let state = self.state.lock();
        let module = state
            .modules
            .get(&module)
            .ok_or(DriverStatus::InvalidHandle)?;
        Ok(module.entry_points.iter().any(|e| e == name))
    }

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        if bytes == 0 {
            return Err(DriverStatus::InvalidValue);
        }
        let mut state = self.state.lock();
        let ordinal = state.current_ordinal()?;

        let context = state
            .contexts
            .get_mut(&ordinal)
            .ok_or(DriverStatus::InvalidContext)?;
        let buffer = context.create_buffer(ordinal, bytes)?;

        let ptr = DevicePtr(state.next_handle());
        state.buffers.insert(ptr, buffer);
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .remove(&ptr)
            .ok_or(DriverStatus::InvalidValue)?;
        let context = state
            .contexts
            .get_mut(&buffer.ordinal)
            .ok_or(DriverStatus::InvalidContext)?;
        context.free_buffer(buffer)
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(&dst)
            .ok_or(DriverStatus::InvalidValue)?;
        if src.len() > buffer.size {
            return Err(DriverStatus::InvalidValue);
        }
        let mapped = buffer
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or(DriverStatus::InvalidValue)?;
        mapped[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        let state = self.state.lock();
        let buffer = state.buffers.get(&src).ok_or(DriverStatus::InvalidValue)?;
        if dst.len() > buffer.size {
            return Err(DriverStatus::InvalidValue);
        }
        let mapped = buffer
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .ok_or(DriverStatus::InvalidValue)?;
        dst.copy_from_slice(&mapped[..dst.len()]);
        Ok(())
    }

    fn launch(&self, module: ModuleHandle, function: &str, grid: [u32; 3]) -> DriverResult<()> {
        if grid.contains(&0) {
            return Err(DriverStatus::InvalidValue);
        }
        let mut guard = self.state.lock();
        let ordinal = guard.current_ordinal()?;
        let state = &mut *guard;

        let module = state
            .modules
            .get_mut(&module)
            .ok_or(DriverStatus::InvalidHandle)?;
        if module.ordinal != ordinal {
            return Err(DriverStatus::InvalidContext);
        }
        if !module.entry_points.iter().any(|e| e == function) {
            return Err(DriverStatus::NotFound);
        }
        let context = state
            .contexts
            .get(&ordinal)
            .ok_or(DriverStatus::InvalidContext)?;

        let pipeline = match module.pipelines.get(function) {
            Some((pipeline, _)) => *pipeline,
            None => {
                let name = CString::new(function).map_err(|_| DriverStatus::InvalidValue)?;
                let created = context.create_pipeline(module.module, &name)?;
                module.pipelines.insert(function.to_string(), created);
                created.0
            }
        };

        context.dispatch(pipeline, grid)
    }

    fn error_string(&self, status: DriverStatus) -> Option<String> {
        match status {
            DriverStatus::Native(code) => {
                vulkan_message(vk::Result::from_raw(code)).map(str::to_string)
            }
            other => other.description().map(str::to_string),
        }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let ordinals: Vec<usize> = state.contexts.keys().copied().collect();
        for ordinal in ordinals {
            if let Some(context) = state.contexts.remove(&ordinal) {
                state.destroy_context(ordinal, context);
            }
        }

        if let Some(loaded) = state.loaded.take() {
            unsafe { loaded.instance.destroy_instance(None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_before_init_fail() {
        let driver = VulkanDriver::new().validation(false);
        assert_eq!(driver.device_count(), Err(DriverStatus::NotInitialized));
        assert_eq!(driver.mem_alloc(16), Err(DriverStatus::NotInitialized));
        assert_eq!(driver.current_context(), None);
    }

    #[test]
    fn vulkan_results_map_to_statuses() {
        assert_eq!(
            DriverStatus::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            DriverStatus::OutOfMemory
        );
        assert_eq!(
            DriverStatus::from(vk::Result::ERROR_TOO_MANY_OBJECTS),
            DriverStatus::Native(vk::Result::ERROR_TOO_MANY_OBJECTS.as_raw())
        );
    }

    #[test]
    fn native_codes_decode() {
        let driver = VulkanDriver::new();
        let known = DriverStatus::Native(vk::Result::ERROR_TOO_MANY_OBJECTS.as_raw());
        assert_eq!(driver.error_string(known).as_deref(), Some("too many objects"));
        assert_eq!(driver.error_string(DriverStatus::Native(-123_456)), None);
        assert_eq!(
            driver.error_string(DriverStatus::OutOfMemory).as_deref(),
            Some("out of memory")
        );
    }
}
