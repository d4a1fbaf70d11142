//! In-memory driver for tests.
//!
//! Follows the same primary-context rules as a real driver and counts every
//! resource it hands out, so tests can assert on leaks and call counts.
//! Module images are text: each `.entry <name>` line exports a function and
//! any `.error` token makes the image invalid.

use std::thread::ThreadId;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::capabilities::{ComputeMode, DeviceAttributes};
use crate::driver::{
    AcceleratorDriver, ContextHandle, DevicePtr, DriverResult, DriverStatus, ModuleHandle,
};

/// Driver call that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    Init,
    DeviceCount,
    Retain,
    MemAlloc,
    MemFree,
    ModuleLoad,
    Launch,
}

/// Attributes of a typical mock device with `memory_mb` of memory.
pub fn mock_device(name: &str, memory_mb: u64) -> DeviceAttributes {
    DeviceAttributes {
        name: name.to_string(),
        compute_capability: (7, 5),
        compute_mode: ComputeMode::Default,
        total_memory: memory_mb * 1024 * 1024,
        max_threads_per_block: 1024,
        max_block_dim: [1024, 1024, 64],
        max_grid_dim: [2_147_483_647, 65535, 65535],
        max_registers: 65536,
    }
}

struct MockModule {
    context: ContextHandle,
    functions: Vec<String>,
}

#[derive(Default)]
struct MockState {
    initialized: bool,
    decode_errors: bool,
    refcounts: Vec<usize>,
    current: HashMap<ThreadId, ContextHandle>,
    memory: HashMap<u64, (ContextHandle, Vec<u8>)>,
    modules: HashMap<u64, MockModule>,
    next_handle: u64,
    failures: HashMap<MockCall, DriverStatus>,
    launched: Vec<(String, [u32; 3])>,

    init_calls: usize,
    contexts_created: usize,
    total_allocations: usize,
    total_frees: usize,
    module_loads: usize,
}

impl MockState {
    fn take_failure(&mut self, call: MockCall) -> DriverResult<()> {
        match self.failures.remove(&call) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn require_init(&self) -> DriverResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(DriverStatus::NotInitialized)
        }
    }

    fn is_live(&self, context: ContextHandle) -> bool {
        context.0 > 0
            && self
                .refcounts
                .get((context.0 - 1) as usize)
                .is_some_and(|&count| count > 0)
    }

    fn current_live_context(&self) -> DriverResult<ContextHandle> {
        self.require_init()?;
        match self.current.get(&std::thread::current().id()) {
            Some(&context) if self.is_live(context) => Ok(context),
            _ => Err(DriverStatus::InvalidContext),
        }
    }

    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Scriptable in-memory [`AcceleratorDriver`].
pub struct MockDriver {
    devices: Vec<DeviceAttributes>,
    state: Mutex<MockState>,
}

impl MockDriver {
    /// A driver with a single device.
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// A driver with `count` identical 4 GB devices.
    pub fn with_devices(count: usize) -> Self {
        Self::from_devices(
            (0..count)
                .map(|i| mock_device(&format!("Mock Device {i}"), 4096))
                .collect(),
        )
    }

    /// A driver exposing the given devices in order.
    pub fn from_devices(devices: Vec<DeviceAttributes>) -> Self {
        let state = MockState {
            decode_errors: true,
            refcounts: vec![0; devices.len()],
            ..MockState::default()
        };
        Self {
            devices,
            state: Mutex::new(state),
        }
    }

    /// Make the next `call` fail with `status`.
    pub fn fail_next(&self, call: MockCall, status: DriverStatus) {
        self.state.lock().failures.insert(call, status);
    }

    /// Toggle whether [`AcceleratorDriver::error_string`] decodes statuses.
    pub fn set_decode_errors(&self, decode: bool) {
        self.state.lock().decode_errors = decode;
    }

    /// Number of `init` calls.
    pub fn init_calls(&self) -> usize {
        self.state.lock().init_calls
    }

    /// Number of times a primary context went from unreferenced to live.
    pub fn contexts_created(&self) -> usize {
        self.state.lock().contexts_created
    }

    /// Number of primary contexts currently referenced.
    pub fn live_contexts(&self) -> usize {
        self.state.lock().refcounts.iter().filter(|&&c| c > 0).count()
    }

    /// Outstanding references to one device's primary context.
    pub fn context_refcount(&self, ordinal: usize) -> usize {
        self.state.lock().refcounts.get(ordinal).copied().unwrap_or(0)
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Bytes currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.state.lock().memory.values().map(|(_, b)| b.len()).sum()
    }

    /// Number of successful allocations.
    pub fn total_allocations(&self) -> usize {
        self.state.lock().total_allocations
    }

    /// Number of successful frees.
    pub fn total_frees(&self) -> usize {
        self.state.lock().total_frees
    }

    /// Number of successful module loads.
    pub fn module_loads(&self) -> usize {
        self.state.lock().module_loads
    }

    /// Number of modules not yet unloaded.
    pub fn live_modules(&self) -> usize {
        self.state.lock().modules.len()
    }

    /// Successful launches in order, as (function, grid).
    pub fn launches(&self) -> Vec<(String, [u32; 3])> {
        self.state.lock().launched.clone()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorDriver for MockDriver {
    fn name(&self) -> &'static str {
        "Mock"
    }

    fn init(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.init_calls += 1;
        state.take_failure(MockCall::Init)?;
        state.initialized = true;
        Ok(())
    }

    fn device_count(&self) -> DriverResult<usize> {
        let mut state = self.state.lock();
        state.require_init()?;
        state.take_failure(MockCall::DeviceCount)?;
        Ok(self.devices.len())
    }

    fn device_attributes(&self, ordinal: usize) -> DriverResult<DeviceAttributes> {
        self.state.lock().require_init()?;
        self.devices
            .get(ordinal)
            .cloned()
            .ok_or(DriverStatus::InvalidDevice)
    }

    fn primary_context_retain(&self, ordinal: usize) -> DriverResult<ContextHandle> {
        let mut state = self.state.lock();
        state.require_init()?;
        state.take_failure(MockCall::Retain)?;

        let count = state
            .refcounts
            .get_mut(ordinal)
            .ok_or(DriverStatus::InvalidDevice)?;
        *count += 1;
        if *count == 1 {
            state.contexts_created += 1;
        }
        Ok(ContextHandle(ordinal as u64 + 1))
    }

    fn primary_context_release(&self, ordinal: usize) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.require_init()?;

        let count = state
            .refcounts
            .get_mut(ordinal)
            .ok_or(DriverStatus::InvalidDevice)?;
        if *count == 0 {
            return Err(DriverStatus::InvalidContext);
        }
        *count -= 1;

        if *count == 0 {
            // Destroying a context frees everything created in it.
            let context = ContextHandle(ordinal as u64 + 1);
            state.memory.retain(|_, (owner, _)| *owner != context);
            state.modules.retain(|_, module| module.context != context);
        }
        Ok(())
    }

    fn set_current_context(&self, context: Option<ContextHandle>) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.require_init()?;
        let thread = std::thread::current().id();

        match context {
            Some(context) if state.is_live(context) => {
                state.current.insert(thread, context);
                Ok(())
            }
            Some(_) => Err(DriverStatus::InvalidContext),
            None => {
                state.current.remove(&thread);
                Ok(())
            }
        }
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
        let context = state.current_live_context()?;
        state.take_failure(MockCall::ModuleLoad)?;

        let text = std::str::from_utf8(image).map_err(|_| DriverStatus::InvalidImage)?;
        if text.contains(".error") {
            return Err(DriverStatus::InvalidImage);
        }
        let functions = text
            .lines()
            .filter_map(|line| line.trim().strip_prefix(".entry"))
            .filter_map(|rest| rest.split(|c: char| c.is_whitespace() || c == '(').find(|s| !s.is_empty()))
            .map(str::to_string)
            .collect();

        let handle = state.next_handle();
        state.modules.insert(handle, MockModule { context, functions });
        state.module_loads += 1;
        Ok(ModuleHandle(handle))
    }

    fn module_unload(&self, module: ModuleHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.require_init()?;
        state
            .modules
            .remove(&module.0)
            .map(|_| ())
            .ok_or(DriverStatus::InvalidHandle)
    }

    fn module_has_function(&self, module: ModuleHandle, name: &str) -> DriverResult<bool> {
        let state = self.state.lock();
        let module = state.modules.get(&module.0).ok_or(DriverStatus::InvalidHandle)?;
        Ok(module.functions.iter().any(|f| f == name))
    }

    fn mem_alloc(&self, bytes: usize) -> DriverResult<DevicePtr> {
        let mut state = self.state.lock();
        let context = state.current_live_context()?;
        state.take_failure(MockCall::MemAlloc)?;
        if bytes == 0 {
            return Err(DriverStatus::InvalidValue);
        }

        let handle = state.next_handle() << 12;
        state.memory.insert(handle, (context, vec![0; bytes]));
        state.total_allocations += 1;
        Ok(DevicePtr(handle))
    }

    fn mem_free(&self, ptr: DevicePtr) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.require_init()?;
        state.take_failure(MockCall::MemFree)?;
        state.memory.remove(&ptr.0).ok_or(DriverStatus::InvalidValue)?;
        state.total_frees += 1;
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> DriverResult<()> {
        let mut state = self.state.lock();
        let (_, bytes) = state.memory.get_mut(&dst.0).ok_or(DriverStatus::InvalidValue)?;
        let target = bytes.get_mut(..src.len()).ok_or(DriverStatus::InvalidValue)?;
        target.copy_from_slice(src);
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> DriverResult<()> {
        let state = self.state.lock();
        let (_, bytes) = state.memory.get(&src.0).ok_or(DriverStatus::InvalidValue)?;
        let source = bytes.get(..dst.len()).ok_or(DriverStatus::InvalidValue)?;
        dst.copy_from_slice(source);
        Ok(())
    }

    fn launch(&self, module: ModuleHandle, function: &str, grid: [u32; 3]) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.current_live_context()?;
        state.take_failure(MockCall::Launch)?;

        let module = state.modules.get(&module.0).ok_or(DriverStatus::InvalidHandle)?;
        if !module.functions.iter().any(|f| f == function) {
            return Err(DriverStatus::NotFound);
        }
        if grid.contains(&0) {
            return Err(DriverStatus::InvalidValue);
        }
        state.launched.push((function.to_string(), grid));
        Ok(())
    }

    fn error_string(&self, status: DriverStatus) -> Option<String> {
        if !self.state.lock().decode_errors {
            return None;
        }
        match status {
            DriverStatus::Native(code) => Some(format!("native status {code}")),
            other => other.description().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_need_init() {
        let driver = MockDriver::with_devices(1);
        assert_eq!(driver.device_count(), Err(DriverStatus::NotInitialized));
        driver.init().unwrap();
        assert_eq!(driver.device_count(), Ok(1));
    }

    #[test]
    fn current_context_is_per_thread() {
        let driver = std::sync::Arc::new(MockDriver::with_devices(1));
        driver.init().unwrap();
        let context = driver.primary_context_retain(0).unwrap();
        driver.set_current_context(Some(context)).unwrap();

        let other = std::sync::Arc::clone(&driver);
        let seen = std::thread::spawn(move || other.current_context())
            .join()
            .unwrap();
        assert_eq!(seen, None);
        assert_eq!(driver.current_context(), Some(context));
    }

    #[test]
    fn module_exports_entry_lines() {
        let driver = MockDriver::with_devices(1);
        driver.init().unwrap();
        let context = driver.primary_context_retain(0).unwrap();
        driver.set_current_context(Some(context)).unwrap();

        let module = driver
            .module_load(b".entry raygen (\n.entry miss\n.func helper\n")
            .unwrap();
        assert_eq!(driver.module_has_function(module, "raygen"), Ok(true));
        assert_eq!(driver.module_has_function(module, "miss"), Ok(true));
        assert_eq!(driver.module_has_function(module, "helper"), Ok(false));
        assert_eq!(driver.launch(module, "shade", [1, 1, 1]), Err(DriverStatus::NotFound));
        driver.launch(module, "raygen", [4, 4, 1]).unwrap();
        assert_eq!(driver.launches(), vec![("raygen".to_string(), [4, 4, 1])]);
    }

    #[test]
    fn last_release_frees_context_resources() {
        let driver = MockDriver::with_devices(1);
        driver.init().unwrap();
        let context = driver.primary_context_retain(0).unwrap();
        driver.set_current_context(Some(context)).unwrap();
        driver.mem_alloc(64).unwrap();

        driver.primary_context_release(0).unwrap();
        assert_eq!(driver.live_allocations(), 0);
        assert_eq!(driver.mem_alloc(64), Err(DriverStatus::InvalidContext));
        assert_eq!(
            driver.primary_context_release(0),
            Err(DriverStatus::InvalidContext)
        );
    }
}
