//! Cache of device module sources.
//!
//! Module files (PTX text, SPIR-V binaries) live under one root directory and
//! are assumed immutable for the process lifetime, so each filename is read
//! from disk at most once. Lookup-or-insert runs under a single lock; two
//! threads asking for the same file concurrently cause one read.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::driver::{AcceleratorDriver, DriverResultExt, ModuleHandle};
use crate::error::{GpuError, Result};

/// Builds program objects from module sources.
///
/// Implemented by execution environments that compile modules themselves
/// instead of going through a raw driver module.
pub trait ProgramCompiler {
    /// Program object produced by this compiler.
    type Program;

    /// Compile `entry_point` from the module `filename`.
    fn compile_program(
        &mut self,
        filename: &str,
        source: &[u8],
        entry_point: &str,
    ) -> Result<Self::Program>;
}

/// Memoized module sources rooted at a search directory.
pub struct ModuleCache {
    root: PathBuf,
    driver: Arc<dyn AcceleratorDriver>,
    sources: Mutex<HashMap<String, Arc<[u8]>>>,
    disk_reads: AtomicUsize,
}

impl ModuleCache {
    /// Create an empty cache over `root`.
    pub fn new(driver: Arc<dyn AcceleratorDriver>, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            driver,
            sources: Mutex::new(HashMap::new()),
            disk_reads: AtomicUsize::new(0),
        }
    }

    /// Search directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Source of a module, read from `<root>/<filename>` on first request.
    ///
    /// `filename` must be relative and stay below the root.
    pub fn get_source(&self, filename: &str) -> Result<Arc<[u8]>> {
        let mut sources = self.sources.lock();
        if let Some(source) = sources.get(filename) {
            return Ok(Arc::clone(source));
        }

        let path = self.resolve(filename)?;
        let bytes = std::fs::read(&path).map_err(|e| {
            tracing::debug!("Failed to read {}: {e}", path.display());
            GpuError::ModuleNotFound { path: path.clone() }
        })?;
        self.disk_reads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Loaded module {} ({} bytes)", path.display(), bytes.len());

        let source: Arc<[u8]> = bytes.into();
        sources.insert(filename.to_string(), Arc::clone(&source));
        Ok(source)
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf> {
        let relative = Path::new(filename);
        let below_root = relative.components().next().is_some()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !below_root {
            tracing::debug!("Rejected module path {filename} outside {}", self.root.display());
            return Err(GpuError::ModuleNotFound {
                path: relative.to_path_buf(),
            });
        }
        Ok(self.root.join(relative))
    }

    /// Load a module into the calling thread's current context.
    ///
    /// The module is unloaded when the last handle is dropped.
    pub fn create_executable_module(&self, filename: &str) -> Result<Arc<ExecutableModule>> {
        let source = self.get_source(filename)?;
        ExecutableModule::load(Arc::clone(&self.driver), filename, &source).map(Arc::new)
    }

    /// Resolve a module's source and have `compiler` build a program from it.
    pub fn create_scene_program<C: ProgramCompiler>(
        &self,
        compiler: &mut C,
        filename: &str,
        entry_point: &str,
    ) -> Result<C::Program> {
        let source = self.get_source(filename)?;
        compiler.compile_program(filename, &source, entry_point)
    }

    /// Number of cached files.
    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    /// Check if nothing was cached yet.
    pub fn is_empty(&self) -> bool {
        self.sources.lock().is_empty()
    }

    /// Number of files read from disk so far.
    pub fn disk_reads(&self) -> usize {
        self.disk_reads.load(Ordering::Relaxed)
    }
}

/// A module loaded on the device.
pub struct ExecutableModule {
    driver: Arc<dyn AcceleratorDriver>,
    handle: ModuleHandle,
    filename: String,
}

impl ExecutableModule {
    /// Load a module image into the calling thread's current context.
    ///
    /// A rejected image is reported as [`GpuError::Compilation`] carrying the
    /// driver's message.
    pub fn load(driver: Arc<dyn AcceleratorDriver>, filename: &str, image: &[u8]) -> Result<Self> {
        let handle = driver
            .module_load(image)
            .check(driver.as_ref())
            .map_err(|e| GpuError::Compilation {
                filename: filename.to_string(),
                message: e.to_string(),
            })?;
        tracing::debug!("Loaded device module {filename}");

        Ok(Self {
            driver,
            handle,
            filename: filename.to_string(),
        })
    }

    /// Driver handle.
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    /// File the module was loaded from.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Check if the module exports `function`.
    pub fn has_function(&self, function: &str) -> Result<bool> {
        self.driver
            .module_has_function(self.handle, function)
            .check(self.driver.as_ref())
    }

    /// Launch `function` over a grid on the calling thread's current context.
    pub fn launch(&self, function: &str, grid: [u32; 3]) -> Result<()> {
        self.driver
            .launch(self.handle, function, grid)
            .check(self.driver.as_ref())
    }
}

impl Drop for ExecutableModule {
    fn drop(&mut self) {
        if let Err(e) = self.driver.module_unload(self.handle).check(self.driver.as_ref()) {
            tracing::warn!("Failed to unload module {}: {e}", self.filename);
        }
    }
}

impl std::fmt::Debug for ExecutableModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableModule")
            .field("handle", &self.handle)
            .field("filename", &self.filename)
            .finish()
    }
}
