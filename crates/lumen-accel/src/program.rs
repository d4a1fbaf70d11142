//! Device programs materialized from cached modules.

use std::sync::Arc;

use lumen_gpu::{ExecutableModule, Result};

/// One entry point of a loaded module.
pub struct Program {
    pub(crate) filename: String,
    pub(crate) entry_point: String,
    pub(crate) module: Arc<ExecutableModule>,
    pub(crate) required_variables: Vec<String>,
}

impl Program {
    pub(crate) fn new(module: Arc<ExecutableModule>, entry_point: &str) -> Self {
        Self {
            filename: module.filename().to_string(),
            entry_point: entry_point.to_string(),
            module,
            required_variables: Vec::new(),
        }
    }

    /// Module file the program came from.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Entry symbol inside the module.
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Context variables that must be bound before launch.
    pub fn required_variables(&self) -> &[String] {
        &self.required_variables
    }

    /// Dispatch this program over a grid on the calling thread's context.
    pub(crate) fn launch(&self, grid: [u32; 3]) -> Result<()> {
        self.module.launch(&self.entry_point, grid)
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("filename", &self.filename)
            .field("entry_point", &self.entry_point)
            .finish_non_exhaustive()
    }
}
