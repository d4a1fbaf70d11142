//! GPU error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::driver::{AcceleratorDriver, DriverStatus};

/// A failed driver call, with the driver's decoded message when available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    driver: &'static str,
    status: DriverStatus,
    message: Option<String>,
}

impl DriverError {
    /// Decode a failed status through the driver that produced it.
    pub fn new(driver: &dyn AcceleratorDriver, status: DriverStatus) -> Self {
        Self {
            driver: driver.name(),
            status,
            message: driver.error_string(status),
        }
    }

    /// Name of the driver that reported the failure.
    pub fn driver(&self) -> &'static str {
        self.driver
    }

    /// Raw status returned by the driver.
    pub fn status(&self) -> DriverStatus {
        self.status
    }

    /// Decoded message, if the driver could describe the status.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} error: {}.", self.driver, message),
            None => write!(f, "Unknown {} error.", self.driver),
        }
    }
}

impl std::error::Error for DriverError {}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// No supported accelerator is available.
    #[error("No accelerator found")]
    NoDevice,

    /// A module file is missing or unreadable.
    #[error("Cannot load module file {}.", path.display())]
    ModuleNotFound { path: PathBuf },

    /// The driver or execution environment rejected a module or program.
    #[error("Failed to compile {filename}: {message}")]
    Compilation { filename: String, message: String },

    /// The scene graph is structurally invalid.
    #[error("Scene graph validation failed: {0}")]
    GraphValidation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
