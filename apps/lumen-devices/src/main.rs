//! Lumen accelerator inspector
//!
//! Lists the accelerators the Vulkan driver exposes, marks the one render
//! devices would pick, and optionally loads a module on it.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p lumen-devices -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--min-memory <MB>`: Ignore devices with less memory
//! - `--module-dir <DIR>`: Directory modules are read from (default: modules)
//! - `--module <FILE>`: Load a SPIR-V module on the selected device and list
//!   its entry points
//! - `--validation`: Enable Vulkan validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use lumen_gpu::vulkan::spirv;
use lumen_gpu::{AcceleratorEnvironment, ModuleCache, VulkanDriver};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Options {
    min_memory_mb: u64,
    module_dir: PathBuf,
    module: Option<String>,
    validation: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            min_memory_mb: 0,
            module_dir: PathBuf::from("modules"),
            module: None,
            validation: false,
        }
    }
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<Self>> {
        let mut options = Self::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => return Ok(None),
                "--min-memory" => {
                    let value = args.next().context("--min-memory needs a value")?;
                    options.min_memory_mb = value
                        .parse()
                        .with_context(|| format!("invalid memory size '{value}'"))?;
                }
                "--module-dir" => {
                    options.module_dir = args.next().context("--module-dir needs a value")?.into();
                }
                "--module" => {
                    options.module = Some(args.next().context("--module needs a value")?);
                }
                "--validation" => options.validation = true,
                other => bail!("unknown argument '{other}', see --help"),
            }
        }
        Ok(Some(options))
    }

    fn min_memory_bytes(&self) -> anyhow::Result<u64> {
        match self.min_memory_mb.checked_mul(1024 * 1024) {
            Some(bytes) => Ok(bytes),
            None => bail!("--min-memory {} MB is too large", self.min_memory_mb),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(options) = Options::parse(std::env::args().skip(1))? else {
        print_help();
        return Ok(());
    };

    let driver = Arc::new(VulkanDriver::new().validation(options.validation));
    let min_memory = options.min_memory_bytes()?;
    let env = AcceleratorEnvironment::new(driver)
        .with_device_filter(move |device| device.total_memory() >= min_memory);

    let registry = env.registry().context("failed to enumerate accelerators")?;
    info!(
        "{} of {} device(s) usable",
        registry.len(),
        registry.enumerated_count()
    );
    for device in registry.devices() {
        info!("  {}", device.summary());
    }

    let best = registry
        .pick_best_device()
        .context("no accelerator to select")?;
    info!("Selected {}", best.summary());

    if let Some(filename) = &options.module {
        let cache = ModuleCache::new(Arc::clone(env.driver()), &options.module_dir);
        let source = cache.get_source(filename)?;
        let entry_points = spirv::words_from_bytes(&source)
            .and_then(|words| spirv::entry_points(&words))
            .unwrap_or_default();

        let module = cache.create_executable_module(filename)?;
        info!("Loaded {} ({} bytes)", module.filename(), source.len());
        for entry_point in &entry_points {
            info!("  entry point {entry_point}: {}", module.has_function(entry_point)?);
        }
    }

    Ok(())
}

fn print_help() {
    eprintln!(
        "Lumen accelerator inspector

USAGE:
    lumen-devices [OPTIONS]

OPTIONS:
    --min-memory <MB>    Ignore devices with less memory
    --module-dir <DIR>   Directory modules are read from [default: modules]
    --module <FILE>      Load a SPIR-V module on the selected device
    --validation         Enable Vulkan validation layers
    -h, --help           Print this help message

ENVIRONMENT:
    RUST_LOG             Log level (e.g. info, debug, trace)"
    );
}
