//! Headless Vulkan instance creation.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::driver::{DriverResult, DriverStatus};

/// Instance extensions needed without any presentation surface.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance for compute only.
///
/// Missing validation layers are skipped with a warning.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> DriverResult<ash::Instance> {
    let app_name = CString::new(app_name).map_err(|_| DriverStatus::InvalidValue)?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Lumen")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let extension_names: Vec<*const std::ffi::c_char> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let mut layers = Vec::new();
    if enable_validation {
        // SAFETY: Caller guarantees the entry is valid
        let available = unsafe { entry.enumerate_instance_layer_properties()? };
        for layer in validation_layers() {
            let found = available
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == layer));
            if found {
                layers.push(layer);
            } else {
                tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
            }
        }
    }
    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    // SAFETY: Every pointer in create_info outlives this call
    Ok(unsafe { entry.create_instance(&create_info, None)? })
}
