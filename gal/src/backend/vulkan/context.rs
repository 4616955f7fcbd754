// SPDX-FileCopyrightText: 2025 gal contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Vulkan instance, device and queue setup.

use std::ffi::{CStr, CString};

use ash::extensions::khr;
use ash::vk;
use log::{info, warn};

use super::OrHost;
use crate::error::{GalError, GalResult};

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Creates the window surface once the instance exists. Supplied by the
/// windowing glue.
pub type SurfaceFactory<'a> = &'a dyn Fn(&ash::Entry, &ash::Instance) -> Result<vk::SurfaceKHR, String>;

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub app_name: String,
    /// Instance extensions the surface needs (e.g. from the windowing library).
    pub instance_extensions: Vec<CString>,
    pub enable_validation: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            app_name: "gal".to_string(),
            instance_extensions: Vec::new(),
            enable_validation: false,
        }
    }
}

pub struct SurfaceContext {
    pub loader: khr::Surface,
    pub surface: vk::SurfaceKHR,
}

pub struct VulkanContext {
    _entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub surface: Option<SurfaceContext>,
    pub swapchain_loader: Option<khr::Swapchain>,
    device_name: String,
}

impl VulkanContext {
    /// Create an instance and device. Without a surface factory the device
    /// is headless and cannot present.
    pub fn new(options: &ContextOptions, surface_factory: Option<SurfaceFactory<'_>>) -> GalResult<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            warn!("Failed to load Vulkan: {}", e);
            GalError::NotSupported("Vulkan loader not available")
        })?;

        let app_name = CString::new(options.app_name.as_str()).unwrap_or_default();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&app_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut layers = Vec::new();
        if options.enable_validation {
            let available = entry.enumerate_instance_layer_properties().unwrap_or_default();
            let found = available
                .iter()
                .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);
            if found {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
            }
        }

        let extension_ptrs: Vec<*const std::os::raw::c_char> =
            options.instance_extensions.iter().map(|s| s.as_ptr()).collect();
        let instance_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extension_ptrs);
        let instance = unsafe { entry.create_instance(&instance_info, None) }.or_host("vkCreateInstance")?;
        info!("Vulkan instance created");

        let surface = match surface_factory {
            Some(factory) => match factory(&entry, &instance) {
                Ok(surface) => Some(SurfaceContext {
                    loader: khr::Surface::new(&entry, &instance),
                    surface,
                }),
                Err(e) => {
                    warn!("Surface creation failed: {}", e);
                    unsafe { instance.destroy_instance(None) };
                    return Err(GalError::NotSupported("window surface creation failed"));
                }
            },
            None => None,
        };

        let selected = unsafe { select_physical_device(&instance, surface.as_ref()) };
        let (physical_device, queue_family_index) = match selected {
            Ok(found) => found,
            Err(e) => {
                unsafe {
                    if let Some(s) = &surface {
                        s.loader.destroy_surface(s.surface, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        info!("Selected GPU: {} (type: {:?})", device_name, props.device_type);

        let queue_priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);
        let mut device_extensions = Vec::new();
        if surface.is_some() {
            device_extensions.push(khr::Swapchain::name().as_ptr());
        }
        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&device_extensions);

        let device = match unsafe { instance.create_device(physical_device, &device_info, None) } {
            Ok(device) => device,
            Err(e) => {
                unsafe {
                    if let Some(s) = &surface {
                        s.loader.destroy_surface(s.surface, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(GalError::host("vkCreateDevice", e));
            }
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let swapchain_loader = surface
            .as_ref()
            .map(|_| khr::Swapchain::new(&instance, &device));

        info!(
            "Vulkan device created (queue family: {}, presentation: {})",
            queue_family_index,
            surface.is_some()
        );

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            memory_properties,
            surface,
            swapchain_loader,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn find_memory_type(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> GalResult<u32> {
        find_memory_type(&self.memory_properties, type_bits, flags)
            .ok_or(GalError::NotSupported("no memory type with the requested properties"))
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("vkDeviceWaitIdle failed during teardown: {:?}", e);
            }
            self.device.destroy_device(None);
            if let Some(s) = &self.surface {
                s.loader.destroy_surface(s.surface, None);
            }
            self.instance.destroy_instance(None);
        }
        info!("Vulkan context destroyed");
    }
}

/// Index of the first memory type allowed by `type_bits` that has all of
/// `flags`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(flags)
    })
}

fn device_type_score(device_type: vk::PhysicalDeviceType) -> i32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 100,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 50,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 25,
        _ => 10,
    }
}

/// Prefer a discrete GPU with a queue family that can do graphics and,
/// when there is a surface, present to it.
unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<&SurfaceContext>,
) -> GalResult<(vk::PhysicalDevice, u32)> {
    let devices = instance
        .enumerate_physical_devices()
        .or_host("vkEnumeratePhysicalDevices")?;

    let mut best: Option<(vk::PhysicalDevice, u32, i32)> = None;
    for &pd in &devices {
        let props = instance.get_physical_device_properties(pd);
        let queue_families = instance.get_physical_device_queue_family_properties(pd);

        for (i, qf) in queue_families.iter().enumerate() {
            let i = i as u32;
            let has_graphics = qf.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let has_present = match surface {
                Some(s) => s
                    .loader
                    .get_physical_device_surface_support(pd, i, s.surface)
                    .unwrap_or(false),
                None => true,
            };
            if has_graphics && has_present {
                let score = device_type_score(props.device_type);
                if best.as_ref().map_or(true, |b| score > b.2) {
                    best = Some((pd, i, score));
                }
                break;
            }
        }
    }

    best.map(|(pd, qf, _)| (pd, qf))
        .ok_or(GalError::NotSupported("no Vulkan device with a usable graphics queue"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = flags.len() as u32;
        for (i, f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = *f;
        }
        props
    }

    #[test]
    fn test_find_memory_type() {
        let props = memory_props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;

        assert_eq!(find_memory_type(&props, 0b111, host), Some(1));
        // Type 1 excluded by the requirement bits.
        assert_eq!(find_memory_type(&props, 0b101, host), Some(2));
        assert_eq!(find_memory_type(&props, 0b001, host), None);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }

    #[test]
    fn test_device_type_score_prefers_discrete() {
        assert!(
            device_type_score(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_score(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_score(vk::PhysicalDeviceType::VIRTUAL_GPU)
                > device_type_score(vk::PhysicalDeviceType::CPU)
        );
    }

    #[test]
    fn test_headless_context() {
        // May fail on CI without Vulkan drivers; that is not a test failure.
        match VulkanContext::new(&ContextOptions::default(), None) {
            Ok(ctx) => {
                assert!(ctx.surface.is_none());
                assert!(ctx.swapchain_loader.is_none());
                log::info!("Vulkan device available: {}", ctx.device_name());
            }
            Err(e) => log::info!("Vulkan not available (expected on CI): {}", e),
        }
    }
}
