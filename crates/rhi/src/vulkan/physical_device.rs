//! Physical device selection and queue-family enumeration.

use std::ffi::CStr;

use ash::vk;
use glam::UVec3;
use tracing::{debug, info, warn};

use crate::backend::{QueueCaps, QueueFamilyInfo};
use crate::error::{RhiError, RhiResult};

/// Selected physical device plus the full queue-family table the
/// synchronization core builds its registries from.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub families: Vec<QueueFamilyInfo>,
}

impl PhysicalDeviceInfo {
    pub fn device_name(&self) -> &str {
        unsafe {
            CStr::from_ptr(self.properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown Device")
        }
    }

    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("families", &self.families)
            .finish()
    }
}

/// Picks the best Vulkan-1.3 GPU with a graphics queue, preferring discrete
/// devices. When a surface is supplied, present support is folded into each
/// family's capability mask; headless setups simply get no `PRESENT` bits.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> RhiResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }
    info!("Found {} GPU(s)", devices.len());

    let mut best: Option<(PhysicalDeviceInfo, u32)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("Unknown")
        };

        if vk::api_version_major(properties.api_version) == 1
            && vk::api_version_minor(properties.api_version) < 3
        {
            debug!("GPU '{}' skipped: Vulkan 1.3 not supported", name);
            continue;
        }

        let families = enumerate_queue_families(instance, device, surface)?;
        if !families.iter().any(|f| f.caps.contains(QueueCaps::GRAPHICS)) {
            debug!("GPU '{}' skipped: no graphics queue family", name);
            continue;
        }

        let score = rate_device(&properties);
        debug!("GPU '{}' - score {}", name, score);
        let info = PhysicalDeviceInfo {
            device,
            properties,
            families,
        };
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((info, score));
        }
    }

    let (selected, score) = best.ok_or(RhiError::NoSuitableGpu)?;
    info!(
        "Selected GPU: '{}' ({}) - score {}",
        selected.device_name(),
        selected.device_type_name(),
        score
    );
    Ok(selected)
}

fn rate_device(properties: &vk::PhysicalDeviceProperties) -> u32 {
    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 10,
    }
}

fn enumerate_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<(&ash::khr::surface::Instance, vk::SurfaceKHR)>,
) -> RhiResult<Vec<QueueFamilyInfo>> {
    let properties = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let mut families = Vec::with_capacity(properties.len());
    for (index, family) in properties.iter().enumerate() {
        let index = index as u32;
        if family.queue_count == 0 {
            continue;
        }

        let mut caps = QueueCaps::empty();
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            caps |= QueueCaps::GRAPHICS;
        }
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE) {
            caps |= QueueCaps::COMPUTE;
        }
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER) {
            caps |= QueueCaps::TRANSFER;
        }
        if family.queue_flags.contains(vk::QueueFlags::SPARSE_BINDING) {
            caps |= QueueCaps::SPARSE_BINDING;
        }
        if let Some((loader, surface)) = surface {
            let present = unsafe {
                loader.get_physical_device_surface_support(device, index, surface)?
            };
            if present {
                caps |= QueueCaps::PRESENT;
            }
        }

        let granularity = family.min_image_transfer_granularity;
        families.push(QueueFamilyInfo {
            index,
            caps,
            queue_count: family.queue_count,
            min_image_transfer_granularity: UVec3::new(
                granularity.width,
                granularity.height,
                granularity.depth,
            ),
        });
    }

    Ok(families)
}
