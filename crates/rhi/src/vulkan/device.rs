//! Logical device creation.

use ash::vk;
use tracing::{debug, info};

use crate::error::RhiResult;
use crate::vulkan::instance::Instance;
use crate::vulkan::physical_device::PhysicalDeviceInfo;

const DEVICE_EXTENSIONS: &[&std::ffi::CStr] = &[ash::khr::swapchain::NAME];

/// The logical device. Every queue of every family is created so the queue
/// registry can be built once at startup and stay immutable.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
}

impl Device {
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> RhiResult<Self> {
        // One create-info per family, asking for the family's full queue
        // count; priorities are flat.
        let priorities: Vec<Vec<f32>> = physical
            .families
            .iter()
            .map(|f| vec![1.0f32; f.queue_count as usize])
            .collect();
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = physical
            .families
            .iter()
            .zip(&priorities)
            .map(|(family, prio)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family.index)
                    .queue_priorities(prio)
            })
            .collect();

        debug!(
            "Creating logical device with {} queue famil(ies)",
            queue_create_infos.len()
        );

        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let features = vk::PhysicalDeviceFeatures::default();

        let extension_names: Vec<*const i8> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut features_1_3);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical.device, &create_info, None)?
        };
        info!(
            "Logical device created on '{}' with {} extension(s)",
            physical.device_name(),
            DEVICE_EXTENSIONS.len()
        );

        Ok(Self {
            device,
            physical_device: physical.device,
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::error!("Failed to wait for device idle during drop: {:?}", e);
            }
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}
