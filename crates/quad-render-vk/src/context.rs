// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface, physical device choice and the logical device with its queues.

use std::ffi::{c_char, c_void, CStr};

use anyhow::{anyhow, Context, Result};
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, error, info, trace, warn};

use crate::RenderError;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Queue family indices for drawing and presenting. They may be the same family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Prefers one family that does both; otherwise the first of each.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> bool,
    ) -> Option<Self> {
        let usable = |q: &vk::QueueFamilyProperties| q.queue_count > 0;
        let is_graphics =
            |q: &vk::QueueFamilyProperties| usable(q) && q.queue_flags.contains(vk::QueueFlags::GRAPHICS);

        let mut graphics = None;
        let mut present = None;
        for (i, q) in families.iter().enumerate() {
            let i = i as u32;
            let can_present = usable(q) && supports_present(i);
            if is_graphics(q) && can_present {
                return Some(Self {
                    graphics: i,
                    present: i,
                });
            }
            if graphics.is_none() && is_graphics(q) {
                graphics = Some(i);
            }
            if present.is_none() && can_present {
                present = Some(i);
            }
        }
        Some(Self {
            graphics: graphics?,
            present: present?,
        })
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    type Sev = vk::DebugUtilsMessageSeverityFlagsEXT;
    if severity.contains(Sev::ERROR) {
        error!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(Sev::WARNING) {
        warn!(target: "vulkan", ?types, "{msg}");
    } else if severity.contains(Sev::INFO) {
        debug!(target: "vulkan", ?types, "{msg}");
    } else {
        trace!(target: "vulkan", ?types, "{msg}");
    }
    vk::FALSE
}

fn debug_messenger_info<'a>() -> vk::DebugUtilsMessengerCreateInfoEXT<'a> {
    vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    }
}

unsafe fn ensure_layer(entry: &Entry, name: &CStr) -> Result<()> {
    let layers = entry
        .enumerate_instance_layer_properties()
        .context("enumerate_instance_layer_properties")?;
    let found = layers
        .iter()
        .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == name);
    if !found {
        return Err(RenderError::MissingLayer(name.to_string_lossy().into_owned()).into());
    }
    Ok(())
}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle, validation: bool) -> Result<Instance> {
    let app = c"quadlight";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: vk::make_api_version(0, 1, 0, 0),
        p_engine_name: c"No Engine".as_ptr(),
        engine_version: vk::make_api_version(0, 1, 0, 0),
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut exts: Vec<*const c_char> = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();
    let mut layers: Vec<*const c_char> = Vec::new();
    if validation {
        ensure_layer(entry, VALIDATION_LAYER)?;
        exts.push(debug_utils::NAME.as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }

    // chained so instance creation and destruction are covered by validation too
    let dbg_ci = debug_messenger_info();
    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_next: if validation {
            (&dbg_ci as *const vk::DebugUtilsMessengerCreateInfoEXT).cast()
        } else {
            std::ptr::null()
        },
        p_application_info: &app_info,
        enabled_extension_count: exts.len() as u32,
        pp_enabled_extension_names: exts.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    Ok(entry.create_instance(&create_info, None).context("create_instance")?)
}

unsafe fn device_supports_swapchain(instance: &Instance, phys: vk::PhysicalDevice) -> Result<bool> {
    let ext_props = instance
        .enumerate_device_extension_properties(phys)
        .context("enumerate_device_extension_properties")?;
    Ok(ext_props
        .iter()
        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == swapchain::NAME))
}

/// Families for a device that can draw to and present on `surface`, or `None` if it is unsuitable.
unsafe fn rate_device(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
) -> Result<Option<QueueFamilies>> {
    let families = instance.get_physical_device_queue_family_properties(phys);
    let Some(queues) = QueueFamilies::find(&families, |i| {
        surf_i
            .get_physical_device_surface_support(phys, i, surface)
            .unwrap_or(false)
    }) else {
        return Ok(None);
    };
    if !device_supports_swapchain(instance, phys)? {
        return Ok(None);
    }
    let formats = surf_i
        .get_physical_device_surface_formats(phys, surface)
        .context("get_physical_device_surface_formats")?;
    let modes = surf_i
        .get_physical_device_surface_present_modes(phys, surface)
        .context("get_physical_device_surface_present_modes")?;
    if formats.is_empty() || modes.is_empty() {
        return Ok(None);
    }
    let feats = instance.get_physical_device_features(phys);
    if feats.sampler_anisotropy != vk::TRUE {
        return Ok(None);
    }
    Ok(Some(queues))
}

unsafe fn pick_device(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?;
    for phys in devices {
        if let Some(q) = rate_device(instance, surf_i, surface, phys)? {
            return Ok((phys, q));
        }
    }
    Err(RenderError::NoSuitableDevice.into())
}

unsafe fn create_device(instance: &Instance, phys: vk::PhysicalDevice, queues: QueueFamilies) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let qinfos: Vec<vk::DeviceQueueCreateInfo> = queues
        .unique()
        .into_iter()
        .map(|family| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();

    let features = vk::PhysicalDeviceFeatures {
        sampler_anisotropy: vk::TRUE,
        ..Default::default()
    };
    let device_exts = [swapchain::NAME.as_ptr()];

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: qinfos.len() as u32,
        p_queue_create_infos: qinfos.as_ptr(),
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        p_enabled_features: &features,
        ..Default::default()
    };
    Ok(instance.create_device(phys, &dinfo, None).context("create_device")?)
}

/// Everything instance- and device-scoped that outlives the swapchain.
pub struct GpuContext {
    pub entry: Entry,
    pub instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queues: QueueFamilies,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub max_anisotropy: f32,
}

impl GpuContext {
    pub unsafe fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle, validation: bool) -> Result<Self> {
        // instance -> surface -> device: present support is queried against this surface
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("display_handle: {e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow!("window_handle: {e}"))?
            .as_raw();

        let entry = Entry::load().map_err(|e| anyhow!("load Vulkan loader: {e}"))?;
        let instance = create_instance(&entry, dh, validation)?;

        let debug = if validation {
            let loader = debug_utils::Instance::new(&entry, &instance);
            let messenger = loader
                .create_debug_utils_messenger(&debug_messenger_info(), None)
                .context("create_debug_utils_messenger")?;
            Some((loader, messenger))
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
            .context("ash_window::create_surface")?;

        let (phys, queues) = pick_device(&instance, &surface_loader, surface)?;
        let props = instance.get_physical_device_properties(phys);
        info!(
            "GPU: {} (graphics family {}, present family {})",
            CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy(),
            queues.graphics,
            queues.present
        );

        let device = create_device(&instance, phys, queues)?;
        let graphics_queue = device.get_device_queue(queues.graphics, 0);
        let present_queue = device.get_device_queue(queues.present, 0);
        let memory_props = instance.get_physical_device_memory_properties(phys);

        Ok(Self {
            entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            device,
            queues,
            graphics_queue,
            present_queue,
            memory_props,
            max_anisotropy: props.limits.max_sampler_anisotropy,
        })
    }

    /// Device, then surface and messenger, instance last. Call after every child object is gone.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_device(None);
        self.surface_loader.destroy_surface(self.surface, None);
        if let Some((loader, messenger)) = self.debug.take() {
            loader.destroy_debug_utils_messenger(messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}
