// SPDX-License-Identifier: CEPL-1.0
//! Upload/readback round trips against a real device.
//!
//! Run with `cargo test -p quad-render-vk -- --ignored`. Each test returns early when no Vulkan
//! loader or device is available.

use ash::{vk, Entry, Instance};
use quad_render::{Vertex, QUAD_INDICES, QUAD_VERTICES};
use quad_render_vk::{MemoryAllocator, RenderError, TransferEngine};

struct Headless {
    _entry: Entry,
    instance: Instance,
    device: ash::Device,
    transfer: TransferEngine,
}

impl Headless {
    fn new() -> Option<Self> {
        let entry = match unsafe { Entry::load() } {
            Ok(e) => e,
            Err(e) => {
                eprintln!("skipping: no Vulkan loader ({e})");
                return None;
            }
        };
        let app = vk::ApplicationInfo {
            api_version: vk::API_VERSION_1_0,
            ..Default::default()
        };
        let ici = vk::InstanceCreateInfo {
            p_application_info: &app,
            ..Default::default()
        };
        let instance = match unsafe { entry.create_instance(&ici, None) } {
            Ok(i) => i,
            Err(e) => {
                eprintln!("skipping: create_instance failed ({e})");
                return None;
            }
        };

        let found = unsafe { instance.enumerate_physical_devices() }
            .unwrap_or_default()
            .into_iter()
            .find_map(|phys| {
                let fams = unsafe { instance.get_physical_device_queue_family_properties(phys) };
                fams.iter()
                    .position(|q| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                    .map(|i| (phys, i as u32))
            });
        let Some((phys, family)) = found else {
            eprintln!("skipping: no device with a graphics queue");
            unsafe { instance.destroy_instance(None) };
            return None;
        };

        let priorities = [1.0_f32];
        let qci = vk::DeviceQueueCreateInfo {
            queue_family_index: family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        };
        let dci = vk::DeviceCreateInfo {
            queue_create_info_count: 1,
            p_queue_create_infos: &qci,
            ..Default::default()
        };
        let device = unsafe { instance.create_device(phys, &dci, None) }.expect("create_device");
        let queue = unsafe { device.get_device_queue(family, 0) };
        let props = unsafe { instance.get_physical_device_memory_properties(phys) };

        let allocator = MemoryAllocator::new(device.clone(), props);
        let transfer =
            unsafe { TransferEngine::new(device.clone(), queue, family, allocator) }.expect("transfer engine");
        Some(Self {
            _entry: entry,
            instance,
            device,
            transfer,
        })
    }

    fn buffer_round_trip(&self, data: &[u8]) -> Vec<u8> {
        unsafe {
            let buf = self
                .transfer
                .upload_to_device_local(data, vk::BufferUsageFlags::VERTEX_BUFFER)
                .expect("upload");
            assert_eq!(buf.size, data.len() as u64);
            let back = self.transfer.read_back_buffer(&buf).expect("read back");
            buf.destroy(&self.device);
            back
        }
    }

    fn image_round_trip(&self, width: u32, height: u32) {
        let pixels: Vec<u8> = (0..width * height * 4).map(|i| (i * 7 % 251) as u8).collect();
        unsafe {
            let mut img = self
                .transfer
                .upload_image(&pixels, width, height, vk::Format::R8G8B8A8_UNORM)
                .expect("upload image");
            assert_eq!(img.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            let back = self.transfer.read_back_image(&mut img).expect("read back image");
            assert_eq!(img.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            img.destroy(&self.device);
            assert_eq!(back.len(), pixels.len());
            assert!(back == pixels, "{width}x{height} image differs after round trip");
        }
    }
}

impl Drop for Headless {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.transfer.destroy();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[test]
#[ignore = "needs a Vulkan device"]
fn single_byte_buffer() {
    let Some(gpu) = Headless::new() else { return };
    assert_eq!(gpu.buffer_round_trip(&[0xa5]), vec![0xa5]);
}

#[test]
#[ignore = "needs a Vulkan device"]
fn position_color_vertex_of_20_bytes() {
    let Some(gpu) = Headless::new() else { return };
    let v: [f32; 5] = [-0.5, 0.5, 1.0, 0.25, 0.0];
    let bytes = bytemuck::cast_slice::<f32, u8>(&v).to_vec();
    assert_eq!(bytes.len(), 20);
    assert_eq!(gpu.buffer_round_trip(&bytes), bytes);
}

#[test]
#[ignore = "needs a Vulkan device"]
fn one_textured_vertex() {
    let Some(gpu) = Headless::new() else { return };
    let bytes = bytemuck::bytes_of(&QUAD_VERTICES[2]).to_vec();
    assert_eq!(bytes.len(), std::mem::size_of::<Vertex>());
    let back = gpu.buffer_round_trip(&bytes);
    assert_eq!(bytemuck::pod_read_unaligned::<Vertex>(&back), QUAD_VERTICES[2]);
}

#[test]
#[ignore = "needs a Vulkan device"]
fn whole_quad_geometry() {
    let Some(gpu) = Headless::new() else { return };
    let verts = bytemuck::cast_slice::<Vertex, u8>(&QUAD_VERTICES);
    let idx = bytemuck::cast_slice::<u16, u8>(&QUAD_INDICES);
    assert_eq!(gpu.buffer_round_trip(verts), verts);
    assert_eq!(gpu.buffer_round_trip(idx), idx);
}

#[test]
#[ignore = "needs a Vulkan device"]
fn one_pixel_image() {
    let Some(gpu) = Headless::new() else { return };
    gpu.image_round_trip(1, 1);
}

#[test]
#[ignore = "needs a Vulkan device"]
fn large_image() {
    let Some(gpu) = Headless::new() else { return };
    gpu.image_round_trip(512, 512);
}

#[test]
#[ignore = "needs a Vulkan device"]
fn bad_input_is_rejected_before_any_gpu_work() {
    let Some(gpu) = Headless::new() else { return };
    unsafe {
        let err = gpu
            .transfer
            .upload_image(&[0; 12], 2, 2, vk::Format::R8G8B8A8_UNORM)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::PixelSizeMismatch {
                expected: 16,
                actual: 12,
                ..
            })
        ));

        let err = gpu
            .transfer
            .upload_to_device_local(&[], vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::EmptyUpload)));
    }
}
