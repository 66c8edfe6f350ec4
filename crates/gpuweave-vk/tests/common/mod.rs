#![allow(dead_code)]

use std::sync::Arc;

use gpuweave_core::GpuweaveConfig;
use gpuweave_vk::vk;
use gpuweave_vk::{
    Device, ImageDescription, MemoryArena, RecordingDriver, Reserve, ResourceId,
    ValidationCollector,
};

pub fn device() -> (Arc<RecordingDriver>, Device) {
    device_with(RecordingDriver::new(), GpuweaveConfig::default())
}

pub fn device_with(
    driver: RecordingDriver,
    config: GpuweaveConfig,
) -> (Arc<RecordingDriver>, Device) {
    let driver = Arc::new(driver);
    let device = Device::new(driver.clone(), config, ValidationCollector::new())
        .expect("device over the recording driver");
    (driver, device)
}

/// An allocated host-visible arena holding one buffer per entry of `sizes`.
pub fn host_arena(
    device: &Device,
    usage: vk::BufferUsageFlags,
    sizes: &[u64],
) -> (MemoryArena, Vec<ResourceId>) {
    let mut arena = device.new_arena();
    let mut ids = Vec::new();
    for &size in sizes {
        let buffer = device.new_buffer(size, usage, true).unwrap();
        match arena.reserve(buffer).unwrap() {
            Reserve::Accepted(id) => ids.push(id),
            Reserve::Rejected(_) => panic!("host buffer rejected by host arena"),
        }
    }
    arena.allocate().unwrap();
    (arena, ids)
}

/// An allocated device-local arena holding a single image.
pub fn image_arena(device: &Device, desc: ImageDescription) -> (MemoryArena, ResourceId) {
    let image = device
        .new_image(
            desc,
            vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::SAMPLED,
        )
        .unwrap();
    let mut arena = device.new_arena();
    let id = arena.reserve(image).unwrap().id().unwrap();
    arena.allocate().unwrap();
    (arena, id)
}
