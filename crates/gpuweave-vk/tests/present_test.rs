//! Swapchain build, acquire/present handshake and stale-surface recovery.

mod common;

use std::ffi::CStr;
use std::sync::Arc;

use gpuweave_core::GpuweaveConfig;
use gpuweave_vk::vk::{self, Handle};
use gpuweave_vk::{
    Device, GpuError, PresentFrame, PresentationBridge, RecordingDriver, SurfaceProvider,
};

struct FakeSurface;

impl SurfaceProvider for FakeSurface {
    fn instance_extensions(&self) -> Vec<&'static CStr> {
        vec![c"VK_KHR_surface"]
    }

    fn surface(&self) -> vk::SurfaceKHR {
        vk::SurfaceKHR::from_raw(77)
    }

    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: 1024,
            height: 768,
        }
    }
}

fn bridge(device: &Device) -> PresentationBridge {
    device.new_presentation(Arc::new(FakeSurface)).unwrap()
}

/// Render nothing into `frame` and hand it to the presentation engine.
fn present(device: &Device, frame: &PresentFrame) -> gpuweave_vk::Result<()> {
    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, true)?;
    recorder.begin()?;
    device.submit(&mut recorder, 0, &[frame], None)?;
    recorder.wait()
}

#[test]
fn test_swapchain_built_on_creation() {
    let (driver, device) = common::device();
    let bridge = bridge(&device);
    assert_eq!(bridge.images().len(), 3);
    assert_eq!(bridge.format(), vk::Format::B8G8R8A8_UNORM);
    assert_eq!((bridge.extent().width, bridge.extent().height), (640, 480));
    assert!(!bridge.is_stale());
    assert!(bridge.images().iter().all(|i| !i.is_owned()));
    assert!(bridge.image(3).is_none());
    assert_eq!(driver.count("vkCreateSwapchainKHR"), 1);
}

#[test]
fn test_frame_is_presented_after_render() {
    let (driver, device) = common::device();
    let mut bridge = bridge(&device);

    let first = bridge.next_frame().unwrap().unwrap();
    assert_eq!(first.image_index(), 0);
    assert_eq!(first.image(), bridge.image(0).unwrap().handle());
    present(&device, &first).unwrap();

    let second = bridge.next_frame().unwrap().unwrap();
    assert_eq!(second.image_index(), 1);
    assert_ne!(first.acquire_semaphore(), second.acquire_semaphore());
    present(&device, &second).unwrap();

    assert_eq!(driver.presented(), [0, 1]);
    assert!(!bridge.is_stale());
}

#[test]
fn test_two_windows_present_from_one_submission() {
    let (driver, device) = common::device();
    let mut left = bridge(&device);
    let mut right = bridge(&device);

    let a = left.next_frame().unwrap().unwrap();
    let b = right.next_frame().unwrap().unwrap();
    assert_ne!(a.present_semaphore(), b.present_semaphore());
    assert_ne!(a.present_semaphore(), a.acquire_semaphore());

    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, true).unwrap();
    recorder.begin().unwrap();
    device.submit(&mut recorder, 0, &[&a, &b], None).unwrap();
    recorder.wait().unwrap();

    assert_eq!(driver.count("vkQueuePresentKHR"), 2);
    assert_eq!(driver.presented().len(), 2);
    assert!(!left.is_stale());
    assert!(!right.is_stale());
}

#[test]
fn test_present_of_unrendered_frame_fails() {
    let (driver, device) = common::device();
    let mut bridge = bridge(&device);
    let frame = bridge.next_frame().unwrap().unwrap();

    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, true).unwrap();
    recorder.begin().unwrap();
    driver.set_hung(true);
    match device.submit(&mut recorder, 0, &[&frame], None) {
        Err(GpuError::Driver { call, result }) => {
            assert_eq!(call, "vkQueuePresentKHR");
            assert_eq!(result, vk::Result::ERROR_DEVICE_LOST);
        }
        other => panic!("expected Driver error, got {:?}", other),
    }
    assert!(driver.presented().is_empty());

    driver.set_hung(false);
    recorder.wait().unwrap();
}

#[test]
fn test_out_of_date_acquire_rebuilds() {
    let (driver, device) = common::device();
    let mut bridge = bridge(&device);
    let old = bridge.swapchain();

    driver.push_acquire_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
    assert!(bridge.next_frame().unwrap().is_none());
    assert_eq!(driver.count("vkCreateSwapchainKHR"), 2);
    assert_eq!(driver.count("vkDestroySwapchainKHR"), 1);
    assert_ne!(bridge.swapchain(), old);

    assert!(bridge.next_frame().unwrap().is_some());
}

#[test]
fn test_suboptimal_acquire_rebuilds() {
    let (driver, device) = common::device();
    let mut bridge = bridge(&device);
    driver.set_surface_extent(800, 600);
    driver.push_acquire_result(vk::Result::SUBOPTIMAL_KHR);

    assert!(bridge.next_frame().unwrap().is_none());
    assert_eq!(bridge.extent().width, 800);
    let frame = bridge.next_frame().unwrap().unwrap();
    assert_eq!(frame.extent().height, 600);
}

#[test]
fn test_out_of_date_present_marks_stale() {
    let (driver, device) = common::device();
    let mut bridge = bridge(&device);

    let frame = bridge.next_frame().unwrap().unwrap();
    driver.push_present_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
    present(&device, &frame).unwrap();
    assert!(bridge.is_stale());

    assert!(bridge.next_frame().unwrap().is_none());
    assert!(!bridge.is_stale());
    assert_eq!(driver.count("vkCreateSwapchainKHR"), 2);
    assert!(bridge.next_frame().unwrap().is_some());
}

#[test]
fn test_suboptimal_present_marks_stale() {
    let (driver, device) = common::device();
    let mut bridge = bridge(&device);
    let frame = bridge.next_frame().unwrap().unwrap();
    driver.push_present_result(vk::Result::SUBOPTIMAL_KHR);
    present(&device, &frame).unwrap();
    assert!(bridge.is_stale());
    assert_eq!(driver.presented(), [0]);
}

#[test]
fn test_lost_surface_on_present_is_error() {
    let (driver, device) = common::device();
    let mut bridge = bridge(&device);
    let frame = bridge.next_frame().unwrap().unwrap();
    driver.push_present_result(vk::Result::ERROR_SURFACE_LOST_KHR);
    match present(&device, &frame) {
        Err(GpuError::Driver { call, result }) => {
            assert_eq!(call, "vkQueuePresentKHR");
            assert_eq!(result, vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        other => panic!("expected Driver error, got {:?}", other),
    }
}

#[test]
fn test_acquire_failures() {
    let (driver, device) = common::device();
    let mut bridge = bridge(&device);

    driver.push_acquire_result(vk::Result::TIMEOUT);
    match bridge.next_frame() {
        Err(GpuError::Timeout { what, timeout_ms }) => {
            assert_eq!(what, "swapchain image acquire");
            assert_eq!(timeout_ms, 2000);
        }
        other => panic!("expected Timeout, got {:?}", other),
    }

    driver.push_acquire_result(vk::Result::ERROR_DEVICE_LOST);
    assert!(matches!(
        bridge.next_frame(),
        Err(GpuError::Driver {
            call: "vkAcquireNextImageKHR",
            ..
        })
    ));
    assert!(!bridge.is_stale());
}

#[test]
fn test_zero_extent_defers_swapchain() {
    let (driver, device) = common::device();
    driver.set_surface_extent(0, 0);
    let mut bridge = bridge(&device);
    assert!(bridge.images().is_empty());
    assert!(bridge.is_stale());
    assert_eq!(driver.count("vkCreateSwapchainKHR"), 0);

    assert!(bridge.next_frame().unwrap().is_none());
    assert_eq!(driver.count("vkCreateSwapchainKHR"), 0);

    driver.set_surface_extent(320, 240);
    assert!(bridge.next_frame().unwrap().is_none());
    assert_eq!(driver.count("vkCreateSwapchainKHR"), 1);
    let frame = bridge.next_frame().unwrap().unwrap();
    assert_eq!(frame.extent().width, 320);
}

#[test]
fn test_invalidate_forces_rebuild() {
    let (driver, device) = common::device();
    let mut bridge = bridge(&device);
    bridge.invalidate();
    assert!(bridge.next_frame().unwrap().is_none());
    assert_eq!(driver.count("vkCreateSwapchainKHR"), 2);
}

#[test]
fn test_extra_frames_add_acquire_semaphores() {
    let mut config = GpuweaveConfig::default();
    config.presentation.extra_frames = 2;
    let (driver, device) = common::device_with(RecordingDriver::new(), config);
    let before = driver.count("vkCreateSemaphore");
    let baseline = driver.live_objects();
    {
        let _bridge = bridge(&device);
        // An acquire and a present semaphore per frame slot.
        assert_eq!(driver.count("vkCreateSemaphore") - before, 10);
    }
    assert_eq!(driver.live_objects(), baseline);
}
