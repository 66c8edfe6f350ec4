//! Memory arena and memory pool behaviour against the recording driver.

mod common;

use gpuweave_vk::collab::ImageDecoder;
use gpuweave_vk::vk;
use gpuweave_vk::{
    align_up, select_memory_type, ArenaState, GpuError, ImageDescription, Reserve,
};

#[test]
fn test_offsets_follow_alignment() {
    let (driver, device) = common::device();
    driver.set_buffer_alignment(vk::BufferUsageFlags::UNIFORM_BUFFER, 16);

    let r1 = device
        .new_buffer(10, vk::BufferUsageFlags::UNIFORM_BUFFER, false)
        .unwrap();
    let r2 = device
        .new_buffer(5, vk::BufferUsageFlags::STORAGE_BUFFER, false)
        .unwrap();

    let mut arena = device.new_arena();
    let id1 = arena.reserve(r1).unwrap().id().unwrap();
    let id2 = arena.reserve(r2).unwrap().id().unwrap();

    assert_eq!(arena.offset(id1).unwrap(), 0);
    assert_eq!(arena.padded_size(id1).unwrap(), 16);
    assert_eq!(arena.offset(id2).unwrap(), 16);
    assert_eq!(arena.padded_size(id2).unwrap(), 8);
    assert_eq!(arena.size(), 24);

    arena.allocate().unwrap();
    assert_eq!(arena.state(), ArenaState::Allocated);
    assert_eq!(driver.count("vkAllocateMemory"), 1);
    assert_eq!(driver.count("vkBindBufferMemory"), 2);
    assert!(arena.buffer(id1).unwrap().is_bound());
}

#[test]
fn test_entries_never_overlap() {
    let (driver, device) = common::device();
    driver.set_buffer_alignment(vk::BufferUsageFlags::UNIFORM_BUFFER, 64);
    driver.set_buffer_alignment(vk::BufferUsageFlags::VERTEX_BUFFER, 16);

    let shapes = [
        (3, vk::BufferUsageFlags::STORAGE_BUFFER, 4),
        (100, vk::BufferUsageFlags::UNIFORM_BUFFER, 64),
        (7, vk::BufferUsageFlags::VERTEX_BUFFER, 16),
        (1, vk::BufferUsageFlags::UNIFORM_BUFFER, 64),
        (33, vk::BufferUsageFlags::STORAGE_BUFFER, 4),
    ];
    let mut arena = device.new_arena();
    let mut ids = Vec::new();
    for (size, usage, alignment) in shapes {
        let buffer = device.new_buffer(size, usage, false).unwrap();
        ids.push((arena.reserve(buffer).unwrap().id().unwrap(), size, alignment));
    }

    let mut end = 0;
    for (id, size, alignment) in ids {
        let offset = arena.offset(id).unwrap();
        let padded = arena.padded_size(id).unwrap();
        assert_eq!(offset % alignment, 0, "offset {offset} not aligned to {alignment}");
        assert!(offset >= end, "entry at {offset} overlaps previous end {end}");
        assert!(padded >= size);
        end = offset + padded;
    }
    assert_eq!(arena.size(), end);
}

#[test]
fn test_mismatched_class_is_returned_untouched() {
    let (_driver, device) = common::device();
    let mut arena = device.new_arena();

    let local = device
        .new_buffer(64, vk::BufferUsageFlags::STORAGE_BUFFER, false)
        .unwrap();
    arena.reserve(local).unwrap();
    let size_before = arena.size();

    let host = device
        .new_buffer(64, vk::BufferUsageFlags::TRANSFER_SRC, true)
        .unwrap();
    let returned = match arena.reserve(host).unwrap() {
        Reserve::Rejected(resource) => resource,
        Reserve::Accepted(id) => panic!("host buffer accepted into device arena as {:?}", id),
    };
    assert_eq!(arena.len(), 1);
    assert_eq!(arena.size(), size_before);
    assert!(!arena.is_host_visible());

    // The rejected resource still works in a matching arena.
    let mut host_arena = device.new_arena();
    assert!(host_arena.reserve(returned).unwrap().is_accepted());
    assert!(host_arena.is_host_visible());
}

#[test]
fn test_allocate_empty_arena_is_configuration_error() {
    let (driver, device) = common::device();
    let mut arena = device.new_arena();
    match arena.allocate() {
        Err(GpuError::Configuration(msg)) => assert!(msg.contains("empty")),
        other => panic!("expected Configuration error, got {:?}", other),
    }
    assert_eq!(arena.state(), ArenaState::Open);
    assert_eq!(driver.count("vkAllocateMemory"), 0);
}

#[test]
fn test_reserve_after_allocate_is_state_error() {
    let (_driver, device) = common::device();
    let (mut arena, _) = common::host_arena(&device, vk::BufferUsageFlags::TRANSFER_SRC, &[16]);
    let late = device
        .new_buffer(16, vk::BufferUsageFlags::TRANSFER_SRC, true)
        .unwrap();
    assert!(matches!(arena.reserve(late), Err(GpuError::ResourceState(_))));
    assert!(matches!(arena.allocate(), Err(GpuError::ResourceState(_))));
}

#[test]
fn test_host_write_and_read() {
    let (_driver, device) = common::device();
    let (mut arena, ids) =
        common::host_arena(&device, vk::BufferUsageFlags::TRANSFER_SRC, &[16, 8]);

    arena.write(ids[1], 2, b"abcd").unwrap();
    arena.write_pod(ids[0], 0, &[1u32, 2, 3, 4]).unwrap();

    let mut out = [0u8; 4];
    arena.read(ids[1], 2, &mut out).unwrap();
    assert_eq!(&out, b"abcd");

    let mut words = [0u32; 4];
    arena
        .read(ids[0], 0, bytemuck::cast_slice_mut(&mut words))
        .unwrap();
    assert_eq!(words, [1, 2, 3, 4]);

    match arena.write(ids[1], 6, b"abcd") {
        Err(GpuError::ResourceState(msg)) => assert!(msg.contains("exceeds")),
        other => panic!("expected out-of-range error, got {:?}", other),
    }
}

#[test]
fn test_device_local_memory_has_no_host_pointer() {
    let (_driver, device) = common::device();
    let mut arena = device.new_arena();
    let buffer = device
        .new_buffer(32, vk::BufferUsageFlags::STORAGE_BUFFER, false)
        .unwrap();
    let id = arena.reserve(buffer).unwrap().id().unwrap();

    match arena.host_ptr(id) {
        Err(GpuError::ResourceState(msg)) => assert!(msg.contains("not bound")),
        other => panic!("expected unbound error, got {:?}", other),
    }
    arena.allocate().unwrap();
    assert!(matches!(arena.host_ptr(id), Err(GpuError::ResourceState(_))));
}

#[test]
fn test_failed_bind_disposes_arena() {
    let (driver, device) = common::device();
    let baseline = driver.live_objects();
    let mut arena = device.new_arena();
    let buffer = device
        .new_buffer(32, vk::BufferUsageFlags::STORAGE_BUFFER, false)
        .unwrap();
    arena.reserve(buffer).unwrap();

    driver.fail_next("vkBindBufferMemory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    match arena.allocate() {
        Err(GpuError::Driver { call, result }) => {
            assert_eq!(call, "vkBindBufferMemory");
            assert_eq!(result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        other => panic!("expected Driver error, got {:?}", other),
    }
    assert_eq!(arena.state(), ArenaState::Disposed);
    assert_eq!(driver.live_objects(), baseline);
}

#[test]
fn test_dispose_releases_driver_objects() {
    let (driver, device) = common::device();
    let baseline = driver.live_objects();
    {
        let (mut arena, ids) =
            common::host_arena(&device, vk::BufferUsageFlags::TRANSFER_DST, &[8, 8, 8]);
        assert!(driver.live_objects() > baseline);
        arena.dispose();
        assert_eq!(arena.state(), ArenaState::Disposed);
        assert!(matches!(arena.buffer(ids[0]), Err(GpuError::ResourceState(_))));
        // Dispose is idempotent and Drop runs it again.
        arena.dispose();
    }
    assert_eq!(driver.live_objects(), baseline);
    assert_eq!(driver.count("vkUnmapMemory"), 1);
    assert_eq!(driver.count("vkFreeMemory"), 1);
}

#[test]
fn test_foreign_resource_id_rejected() {
    let (_driver, device) = common::device();
    let (a, a_ids) = common::host_arena(&device, vk::BufferUsageFlags::TRANSFER_SRC, &[4]);
    let (b, _) = common::host_arena(&device, vk::BufferUsageFlags::TRANSFER_SRC, &[4]);
    assert_ne!(a.id(), b.id());
    match b.buffer(a_ids[0]) {
        Err(GpuError::ResourceState(msg)) => assert!(msg.contains("belongs to arena")),
        other => panic!("expected foreign id error, got {:?}", other),
    }
}

#[test]
fn test_image_placed_after_buffer() {
    let (_driver, device) = common::device();
    let mut arena = device.new_arena();
    let buffer = device
        .new_buffer(10, vk::BufferUsageFlags::STORAGE_BUFFER, false)
        .unwrap();
    let image = device
        .new_image(
            ImageDescription::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM),
            vk::ImageUsageFlags::SAMPLED,
        )
        .unwrap();
    arena.reserve(buffer).unwrap();
    let image_id = arena.reserve(image).unwrap().id().unwrap();
    assert_eq!(arena.offset(image_id).unwrap(), 256);
    assert_eq!(arena.padded_size(image_id).unwrap(), 256);
    arena.allocate().unwrap();
    assert!(arena.image(image_id).unwrap().is_bound());
    assert!(matches!(arena.buffer(image_id), Err(GpuError::ResourceState(_))));
}

#[test]
fn test_zero_sized_resources_rejected() {
    let (_driver, device) = common::device();
    assert!(matches!(
        device.new_buffer(0, vk::BufferUsageFlags::STORAGE_BUFFER, false),
        Err(GpuError::Configuration(_))
    ));
    assert!(matches!(
        device.new_image(
            ImageDescription::new_2d(0, 4, vk::Format::R8G8B8A8_UNORM),
            vk::ImageUsageFlags::SAMPLED
        ),
        Err(GpuError::Configuration(_))
    ));
}

#[test]
fn test_memory_type_selection() {
    let types = [
        vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
            heap_index: 0,
        },
        vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        },
        vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        },
    ];
    assert_eq!(select_memory_type(&types, 0b111, false).unwrap(), 1);
    assert_eq!(select_memory_type(&types, 0b111, true).unwrap(), 2);
    match select_memory_type(&types, 0b001, true) {
        Err(GpuError::Configuration(msg)) => assert!(msg.contains("no suitable memory")),
        other => panic!("expected Configuration error, got {:?}", other),
    }
    assert_eq!(align_up(0, 16), 0);
    assert_eq!(align_up(17, 16), 32);
    assert_eq!(align_up(5, 0), 5);
}

#[test]
fn test_pool_spreads_classes_over_arenas() {
    let (_driver, device) = common::device();
    let mut pool = device.new_memory_pool();

    let a = pool.reserve_buffer(
        device
            .new_buffer(64, vk::BufferUsageFlags::STORAGE_BUFFER, false)
            .unwrap(),
    );
    let b = pool.reserve_buffer(
        device
            .new_buffer(16, vk::BufferUsageFlags::TRANSFER_SRC, true)
            .unwrap(),
    );
    let c = pool.reserve_buffer(
        device
            .new_buffer(32, vk::BufferUsageFlags::STORAGE_BUFFER, false)
            .unwrap(),
    );
    assert_eq!(pool.pending(), 3);

    pool.allocate().unwrap();
    assert_eq!(pool.pending(), 0);
    assert_eq!(pool.arenas().len(), 2);

    let (arena_a, _) = pool.locate(a).unwrap();
    let (arena_c, _) = pool.locate(c).unwrap();
    assert_eq!(arena_a.id(), arena_c.id());
    assert!(pool.buffer(b).unwrap().is_host());

    pool.write(b, 0, &[7; 16]).unwrap();
    let mut out = [0u8; 16];
    pool.read(b, 0, &mut out).unwrap();
    assert_eq!(out, [7; 16]);
    assert!(matches!(pool.write(a, 0, &[1]), Err(GpuError::ResourceState(_))));
}

#[test]
fn test_pool_keeps_resources_when_allocation_fails() {
    let (driver, device) = common::device();
    let mut pool = device.new_memory_pool();
    let a = pool.reserve_buffer(
        device
            .new_buffer(64, vk::BufferUsageFlags::STORAGE_BUFFER, false)
            .unwrap(),
    );
    let b = pool.reserve_buffer(
        device
            .new_buffer(16, vk::BufferUsageFlags::TRANSFER_SRC, true)
            .unwrap(),
    );

    driver.fail_next("vkAllocateMemory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    match pool.allocate() {
        Err(GpuError::Driver { call, result }) => {
            assert_eq!(call, "vkAllocateMemory");
            assert_eq!(result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        other => panic!("expected Driver error, got {:?}", other),
    }
    assert_eq!(pool.pending(), 2);
    assert!(pool.arenas().is_empty());
    assert_eq!(driver.count("vkDestroyBuffer"), 0);
    assert!(matches!(pool.buffer(a), Err(GpuError::ResourceState(_))));

    pool.allocate().unwrap();
    assert_eq!(pool.pending(), 0);
    assert_eq!(pool.arenas().len(), 2);
    assert!(!pool.buffer(a).unwrap().is_host());
    assert!(pool.buffer(b).unwrap().is_host());
}

#[test]
fn test_pool_failed_bind_loses_only_its_arena() {
    let (driver, device) = common::device();
    let mut pool = device.new_memory_pool();
    let a = pool.reserve_buffer(
        device
            .new_buffer(64, vk::BufferUsageFlags::STORAGE_BUFFER, false)
            .unwrap(),
    );
    let b = pool.reserve_buffer(
        device
            .new_buffer(16, vk::BufferUsageFlags::TRANSFER_SRC, true)
            .unwrap(),
    );

    driver.fail_next("vkBindBufferMemory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    assert!(pool.allocate().is_err());
    assert_eq!(driver.count("vkDestroyBuffer"), 1);
    assert_eq!(pool.pending(), 1);

    pool.allocate().unwrap();
    assert_eq!(pool.arenas().len(), 1);
    assert!(matches!(pool.buffer(a), Err(GpuError::ResourceState(_))));
    pool.write(b, 0, &[3; 16]).unwrap();
}

struct RawDecoder;

impl ImageDecoder for RawDecoder {
    fn describe(&self, encoded: &[u8]) -> Result<ImageDescription, String> {
        if encoded.len() < 2 {
            return Err("truncated header".to_string());
        }
        Ok(ImageDescription::new_2d(
            encoded[0] as u32,
            encoded[1] as u32,
            vk::Format::R8G8B8A8_UNORM,
        ))
    }

    fn decode(&self, encoded: &[u8], dst: &mut [u8]) -> Result<usize, String> {
        let pixels = &encoded[2..];
        if dst.len() < pixels.len() {
            return Err("destination too small".to_string());
        }
        dst[..pixels.len()].copy_from_slice(pixels);
        Ok(pixels.len())
    }
}

#[test]
fn test_stage_image_decodes_into_host_buffer() {
    let (_driver, device) = common::device();
    let mut encoded = vec![2u8, 1];
    encoded.extend_from_slice(&[10, 20, 30, 40, 50, 60, 70, 80]);

    let staged = device.stage_image(&RawDecoder, &encoded).unwrap();
    assert_eq!(staged.description.width, 2);
    assert_eq!(staged.bytes, 8);
    let mut out = [0u8; 8];
    staged.arena.read(staged.buffer, 0, &mut out).unwrap();
    assert_eq!(out, [10, 20, 30, 40, 50, 60, 70, 80]);

    match device.stage_image(&RawDecoder, &[1]) {
        Err(GpuError::Collaborator { what, message }) => {
            assert_eq!(what, "image decode");
            assert!(message.contains("truncated"));
        }
        other => panic!("expected Collaborator error, got {:?}", other.map(|s| s.bytes)),
    }
}
