//! Descriptor layout chains, pool sizing and set writes.

mod common;

use gpuweave_vk::vk;
use gpuweave_vk::{pool_sizes, GpuError, ImageDescription, LayoutBinding, ViewKind};

fn binding(descriptor_type: vk::DescriptorType, count: u32) -> LayoutBinding {
    LayoutBinding {
        descriptor_type,
        count,
        stages: vk::ShaderStageFlags::ALL,
        flags: vk::DescriptorBindingFlags::empty(),
    }
}

#[test]
fn test_pool_sizes_merge_by_type() {
    let bindings = [
        binding(vk::DescriptorType::UNIFORM_BUFFER, 1),
        binding(vk::DescriptorType::SAMPLER, 2),
        binding(vk::DescriptorType::UNIFORM_BUFFER, 1),
    ];
    let sizes = pool_sizes(&bindings, 5);
    assert_eq!(sizes.len(), 2);
    assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
    assert_eq!(sizes[0].descriptor_count, 10);
    assert_eq!(sizes[1].ty, vk::DescriptorType::SAMPLER);
    assert_eq!(sizes[1].descriptor_count, 10);
    assert!(pool_sizes(&[], 5).is_empty());
}

#[test]
fn test_layout_chain_indices() {
    let (driver, device) = common::device();
    let root = device
        .new_descriptor_layout(binding(vk::DescriptorType::UNIFORM_BUFFER, 1))
        .unwrap();
    let second = root
        .add_binding(
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            4,
            vk::ShaderStageFlags::FRAGMENT,
        )
        .unwrap();
    let third = second
        .add(binding(vk::DescriptorType::STORAGE_BUFFER, 1))
        .unwrap();

    assert_eq!(root.index(), 0);
    assert_eq!(third.index(), 2);
    assert_eq!(third.binding_count(), 3);
    assert_eq!(root.binding_count(), 1);
    assert_eq!(driver.count("vkCreateDescriptorSetLayout"), 3);

    assert_eq!(
        third.binding_type(1).unwrap(),
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER
    );
    assert_eq!(
        third.binding_type(0).unwrap(),
        vk::DescriptorType::UNIFORM_BUFFER
    );
    match second.binding_type(2) {
        Err(GpuError::ResourceState(msg)) => assert!(msg.contains("no such binding")),
        other => panic!("expected ResourceState, got {:?}", other),
    }

    let counts: Vec<u32> = third.bindings().iter().map(|b| b.count).collect();
    assert_eq!(counts, [1, 4, 1]);

    let sizes = third.pool_sizes(2);
    assert_eq!(sizes.len(), 3);
    assert_eq!(sizes[1].descriptor_count, 8);
}

#[test]
fn test_zero_count_binding_rejected() {
    let (_driver, device) = common::device();
    assert!(matches!(
        device.new_descriptor_layout(binding(vk::DescriptorType::SAMPLER, 0)),
        Err(GpuError::Configuration(_))
    ));
    let root = device
        .new_descriptor_layout(binding(vk::DescriptorType::SAMPLER, 1))
        .unwrap();
    assert!(matches!(
        root.add(binding(vk::DescriptorType::SAMPLER, 0)),
        Err(GpuError::Configuration(_))
    ));
}

#[test]
fn test_update_after_bind_propagates() {
    let (_driver, device) = common::device();
    let root = device
        .new_descriptor_layout(binding(vk::DescriptorType::UNIFORM_BUFFER, 1))
        .unwrap();
    assert!(!root.update_after_bind());

    let bindless = root
        .add(LayoutBinding {
            descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
            count: 64,
            stages: vk::ShaderStageFlags::FRAGMENT,
            flags: vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        })
        .unwrap();
    assert!(bindless.update_after_bind());
    let tail = bindless
        .add(binding(vk::DescriptorType::SAMPLER, 1))
        .unwrap();
    assert!(tail.update_after_bind());
    // The layout it extends is untouched.
    assert!(!root.update_after_bind());
}

#[test]
fn test_pool_exhaustion() {
    let (_driver, device) = common::device();
    let layout = device
        .new_descriptor_layout(binding(vk::DescriptorType::UNIFORM_BUFFER, 1))
        .unwrap();
    assert!(matches!(layout.new_pool(0), Err(GpuError::Configuration(_))));

    let pool = layout.new_pool(2).unwrap();
    let a = pool.alloc().unwrap();
    let b = pool.alloc().unwrap();
    assert_ne!(a.handle(), b.handle());
    assert_eq!(pool.allocated(), 2);
    match pool.alloc() {
        Err(GpuError::ResourceState(msg)) => assert!(msg.contains("exhausted")),
        other => panic!("expected exhaustion, got {:?}", other.map(|s| s.handle())),
    }
    assert_eq!(pool.allocated(), 2);
    assert_eq!(a.layout().handle(), layout.handle());
}

#[test]
fn test_failed_set_allocation_returns_slot() {
    let (driver, device) = common::device();
    let layout = device
        .new_descriptor_layout(binding(vk::DescriptorType::UNIFORM_BUFFER, 1))
        .unwrap();
    let pool = layout.new_pool(1).unwrap();
    driver.fail_next("vkAllocateDescriptorSets", vk::Result::ERROR_OUT_OF_POOL_MEMORY);
    assert!(matches!(pool.alloc(), Err(GpuError::Driver { .. })));
    assert_eq!(pool.allocated(), 0);
    pool.alloc().unwrap();
}

#[test]
fn test_sets_keep_pool_alive() {
    let (driver, device) = common::device();
    let layout = device
        .new_descriptor_layout(binding(vk::DescriptorType::STORAGE_BUFFER, 1))
        .unwrap();
    let set = {
        let pool = layout.new_pool(1).unwrap();
        pool.alloc().unwrap()
    };
    assert_eq!(driver.count("vkDestroyDescriptorPool"), 0);
    drop(set);
    assert_eq!(driver.count("vkDestroyDescriptorPool"), 1);
}

#[test]
fn test_write_buffer_ranges() {
    let (driver, device) = common::device();
    let (arena, ids) =
        common::host_arena(&device, vk::BufferUsageFlags::UNIFORM_BUFFER, &[64]);
    let buffer = arena.buffer(ids[0]).unwrap();
    let layout = device
        .new_descriptor_layout(binding(vk::DescriptorType::UNIFORM_BUFFER, 1))
        .unwrap();
    let pool = layout.new_pool(1).unwrap();
    let set = pool.alloc().unwrap();

    set.write_buffer(0, buffer, 0, 0).unwrap();
    set.write_buffer(0, buffer, 32, 32).unwrap();
    match set.write_buffer(0, buffer, 48, 32) {
        Err(GpuError::ResourceState(msg)) => assert!(msg.contains("exceeds")),
        other => panic!("expected range error, got {:?}", other),
    }
    assert!(matches!(
        set.write_buffer(1, buffer, 0, 0),
        Err(GpuError::ResourceState(_))
    ));
    assert_eq!(driver.count("vkUpdateDescriptorSets"), 2);
}

#[test]
fn test_write_image_needs_sampler_for_combined_binding() {
    let (driver, device) = common::device();
    let desc = ImageDescription::new_2d(16, 16, vk::Format::R8G8B8A8_UNORM);
    let (arena, id) = common::image_arena(&device, desc);
    let view = device
        .new_image_view(
            arena.image(id).unwrap(),
            &desc.full_range(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            ViewKind::D2,
        )
        .unwrap();
    let sampler = device
        .new_sampler(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .unwrap();

    let layout = device
        .new_descriptor_layout(binding(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2))
        .unwrap()
        .add(binding(vk::DescriptorType::SAMPLED_IMAGE, 1))
        .unwrap();
    let pool = layout.new_pool(1).unwrap();
    let set = pool.alloc().unwrap();

    let layout_ro = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    assert!(matches!(
        set.write_image(0, 0, &view, layout_ro, None),
        Err(GpuError::Configuration(_))
    ));
    set.write_image(0, 1, &view, layout_ro, Some(&sampler)).unwrap();
    set.write_image(1, 0, &view, layout_ro, None).unwrap();
    assert_eq!(driver.count("vkUpdateDescriptorSets"), 2);
}
