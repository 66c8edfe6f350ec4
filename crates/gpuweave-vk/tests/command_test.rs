//! Command recorder lifecycle and recording against the recording driver.

mod common;

use gpuweave_vk::vk;
use gpuweave_vk::{
    access_for_layout, ComputeItem, DrawItem, GpuError, ImageDescription, PipelineBinding,
    PushConstants, RecordedCommand, RecorderState, RenderTarget, SetBinding, TransferDirection,
    TransferItem, VertexInput,
};

fn pipeline() -> PipelineBinding {
    PipelineBinding {
        pipeline: vk::Pipeline::null(),
        layout: vk::PipelineLayout::null(),
    }
}

#[test]
fn test_fence_signals_only_after_execution() {
    let (driver, device) = common::device();
    let (arena, ids) = common::host_arena(
        &device,
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        &[16, 16],
    );

    let mut recorder = device.new_recorder(vk::QueueFlags::TRANSFER, false).unwrap();
    assert_eq!(recorder.state(), RecorderState::Initial);
    recorder.begin().unwrap();
    recorder
        .copy_buffer(arena.buffer(ids[0]).unwrap(), arena.buffer(ids[1]).unwrap())
        .unwrap();
    device.submit(&mut recorder, 0, &[], None).unwrap();

    assert_eq!(recorder.state(), RecorderState::Submitted);
    assert!(!recorder.is_complete().unwrap());
    assert_eq!(driver.pending(), 1);

    driver.complete_all();
    assert!(recorder.is_complete().unwrap());
    assert_eq!(recorder.state(), RecorderState::Complete);
}

#[test]
fn test_wait_runs_copy_and_moves_bytes() {
    let (_driver, device) = common::device();
    let (mut arena, ids) = common::host_arena(
        &device,
        vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        &[8, 16],
    );
    arena.write(ids[0], 0, b"gpuweave").unwrap();

    let mut recorder = device.new_recorder(vk::QueueFlags::TRANSFER, true).unwrap();
    assert!(recorder.is_single_use());
    recorder.begin().unwrap();
    recorder
        .copy_buffer(arena.buffer(ids[0]).unwrap(), arena.buffer(ids[1]).unwrap())
        .unwrap();
    device.submit(&mut recorder, 0, &[], None).unwrap();
    recorder.wait().unwrap();

    let mut out = [0u8; 16];
    arena.read(ids[1], 0, &mut out).unwrap();
    assert_eq!(&out[..8], b"gpuweave");
    assert_eq!(&out[8..], &[0; 8]);
}

#[test]
fn test_wait_times_out_on_hung_device() {
    let (driver, device) = common::device();
    let mut recorder = device.new_recorder(vk::QueueFlags::COMPUTE, false).unwrap();
    recorder.begin().unwrap();
    device.submit(&mut recorder, 0, &[], None).unwrap();

    driver.set_hung(true);
    match recorder.wait() {
        Err(GpuError::Timeout { what, timeout_ms }) => {
            assert_eq!(what, "command recorder fence");
            assert_eq!(timeout_ms, device.config().device.fence_timeout_ms);
        }
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(recorder.state(), RecorderState::Submitted);

    driver.set_hung(false);
    recorder.wait().unwrap();
    assert_eq!(recorder.state(), RecorderState::Complete);
}

#[test]
fn test_begin_state_rules() {
    let (driver, device) = common::device();
    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, false).unwrap();

    recorder.begin().unwrap();
    assert!(matches!(recorder.begin(), Err(GpuError::ResourceState(_))));
    assert_eq!(driver.count("vkResetCommandPool"), 0);

    device.submit(&mut recorder, 0, &[], None).unwrap();
    match recorder.begin() {
        Err(GpuError::ResourceState(msg)) => assert!(msg.contains("still executing")),
        other => panic!("expected ResourceState, got {:?}", other),
    }

    driver.complete_all();
    recorder.begin().unwrap();
    assert_eq!(driver.count("vkResetCommandPool"), 1);
    assert_eq!(recorder.recorded(), 0);

    // A second submission re-arms the same fence.
    let fence = recorder.fence();
    device.submit(&mut recorder, 0, &[], None).unwrap();
    recorder.wait().unwrap();
    assert_eq!(recorder.fence(), fence);
    assert_eq!(driver.count("vkCreateFence"), 1);

    recorder.dispose().unwrap();
    assert!(matches!(recorder.begin(), Err(GpuError::ResourceState(_))));
    assert!(matches!(recorder.poll(), Err(GpuError::ResourceState(_))));
}

#[test]
fn test_recording_requires_begin() {
    let (_driver, device) = common::device();
    let (arena, ids) =
        common::host_arena(&device, vk::BufferUsageFlags::TRANSFER_SRC, &[4, 4]);
    let mut recorder = device.new_recorder(vk::QueueFlags::TRANSFER, false).unwrap();
    match recorder.copy_buffer(arena.buffer(ids[0]).unwrap(), arena.buffer(ids[1]).unwrap()) {
        Err(GpuError::ResourceState(msg)) => assert!(msg.contains("copy_buffer")),
        other => panic!("expected ResourceState, got {:?}", other),
    }
    assert!(matches!(
        device.submit(&mut recorder, 0, &[], None),
        Err(GpuError::ResourceState(_))
    ));
}

#[test]
fn test_unbound_buffer_rejected() {
    let (_driver, device) = common::device();
    let mut arena = device.new_arena();
    let src = arena
        .reserve(
            device
                .new_buffer(4, vk::BufferUsageFlags::TRANSFER_SRC, true)
                .unwrap(),
        )
        .unwrap()
        .id()
        .unwrap();
    let dst = arena
        .reserve(
            device
                .new_buffer(4, vk::BufferUsageFlags::TRANSFER_DST, true)
                .unwrap(),
        )
        .unwrap()
        .id()
        .unwrap();

    let mut recorder = device.new_recorder(vk::QueueFlags::TRANSFER, false).unwrap();
    recorder.begin().unwrap();
    assert!(matches!(
        recorder.copy_buffer(arena.buffer(src).unwrap(), arena.buffer(dst).unwrap()),
        Err(GpuError::ResourceState(_))
    ));
    assert_eq!(recorder.recorded(), 0);
}

#[test]
fn test_set_layout_barrier_masks() {
    let (driver, device) = common::device();
    let desc = ImageDescription::new_2d(8, 8, vk::Format::R8G8B8A8_UNORM);
    let (arena, id) = common::image_arena(&device, desc);
    let image = arena.image(id).unwrap();

    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, false).unwrap();
    recorder.begin().unwrap();
    let range = desc.full_range(vk::ImageLayout::UNDEFINED);
    let range = recorder
        .set_layout(image, &range, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .unwrap();
    assert_eq!(range.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    recorder
        .set_layout(image, &range, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .unwrap();

    let commands = driver.recorded(recorder.command_buffer());
    assert_eq!(commands.len(), 2);
    match &commands[0] {
        RecordedCommand::PipelineBarrier { image_barriers, .. } => {
            let barrier = &image_barriers[0];
            assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
            assert_eq!(barrier.src_access, vk::AccessFlags::empty());
            assert_eq!(barrier.dst_access, vk::AccessFlags::TRANSFER_WRITE);
            assert_eq!(barrier.range.level_count, 1);
        }
        other => panic!("expected PipelineBarrier, got {:?}", other),
    }
    match &commands[1] {
        RecordedCommand::PipelineBarrier { image_barriers, .. } => {
            assert_eq!(image_barriers[0].src_access, vk::AccessFlags::TRANSFER_WRITE);
            assert_eq!(image_barriers[0].dst_access, vk::AccessFlags::MEMORY_READ);
        }
        other => panic!("expected PipelineBarrier, got {:?}", other),
    }
}

#[test]
fn test_set_layout_to_unmapped_layout_fails() {
    let (driver, device) = common::device();
    let desc = ImageDescription::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM);
    let (arena, id) = common::image_arena(&device, desc);

    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, false).unwrap();
    recorder.begin().unwrap();
    match recorder.set_layout(
        arena.image(id).unwrap(),
        &desc.full_range(vk::ImageLayout::UNDEFINED),
        vk::ImageLayout::GENERAL,
    ) {
        Err(GpuError::UnmappedLayout(layout)) => assert_eq!(layout, vk::ImageLayout::GENERAL),
        other => panic!("expected UnmappedLayout, got {:?}", other),
    }
    assert!(driver.recorded(recorder.command_buffer()).is_empty());

    // The explicit form covers layouts without a known mask.
    recorder
        .barrier_with_access(
            arena.image(id).unwrap(),
            &desc.full_range(vk::ImageLayout::UNDEFINED),
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::SHADER_WRITE,
        )
        .unwrap();
    assert_eq!(recorder.recorded(), 1);
}

#[test]
fn test_access_for_layout_table() {
    assert_eq!(
        access_for_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        Some(vk::AccessFlags::MEMORY_READ)
    );
    assert_eq!(
        access_for_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        Some(vk::AccessFlags::MEMORY_WRITE)
    );
    assert_eq!(
        access_for_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        Some(vk::AccessFlags::TRANSFER_READ)
    );
    assert_eq!(access_for_layout(vk::ImageLayout::PRESENT_SRC_KHR), None);
}

#[test]
fn test_transfer_packs_mip_levels() {
    let (driver, device) = common::device();
    let desc = ImageDescription::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM).with_mips(3);
    assert_eq!(desc.byte_size().unwrap(), 84);
    let (images, image_id) = common::image_arena(&device, desc);
    let (staging, ids) =
        common::host_arena(&device, vk::BufferUsageFlags::TRANSFER_SRC, &[84]);

    let mut recorder = device.new_recorder(vk::QueueFlags::TRANSFER, true).unwrap();
    recorder.begin().unwrap();
    recorder
        .transfer(&[TransferItem {
            direction: TransferDirection::BufferToImage,
            buffer: staging.buffer(ids[0]).unwrap(),
            buffer_offset: 0,
            image: images.image(image_id).unwrap(),
            range: desc.full_range(vk::ImageLayout::UNDEFINED),
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }])
        .unwrap();

    let commands = driver.recorded(recorder.command_buffer());
    let names: Vec<&str> = commands.iter().map(|c| c.name()).collect();
    assert_eq!(names, ["PipelineBarrier", "CopyBufferToImage", "PipelineBarrier"]);
    match &commands[1] {
        RecordedCommand::CopyBufferToImage {
            dst_layout,
            regions,
            ..
        } => {
            assert_eq!(*dst_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            let offsets: Vec<u64> = regions.iter().map(|r| r.buffer_offset).collect();
            assert_eq!(offsets, [0, 64, 80]);
            assert_eq!(regions[1].image_extent.width, 2);
            assert_eq!(regions[2].image_extent.width, 1);
            assert_eq!(regions[2].image_subresource.mip_level, 2);
        }
        other => panic!("expected CopyBufferToImage, got {:?}", other),
    }
    match &commands[2] {
        RecordedCommand::PipelineBarrier { image_barriers, .. } => assert_eq!(
            image_barriers[0].new_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        ),
        other => panic!("expected PipelineBarrier, got {:?}", other),
    }
}

#[test]
fn test_invalid_transfer_records_nothing() {
    let (driver, device) = common::device();
    let desc = ImageDescription::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM);
    let (images, image_id) = common::image_arena(&device, desc);
    let (staging, ids) =
        common::host_arena(&device, vk::BufferUsageFlags::TRANSFER_DST, &[64]);
    let image = images.image(image_id).unwrap();
    let buffer = staging.buffer(ids[0]).unwrap();

    let mut recorder = device.new_recorder(vk::QueueFlags::TRANSFER, false).unwrap();
    recorder.begin().unwrap();
    let good = TransferItem {
        direction: TransferDirection::ImageToBuffer,
        buffer,
        buffer_offset: 0,
        image,
        range: desc.full_range(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    };
    let bad = TransferItem {
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..good
    };
    assert!(matches!(
        recorder.transfer(&[good, bad]),
        Err(GpuError::UnmappedLayout(_))
    ));
    assert!(driver.recorded(recorder.command_buffer()).is_empty());

    recorder.transfer(&[good]).unwrap();
    let names: Vec<&str> = driver
        .recorded(recorder.command_buffer())
        .iter()
        .map(|c| c.name())
        .collect();
    assert_eq!(names, ["PipelineBarrier", "CopyImageToBuffer", "PipelineBarrier"]);
}

#[test]
fn test_clear_image_needs_writable_layout() {
    let (_driver, device) = common::device();
    let desc = ImageDescription::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM);
    let (arena, id) = common::image_arena(&device, desc);
    let image = arena.image(id).unwrap();

    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, false).unwrap();
    recorder.begin().unwrap();
    assert!(matches!(
        recorder.clear_image(
            image,
            &desc.full_range(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            [0.0; 4]
        ),
        Err(GpuError::ResourceState(_))
    ));
    recorder
        .clear_image(
            image,
            &desc.full_range(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            [1.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
    assert_eq!(recorder.recorded(), 1);
}

#[test]
fn test_indexed_draw_binds_index_then_vertices() {
    let (driver, device) = common::device();
    let (arena, ids) = common::host_arena(
        &device,
        vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::VERTEX_BUFFER,
        &[24, 48, 48],
    );
    let index = arena.buffer(ids[0]).unwrap();
    let positions = arena.buffer(ids[1]).unwrap();
    let colors = arena.buffer(ids[2]).unwrap();

    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, false).unwrap();
    recorder.begin().unwrap();
    recorder
        .begin_render_pass(&RenderTarget {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            extent: vk::Extent2D {
                width: 320,
                height: 200,
            },
            clear_colors: vec![[0.0, 0.0, 0.0, 1.0]],
        })
        .unwrap();
    let draw = DrawItem {
        pipeline: pipeline(),
        indexed: true,
        inputs: vec![
            VertexInput {
                buffer: index,
                offset: 0,
            },
            VertexInput {
                buffer: positions,
                offset: 0,
            },
            VertexInput {
                buffer: colors,
                offset: 16,
            },
        ],
        sets: vec![SetBinding {
            set: vk::DescriptorSet::null(),
            dynamic_offset: Some(256),
        }],
        push: Some(PushConstants {
            stages: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            data: vec![0; 16],
        }),
        count: 6,
        instances: 1,
        first: 0,
        first_instance: 0,
    };
    let skipped = DrawItem {
        instances: 0,
        ..draw.clone()
    };
    recorder.draw(&[draw, skipped]).unwrap();
    recorder.end_render_pass().unwrap();

    let commands = driver.recorded(recorder.command_buffer());
    let names: Vec<&str> = commands.iter().map(|c| c.name()).collect();
    assert_eq!(
        names,
        [
            "BeginRenderPass",
            "SetViewport",
            "SetScissor",
            "BindPipeline",
            "BindDescriptorSets",
            "PushConstants",
            "BindIndexBuffer",
            "BindVertexBuffers",
            "BindVertexBuffers",
            "DrawIndexed",
            "EndRenderPass",
        ]
    );
    match &commands[8] {
        RecordedCommand::BindVertexBuffers {
            first_binding,
            offsets,
            ..
        } => {
            assert_eq!(*first_binding, 1);
            assert_eq!(offsets, &[16]);
        }
        other => panic!("expected BindVertexBuffers, got {:?}", other),
    }
    match &commands[4] {
        RecordedCommand::BindDescriptorSets {
            dynamic_offsets, ..
        } => assert_eq!(dynamic_offsets, &[256]),
        other => panic!("expected BindDescriptorSets, got {:?}", other),
    }
}

#[test]
fn test_draw_binding_limits() {
    let (_driver, device) = common::device();
    let (arena, ids) =
        common::host_arena(&device, vk::BufferUsageFlags::VERTEX_BUFFER, &[16]);
    let vertices = arena.buffer(ids[0]).unwrap();

    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, false).unwrap();
    recorder.begin().unwrap();
    let too_many = DrawItem {
        pipeline: pipeline(),
        indexed: false,
        inputs: vec![
            VertexInput {
                buffer: vertices,
                offset: 0,
            };
            9
        ],
        sets: Vec::new(),
        push: None,
        count: 3,
        instances: 1,
        first: 0,
        first_instance: 0,
    };
    assert!(matches!(
        recorder.draw(&[too_many.clone()]),
        Err(GpuError::Configuration(_))
    ));

    let unindexed = DrawItem {
        indexed: true,
        inputs: Vec::new(),
        ..too_many
    };
    match recorder.draw(&[unindexed]) {
        Err(GpuError::Configuration(msg)) => assert!(msg.contains("index buffer")),
        other => panic!("expected Configuration error, got {:?}", other),
    }
    assert_eq!(recorder.recorded(), 0);
}

#[test]
fn test_dispatch_records_groups() {
    let (driver, device) = common::device();
    let mut recorder = device.new_recorder(vk::QueueFlags::COMPUTE, false).unwrap();
    recorder.begin().unwrap();
    recorder
        .dispatch(&ComputeItem {
            pipeline: pipeline(),
            sets: Vec::new(),
            push: Some(PushConstants::default()),
            groups: [4, 2, 1],
        })
        .unwrap();

    let commands = driver.recorded(recorder.command_buffer());
    // Empty push constants are skipped.
    assert_eq!(commands.len(), 2);
    match &commands[1] {
        RecordedCommand::Dispatch {
            group_count_x,
            group_count_y,
            group_count_z,
        } => assert_eq!((*group_count_x, *group_count_y, *group_count_z), (4, 2, 1)),
        other => panic!("expected Dispatch, got {:?}", other),
    }
}

#[test]
fn test_timestamps() {
    let (_driver, device) = common::device();
    let pool = device.new_timestamp_pool(3).unwrap();
    assert!(matches!(
        device.new_timestamp_pool(0),
        Err(GpuError::Configuration(_))
    ));

    let mut recorder = device.new_recorder(vk::QueueFlags::COMPUTE, false).unwrap();
    recorder.begin().unwrap();
    recorder.reset_timestamps(&pool).unwrap();
    recorder
        .write_timestamp(&pool, 0, vk::PipelineStageFlags::TOP_OF_PIPE)
        .unwrap();
    recorder
        .write_timestamp(&pool, 2, vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        .unwrap();
    assert!(matches!(
        recorder.write_timestamp(&pool, 3, vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        Err(GpuError::ResourceState(_))
    ));
    device.submit(&mut recorder, 0, &[], None).unwrap();
    recorder.wait().unwrap();

    assert_eq!(pool.results().unwrap(), [0, 1000, 2000]);
    assert_eq!(pool.intervals_ns().unwrap(), [1000.0, 1000.0]);
}

#[test]
fn test_dispose_waits_and_releases() {
    let (driver, device) = common::device();
    let baseline = driver.live_objects();
    let mut recorder = device.new_recorder(vk::QueueFlags::GRAPHICS, false).unwrap();
    recorder.begin().unwrap();
    device
        .submit(
            &mut recorder,
            0,
            &[],
            Some(vk::PipelineStageFlags::ALL_COMMANDS),
        )
        .unwrap();
    assert!(driver.live_objects() > baseline);

    recorder.dispose().unwrap();
    assert_eq!(recorder.state(), RecorderState::Disposed);
    assert_eq!(driver.pending(), 0);
    assert_eq!(driver.live_objects(), baseline);
    recorder.dispose().unwrap();
}
