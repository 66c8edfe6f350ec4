//! Image views, samplers and shader modules.

mod common;

use gpuweave_vk::objects::SPIRV_MAGIC;
use gpuweave_vk::vk;
use gpuweave_vk::{CompiledShader, GpuError, ImageDescription, ShaderCompiler, ShaderStage, ViewKind};

#[test]
fn test_view_range_checks() {
    let (_driver, device) = common::device();
    let desc = ImageDescription::new_2d(8, 8, vk::Format::R8G8B8A8_UNORM)
        .with_layers(6)
        .with_mips(2);
    let (arena, id) = common::image_arena(&device, desc);
    let image = arena.image(id).unwrap();
    let full = desc.full_range(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let cube = device.new_image_view(image, &full, ViewKind::Cube).unwrap();
    assert_eq!(cube.kind(), ViewKind::Cube);
    assert_eq!(cube.image(), image.handle());
    assert_eq!(cube.range().layer_count, 6);

    let mut one_layer = full;
    one_layer.layer_count = 1;
    device.new_image_view(image, &one_layer, ViewKind::D2).unwrap();
    match device.new_image_view(image, &one_layer, ViewKind::Cube) {
        Err(GpuError::Configuration(msg)) => assert!(msg.contains("6 layers")),
        other => panic!("expected Configuration error, got {:?}", other.map(|v| v.kind())),
    }

    let mut past_end = full;
    past_end.first_mip = 1;
    assert!(matches!(
        device.new_image_view(image, &past_end, ViewKind::D2Array),
        Err(GpuError::Configuration(_))
    ));
}

#[test]
fn test_view_of_unbound_image_rejected() {
    let (_driver, device) = common::device();
    let desc = ImageDescription::new_2d(4, 4, vk::Format::R8G8B8A8_UNORM);
    let image = device
        .new_image(desc, vk::ImageUsageFlags::SAMPLED)
        .unwrap();
    assert!(matches!(
        device.new_image_view(
            &image,
            &desc.full_range(vk::ImageLayout::UNDEFINED),
            ViewKind::D2
        ),
        Err(GpuError::ResourceState(_))
    ));
}

#[test]
fn test_objects_destroyed_on_drop() {
    let (driver, device) = common::device();
    let baseline = driver.live_objects();
    {
        let sampler = device.new_sampler(vk::SamplerAddressMode::REPEAT).unwrap();
        assert_eq!(sampler.address_mode(), vk::SamplerAddressMode::REPEAT);
        let _pool = device.new_timestamp_pool(4).unwrap();
        assert_eq!(driver.live_objects(), baseline + 2);
    }
    assert_eq!(driver.live_objects(), baseline);
    assert_eq!(driver.count("vkDestroySampler"), 1);
    assert_eq!(driver.count("vkDestroyQueryPool"), 1);
}

struct FakeCompiler;

impl ShaderCompiler for FakeCompiler {
    fn compile(&self, source: &str, stage: ShaderStage) -> Result<CompiledShader, String> {
        if source.contains("error") {
            return Err(format!("{stage:?}: unexpected token `error`"));
        }
        let spirv = if source.contains("garbage") {
            vec![0xdead_beef]
        } else {
            vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
        };
        Ok(CompiledShader {
            spirv,
            log: if source.contains("unused") {
                "warning: unused variable".to_string()
            } else {
                String::new()
            },
        })
    }
}

#[test]
fn test_shader_compilation_paths() {
    let (driver, device) = common::device();

    let module = device
        .new_shader_module(&FakeCompiler, "fn main() { let unused = 1; }", ShaderStage::Compute)
        .unwrap();
    assert_eq!(module.stage(), ShaderStage::Compute);
    assert_eq!(module.log(), "warning: unused variable");
    assert_eq!(ShaderStage::Compute.flags(), vk::ShaderStageFlags::COMPUTE);

    let geometry = device
        .new_shader_module(&FakeCompiler, "fn main() {}", ShaderStage::Geometry)
        .unwrap();
    assert_eq!(geometry.stage(), ShaderStage::Geometry);
    assert_eq!(ShaderStage::Geometry.flags(), vk::ShaderStageFlags::GEOMETRY);

    match device.new_shader_module(&FakeCompiler, "error", ShaderStage::Vertex) {
        Err(GpuError::Collaborator { what, message }) => {
            assert_eq!(what, "shader compilation");
            assert!(message.starts_with("Vertex"));
        }
        other => panic!("expected Collaborator error, got {:?}", other.map(|m| m.stage())),
    }
    assert!(matches!(
        device.new_shader_module(&FakeCompiler, "garbage", ShaderStage::Fragment),
        Err(GpuError::Collaborator { .. })
    ));
    assert!(matches!(
        device.shader_from_spirv(&[], ShaderStage::Fragment),
        Err(GpuError::Collaborator { .. })
    ));
    device
        .shader_from_spirv(&[SPIRV_MAGIC, 0x0001_0000], ShaderStage::Fragment)
        .unwrap();
    assert_eq!(driver.count("vkCreateShaderModule"), 3);
}
