use gpuweave_vk::{CompiledShader, ShaderCompiler, ShaderStage};

/// WGSL to SPIR-V through naga. Every module's entry point is `main`.
pub struct NagaCompiler;

impl ShaderCompiler for NagaCompiler {
    fn compile(&self, source: &str, stage: ShaderStage) -> Result<CompiledShader, String> {
        let shader_stage = naga_stage(stage)?;
        let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::empty(),
        )
        .validate(&module)
        .map_err(|e| e.emit_to_string(source))?;

        let options = naga::back::spv::Options {
            lang_version: (1, 0),
            ..Default::default()
        };
        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage,
            entry_point: "main".to_string(),
        };

        let mut writer = naga::back::spv::Writer::new(&options).map_err(|e| e.to_string())?;
        let mut spirv = Vec::new();
        writer
            .write(&module, &info, Some(&pipeline_options), &None, &mut spirv)
            .map_err(|e| e.to_string())?;

        Ok(CompiledShader {
            spirv,
            log: String::new(),
        })
    }
}

fn naga_stage(stage: ShaderStage) -> Result<naga::ShaderStage, String> {
    match stage {
        ShaderStage::Vertex => Ok(naga::ShaderStage::Vertex),
        ShaderStage::Fragment => Ok(naga::ShaderStage::Fragment),
        ShaderStage::Compute => Ok(naga::ShaderStage::Compute),
        ShaderStage::Geometry => Err("WGSL has no geometry shader stage".to_string()),
    }
}

/// Doubles every element of a storage buffer in place.
pub const DOUBLE_WGSL: &str = r#"
@group(0) @binding(0)
var<storage, read_write> data: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&data)) {
        data[id.x] = data[id.x] * 2u;
    }
}
"#;

