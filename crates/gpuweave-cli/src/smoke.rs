//! `gpuweave smoke`: exercise arenas, recorders, chained submissions,
//! descriptors, timestamps and shader modules on one device and report each
//! step as a check.

use std::sync::Arc;

use gpuweave_core::GpuweaveConfig;
use gpuweave_vk::vk;
use gpuweave_vk::{
    open_device, Device, GpuError, LayoutBinding, MemoryArena, RecordingDriver, Reserve,
    ResourceId, ShaderStage, ValidationCollector,
};
use tracing::info;

use crate::shader::{NagaCompiler, DOUBLE_WGSL};

// ── Check result types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
    Skip,
}

impl CheckStatus {
    fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Fail => "fail",
            CheckStatus::Skip => "skip",
        }
    }
}

#[derive(Debug)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub details: Vec<String>,
}

impl CheckResult {
    fn pass(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            message: message.to_string(),
            details: Vec::new(),
        }
    }

    fn fail(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            message: message.to_string(),
            details: Vec::new(),
        }
    }

    fn skip(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Skip,
            message: message.to_string(),
            details: Vec::new(),
        }
    }

    fn detail(mut self, detail: &str) -> Self {
        self.details.push(detail.to_string());
        self
    }
}

type Check = fn(&Device) -> gpuweave_vk::Result<CheckResult>;

const CHECKS: &[(&str, Check)] = &[
    ("Memory arena", check_arena),
    ("Buffer copy", check_copy),
    ("Chained submission", check_chain),
    ("Descriptors", check_descriptors),
    ("Timestamps", check_timestamps),
    ("Shader module", check_shader),
];

// ── Main entry point ────────────────────────────────────────────────────────

pub fn run_smoke(config_path: &str, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let config = GpuweaveConfig::load_or_default(config_path);
    let results = if dry_run {
        let driver = Arc::new(RecordingDriver::new());
        let mut results = run_checks(|| {
            Device::new(driver.clone(), config.clone(), ValidationCollector::new())
        });
        let issued = format!("{} calls issued", driver.calls().len());
        results.push(
            CheckResult::pass("Driver calls", &issued)
                .detail(&format!("{} submissions executed", driver.executed().len()))
                .detail(&format!("{} objects still alive", driver.live_objects())),
        );
        results
    } else {
        run_checks(|| open_device(&config, ValidationCollector::new(), None))
    };

    if json {
        print_results_json(&results);
    } else {
        print_results_pretty(&results);
    }

    if results.iter().any(|r| r.status == CheckStatus::Fail) {
        std::process::exit(1);
    }
    Ok(())
}

/// Open a device with `open` and run every check against it.
pub fn run_checks(open: impl FnOnce() -> gpuweave_vk::Result<Device>) -> Vec<CheckResult> {
    let mut results = Vec::new();
    let device = match open() {
        Ok(device) => {
            results.push(CheckResult::pass(
                "Device",
                &format!("{} queues", device.queues().len()),
            ));
            device
        }
        Err(e) => {
            results.push(CheckResult::fail("Device", &e.to_string()));
            for (name, _) in CHECKS {
                results.push(CheckResult::skip(name, "No device"));
            }
            return results;
        }
    };

    for (name, check) in CHECKS {
        info!(check = name, "running smoke check");
        let result = check(&device).unwrap_or_else(|e| CheckResult::fail(name, &e.to_string()));
        results.push(result);
    }

    if let Err(e) = device.validation().check() {
        results.push(CheckResult::fail("Validation", &e.to_string()));
    }
    results
}

fn reserve(
    arena: &mut MemoryArena,
    resource: impl Into<gpuweave_vk::Resource>,
) -> gpuweave_vk::Result<ResourceId> {
    match arena.reserve(resource)? {
        Reserve::Accepted(id) => Ok(id),
        Reserve::Rejected(_) => Err(GpuError::Configuration(
            "arena rejected a buffer of its own memory class".to_string(),
        )),
    }
}

// ── Check 1: Memory arena ───────────────────────────────────────────────────

fn check_arena(device: &Device) -> gpuweave_vk::Result<CheckResult> {
    let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
    let mut arena = device.new_arena();
    let a = reserve(&mut arena, device.new_buffer(10, usage, true)?)?;
    let b = reserve(&mut arena, device.new_buffer(5, usage, true)?)?;
    arena.allocate()?;

    let (a_offset, b_offset) = (arena.offset(a)?, arena.offset(b)?);
    if b_offset < a_offset + arena.padded_size(a)? {
        return Ok(CheckResult::fail("Memory arena", "packed buffers overlap"));
    }
    Ok(CheckResult::pass(
        "Memory arena",
        &format!("2 buffers in {} bytes", arena.size()),
    )
    .detail(&format!("offsets {a_offset} and {b_offset}"))
    .detail(&format!("host visible: {}", arena.is_host_visible())))
}

// ── Check 2: Buffer copy ────────────────────────────────────────────────────

fn check_copy(device: &Device) -> gpuweave_vk::Result<CheckResult> {
    let pattern: Vec<u32> = (0..256).map(|i| i * 3 + 1).collect();
    let size = std::mem::size_of_val(pattern.as_slice()) as u64;
    let usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;

    let mut arena = device.new_arena();
    let src = reserve(&mut arena, device.new_buffer(size, usage, true)?)?;
    let dst = reserve(&mut arena, device.new_buffer(size, usage, true)?)?;
    arena.allocate()?;
    arena.write_pod(src, 0, &pattern)?;

    let mut recorder = device.new_recorder(vk::QueueFlags::TRANSFER, true)?;
    recorder.begin()?;
    recorder.copy_buffer(arena.buffer(src)?, arena.buffer(dst)?)?;
    device.submit(&mut recorder, 0, &[], None)?;
    recorder.wait()?;

    let mut out = vec![0u32; pattern.len()];
    arena.read(dst, 0, bytemuck::cast_slice_mut(&mut out))?;
    recorder.dispose()?;

    if out != pattern {
        return Ok(CheckResult::fail("Buffer copy", "copied bytes differ from the source"));
    }
    Ok(CheckResult::pass("Buffer copy", &format!("{size} bytes round-tripped")))
}

// ── Check 3: Chained submission ─────────────────────────────────────────────

fn check_chain(device: &Device) -> gpuweave_vk::Result<CheckResult> {
    let mut producer = device.new_recorder(vk::QueueFlags::GRAPHICS, false)?;
    let mut consumer = device.new_recorder(vk::QueueFlags::GRAPHICS, false)?;

    producer.begin()?;
    let point = device
        .submit(&mut producer, 0, &[], Some(vk::PipelineStageFlags::TRANSFER))?
        .ok_or_else(|| GpuError::ResourceState("no signal semaphore produced".to_string()))?;
    consumer.begin()?;
    device.submit(&mut consumer, 1, &[&point], None)?;

    consumer.wait()?;
    let producer_done = producer.is_complete()?;
    producer.wait()?;
    producer.dispose()?;
    consumer.dispose()?;

    if !producer_done {
        return Ok(CheckResult::fail(
            "Chained submission",
            "consumer finished before its producer",
        ));
    }
    Ok(CheckResult::pass(
        "Chained submission",
        "consumer ran after its producer",
    ))
}

// ── Check 4: Descriptors ────────────────────────────────────────────────────

fn check_descriptors(device: &Device) -> gpuweave_vk::Result<CheckResult> {
    let mut arena = device.new_arena();
    let buffer = reserve(
        &mut arena,
        device.new_buffer(1024, vk::BufferUsageFlags::STORAGE_BUFFER, true)?,
    )?;
    arena.allocate()?;

    let layout = device
        .new_descriptor_layout(LayoutBinding {
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            count: 1,
            stages: vk::ShaderStageFlags::COMPUTE,
            flags: vk::DescriptorBindingFlags::empty(),
        })?
        .add_binding(vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::COMPUTE)?;
    let pool = layout.new_pool(4)?;
    let set = pool.alloc()?;
    set.write_buffer(0, arena.buffer(buffer)?, 0, 0)?;

    Ok(CheckResult::pass(
        "Descriptors",
        &format!(
            "{} bindings, {} of {} sets allocated",
            layout.binding_count(),
            pool.allocated(),
            pool.capacity()
        ),
    ))
}

// ── Check 5: Timestamps ─────────────────────────────────────────────────────

fn check_timestamps(device: &Device) -> gpuweave_vk::Result<CheckResult> {
    let pool = device.new_timestamp_pool(2)?;
    let mut recorder = device.new_recorder(vk::QueueFlags::COMPUTE, true)?;
    recorder.begin()?;
    recorder.reset_timestamps(&pool)?;
    recorder.write_timestamp(&pool, 0, vk::PipelineStageFlags::TOP_OF_PIPE)?;
    recorder.write_timestamp(&pool, 1, vk::PipelineStageFlags::BOTTOM_OF_PIPE)?;
    device.submit(&mut recorder, 0, &[], None)?;
    recorder.wait()?;

    let intervals = pool.intervals_ns()?;
    recorder.dispose()?;
    match intervals.first() {
        Some(ns) => Ok(CheckResult::pass(
            "Timestamps",
            &format!("empty batch took {ns:.0} ns"),
        )),
        None => Ok(CheckResult::fail("Timestamps", "no interval measured")),
    }
}

// ── Check 6: Shader module ──────────────────────────────────────────────────

fn check_shader(device: &Device) -> gpuweave_vk::Result<CheckResult> {
    let module = device.new_shader_module(&NagaCompiler, DOUBLE_WGSL, ShaderStage::Compute)?;
    Ok(CheckResult::pass(
        "Shader module",
        &format!("compute module {:?} created", module.handle()),
    ))
}

// ── Output ──────────────────────────────────────────────────────────────────

fn print_results_pretty(results: &[CheckResult]) {
    println!();
    println!("gpuweave smoke test");
    println!("===================");
    println!();

    let mut pass_count = 0u32;
    let mut fail_count = 0u32;

    for result in results {
        let (icon, color_start, color_end) = match result.status {
            CheckStatus::Pass => {
                pass_count += 1;
                ("[PASS]", "\x1b[32m", "\x1b[0m")
            }
            CheckStatus::Fail => {
                fail_count += 1;
                ("[FAIL]", "\x1b[31m", "\x1b[0m")
            }
            CheckStatus::Skip => ("[SKIP]", "\x1b[90m", "\x1b[0m"),
        };

        println!(
            "  {}{}{} {} - {}",
            color_start, icon, color_end, result.name, result.message
        );
        for detail in &result.details {
            println!("         {}", detail);
        }
    }

    println!();
    println!("-------------------");
    println!("  {} passed, {} failed", pass_count, fail_count);
    println!();
}

pub fn results_json(results: &[CheckResult]) -> serde_json::Value {
    results
        .iter()
        .map(|r| {
            serde_json::json!({
                "name": r.name,
                "status": r.status.as_str(),
                "message": r.message,
                "details": r.details,
            })
        })
        .collect()
}

fn print_results_json(results: &[CheckResult]) {
    println!("{}", results_json(results));
}
