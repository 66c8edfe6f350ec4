//! C entry points over gpuweave.
//!
//! Every object crosses the boundary as an opaque `u64` handle; `0` is never
//! a valid handle. Calls return a [`GwStatus`]: `GW_OK`, `GW_REJECTED` when an
//! arena refuses a reservation, or a negative error whose message is kept
//! per thread and read back with `gw_last_error`.
//!
//! Typical flow: `gw_device_open`, `gw_arena_new`, `gw_arena_reserve_buffer`
//! for each buffer, `gw_arena_allocate`, `gw_recorder_new`, `gw_recorder_begin`,
//! record, `gw_submit`, `gw_recorder_wait`.

pub mod handles;
pub mod status;

use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

use gpuweave_core::config::default_config_path;
use gpuweave_core::GpuweaveConfig;
use gpuweave_vk::vk::{self, Handle};
use gpuweave_vk::{
    open_device, ComputeItem, Device, ImageDescription, PipelineBinding, Reserve,
    SubmitDependency, ValidationCollector, WaitPoint,
};
use tracing::{debug, info};

use handles::{ArenaSlot, RecorderSlot};
pub use status::*;
use status::guard;

/// Look up a resource index inside an arena slot.
fn resource(slot: &ArenaSlot, index: u32) -> Result<gpuweave_vk::ResourceId, FfiError> {
    slot.resource(index)
        .ok_or(FfiError::InvalidValue("resource index out of range"))
}

/// Hand an already opened device to the C side.
pub fn register_device(device: Device) -> u64 {
    handles::devices().insert(Arc::new(device))
}

// ── Device ──────────────────────────────────────────────────────

/// Open the configured Vulkan device. A null `config_path` reads the default
/// configuration file, falling back to built-in defaults.
#[no_mangle]
pub unsafe extern "C" fn gw_device_open(
    config_path: *const c_char,
    out_device: *mut u64,
) -> GwStatus {
    gpuweave_common::try_init_logging();
    guard("gw_device_open", || {
        if out_device.is_null() {
            return Err(FfiError::InvalidValue("out_device is null"));
        }
        let config = if config_path.is_null() {
            GpuweaveConfig::load_or_default(&default_config_path())
        } else {
            // SAFETY: caller passes a NUL-terminated string.
            let path = unsafe { CStr::from_ptr(config_path) }
                .to_str()
                .map_err(|_| FfiError::InvalidValue("config_path is not UTF-8"))?;
            GpuweaveConfig::load(path)?
        };
        let device = open_device(&config, ValidationCollector::new(), None)?;
        let handle = register_device(device);
        info!(handle, "gw_device_open");
        // SAFETY: checked non-null above.
        unsafe { *out_device = handle };
        Ok(GW_OK)
    })
}

/// Release the caller's reference. Arenas and recorders created from the
/// device stay usable until they are disposed.
#[no_mangle]
pub extern "C" fn gw_device_close(device: u64) -> GwStatus {
    guard("gw_device_close", || {
        handles::devices().remove(device)?;
        debug!(device, "gw_device_close");
        Ok(GW_OK)
    })
}

// ── Memory arenas ───────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "C" fn gw_arena_new(device: u64, out_arena: *mut u64) -> GwStatus {
    guard("gw_arena_new", || {
        if out_arena.is_null() {
            return Err(FfiError::InvalidValue("out_arena is null"));
        }
        let arena = handles::device(device)?.new_arena();
        let handle = handles::arenas().insert(ArenaSlot {
            device,
            arena,
            resources: Vec::new(),
        });
        // SAFETY: checked non-null above.
        unsafe { *out_arena = handle };
        Ok(GW_OK)
    })
}

/// Reserve a new buffer in the arena. Returns `GW_REJECTED` when the buffer
/// needs a different memory class than the arena already holds.
#[no_mangle]
pub unsafe extern "C" fn gw_arena_reserve_buffer(
    arena: u64,
    size: u64,
    usage: u32,
    host_visible: bool,
    out_index: *mut u32,
) -> GwStatus {
    guard("gw_arena_reserve_buffer", || {
        if out_index.is_null() {
            return Err(FfiError::InvalidValue("out_index is null"));
        }
        let mut slot = handles::arenas().get_mut(arena)?;
        let device = handles::device(slot.device)?;
        let usage = vk::BufferUsageFlags::from_raw(usage);
        let buffer = device.new_buffer(size, usage, host_visible)?;
        let status = reserve(&mut slot, buffer.into())?;
        if status == GW_OK {
            // SAFETY: checked non-null above.
            unsafe { *out_index = (slot.resources.len() - 1) as u32 };
        }
        Ok(status)
    })
}

/// Reserve a new device-local image in the arena.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn gw_arena_reserve_image(
    arena: u64,
    width: u32,
    height: u32,
    format: i32,
    mip_levels: u32,
    layers: u32,
    usage: u32,
    out_index: *mut u32,
) -> GwStatus {
    guard("gw_arena_reserve_image", || {
        if out_index.is_null() {
            return Err(FfiError::InvalidValue("out_index is null"));
        }
        let desc = ImageDescription::new_2d(width, height, vk::Format::from_raw(format))
            .with_mips(mip_levels)
            .with_layers(layers);
        let mut slot = handles::arenas().get_mut(arena)?;
        let device = handles::device(slot.device)?;
        let image = device.new_image(desc, vk::ImageUsageFlags::from_raw(usage))?;
        let status = reserve(&mut slot, image.into())?;
        if status == GW_OK {
            // SAFETY: checked non-null above.
            unsafe { *out_index = (slot.resources.len() - 1) as u32 };
        }
        Ok(status)
    })
}

fn reserve(slot: &mut ArenaSlot, resource: gpuweave_vk::Resource) -> Result<GwStatus, FfiError> {
    match slot.arena.reserve(resource)? {
        Reserve::Accepted(id) => {
            slot.resources.push(id);
            Ok(GW_OK)
        }
        // The refused resource is dropped here, destroying its handle.
        Reserve::Rejected(_) => Ok(GW_REJECTED),
    }
}

#[no_mangle]
pub extern "C" fn gw_arena_allocate(arena: u64) -> GwStatus {
    guard("gw_arena_allocate", || {
        handles::arenas().get_mut(arena)?.arena.allocate()?;
        Ok(GW_OK)
    })
}

/// Copy `len` bytes from `data` into a host-visible buffer at `offset`.
#[no_mangle]
pub unsafe extern "C" fn gw_arena_write(
    arena: u64,
    index: u32,
    offset: u64,
    data: *const c_void,
    len: usize,
) -> GwStatus {
    guard("gw_arena_write", || {
        if data.is_null() && len > 0 {
            return Err(FfiError::InvalidValue("data is null"));
        }
        let mut slot = handles::arenas().get_mut(arena)?;
        let id = resource(&slot, index)?;
        let bytes: &[u8] = if len == 0 {
            &[]
        } else {
            // SAFETY: caller guarantees `data` points at `len` readable bytes.
            unsafe { std::slice::from_raw_parts(data as *const u8, len) }
        };
        slot.arena.write(id, offset, bytes)?;
        Ok(GW_OK)
    })
}

/// Copy `len` bytes at `offset` of a host-visible buffer into `out`.
#[no_mangle]
pub unsafe extern "C" fn gw_arena_read(
    arena: u64,
    index: u32,
    offset: u64,
    out: *mut c_void,
    len: usize,
) -> GwStatus {
    guard("gw_arena_read", || {
        if out.is_null() && len > 0 {
            return Err(FfiError::InvalidValue("out is null"));
        }
        let slot = handles::arenas().get(arena)?;
        let id = resource(&slot, index)?;
        let mut empty = [0u8; 0];
        let bytes: &mut [u8] = if len == 0 {
            &mut empty
        } else {
            // SAFETY: caller guarantees `out` points at `len` writable bytes.
            unsafe { std::slice::from_raw_parts_mut(out as *mut u8, len) }
        };
        slot.arena.read(id, offset, bytes)?;
        Ok(GW_OK)
    })
}

/// Destroy every resource in the arena and free its memory.
#[no_mangle]
pub extern "C" fn gw_arena_dispose(arena: u64) -> GwStatus {
    guard("gw_arena_dispose", || {
        let mut slot = handles::arenas().remove(arena)?;
        slot.arena.dispose();
        debug!(arena, resources = slot.resources.len(), "gw_arena_dispose");
        Ok(GW_OK)
    })
}

// ── Command recorders ───────────────────────────────────────────

/// Create a recorder for the queue family matching `queue_flags`.
#[no_mangle]
pub unsafe extern "C" fn gw_recorder_new(
    device: u64,
    queue_flags: u32,
    single_use: bool,
    out_recorder: *mut u64,
) -> GwStatus {
    guard("gw_recorder_new", || {
        if out_recorder.is_null() {
            return Err(FfiError::InvalidValue("out_recorder is null"));
        }
        let recorder = handles::device(device)?
            .new_recorder(vk::QueueFlags::from_raw(queue_flags), single_use)?;
        let handle = handles::recorders().insert(RecorderSlot { device, recorder });
        // SAFETY: checked non-null above.
        unsafe { *out_recorder = handle };
        Ok(GW_OK)
    })
}

#[no_mangle]
pub extern "C" fn gw_recorder_begin(recorder: u64) -> GwStatus {
    guard("gw_recorder_begin", || {
        handles::recorders().get_mut(recorder)?.recorder.begin()?;
        Ok(GW_OK)
    })
}

/// Record a whole-buffer copy between two arena buffers.
#[no_mangle]
pub extern "C" fn gw_recorder_copy_buffer(
    recorder: u64,
    src_arena: u64,
    src_index: u32,
    dst_arena: u64,
    dst_index: u32,
) -> GwStatus {
    guard("gw_recorder_copy_buffer", || {
        let mut rec = handles::recorders().get_mut(recorder)?;
        let src_slot = handles::arenas().get(src_arena)?;
        let dst_ref;
        let dst_slot = if dst_arena == src_arena {
            &*src_slot
        } else {
            dst_ref = handles::arenas().get(dst_arena)?;
            &*dst_ref
        };
        let src = src_slot.arena.buffer(resource(&src_slot, src_index)?)?;
        let dst = dst_slot.arena.buffer(resource(dst_slot, dst_index)?)?;
        rec.recorder.copy_buffer(src, dst)?;
        Ok(GW_OK)
    })
}

/// Record a compute dispatch with a raw pipeline and pipeline layout.
#[no_mangle]
pub extern "C" fn gw_recorder_dispatch(
    recorder: u64,
    pipeline: u64,
    layout: u64,
    x: u32,
    y: u32,
    z: u32,
) -> GwStatus {
    guard("gw_recorder_dispatch", || {
        let item = ComputeItem {
            pipeline: PipelineBinding {
                pipeline: vk::Pipeline::from_raw(pipeline),
                layout: vk::PipelineLayout::from_raw(layout),
            },
            sets: Vec::new(),
            push: None,
            groups: [x, y, z],
        };
        handles::recorders().get_mut(recorder)?.recorder.dispatch(&item)?;
        Ok(GW_OK)
    })
}

/// Block until the last submission of the recorder has executed.
#[no_mangle]
pub extern "C" fn gw_recorder_wait(recorder: u64) -> GwStatus {
    guard("gw_recorder_wait", || {
        handles::recorders().get_mut(recorder)?.recorder.wait()?;
        Ok(GW_OK)
    })
}

#[no_mangle]
pub unsafe extern "C" fn gw_recorder_is_complete(
    recorder: u64,
    out_complete: *mut bool,
) -> GwStatus {
    guard("gw_recorder_is_complete", || {
        if out_complete.is_null() {
            return Err(FfiError::InvalidValue("out_complete is null"));
        }
        let complete = handles::recorders()
            .get_mut(recorder)?
            .recorder
            .is_complete()?;
        // SAFETY: checked non-null above.
        unsafe { *out_complete = complete };
        Ok(GW_OK)
    })
}

#[no_mangle]
pub extern "C" fn gw_recorder_dispose(recorder: u64) -> GwStatus {
    guard("gw_recorder_dispose", || {
        let mut slot = handles::recorders().remove(recorder)?;
        slot.recorder.dispose()?;
        Ok(GW_OK)
    })
}

// ── Submission ──────────────────────────────────────────────────

/// Submit the recorder after every dependency token in `waits`.
///
/// Each waited token is consumed once the submission is accepted. A non-zero
/// `signal_stage` asks for a new token in `out_token` that later submissions
/// can wait on at that stage.
#[no_mangle]
pub unsafe extern "C" fn gw_submit(
    recorder: u64,
    priority: u32,
    waits: *const u64,
    wait_count: usize,
    signal_stage: u32,
    out_token: *mut u64,
) -> GwStatus {
    guard("gw_submit", || {
        if waits.is_null() && wait_count > 0 {
            return Err(FfiError::InvalidValue("waits is null"));
        }
        if signal_stage != 0 && out_token.is_null() {
            return Err(FfiError::InvalidValue("out_token is null"));
        }
        let tokens: &[u64] = if wait_count == 0 {
            &[]
        } else {
            // SAFETY: caller guarantees `waits` holds `wait_count` handles.
            unsafe { std::slice::from_raw_parts(waits, wait_count) }
        };
        let points = tokens
            .iter()
            .map(|&t| handles::tokens().get(t).map(|p| *p))
            .collect::<Result<Vec<WaitPoint>, _>>()?;
        let deps: Vec<&dyn SubmitDependency> =
            points.iter().map(|p| p as &dyn SubmitDependency).collect();

        let mut slot = handles::recorders().get_mut(recorder)?;
        let device = handles::device(slot.device)?;
        let stage = (signal_stage != 0).then(|| vk::PipelineStageFlags::from_raw(signal_stage));
        let produced = device.submit(&mut slot.recorder, priority, &deps, stage)?;

        for &token in tokens {
            let _ = handles::tokens().remove(token);
        }
        if let Some(point) = produced {
            let token = handles::tokens().insert(point);
            // SAFETY: checked non-null above whenever a stage was requested.
            unsafe { *out_token = token };
        }
        debug!(recorder, waits = tokens.len(), "gw_submit");
        Ok(GW_OK)
    })
}

/// Drop a dependency token that will never be waited on.
#[no_mangle]
pub extern "C" fn gw_token_release(token: u64) -> GwStatus {
    guard("gw_token_release", || {
        handles::tokens().remove(token)?;
        Ok(GW_OK)
    })
}
