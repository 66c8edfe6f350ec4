//! Process-wide tables mapping the opaque handles given to C callers onto
//! the objects they name.

use std::sync::{Arc, OnceLock};

use gpuweave_core::HandleTable;
use gpuweave_vk::{CommandRecorder, Device, MemoryArena, ResourceId, WaitPoint};

pub struct ArenaSlot {
    /// Device whose resources the arena may take.
    pub device: u64,
    pub arena: MemoryArena,
    /// Accepted resources, indexed by the value handed back to the caller.
    pub resources: Vec<ResourceId>,
}

impl ArenaSlot {
    pub fn resource(&self, index: u32) -> Option<ResourceId> {
        self.resources.get(index as usize).copied()
    }
}

pub struct RecorderSlot {
    pub device: u64,
    pub recorder: CommandRecorder,
}

static DEVICES: OnceLock<HandleTable<Arc<Device>>> = OnceLock::new();
static ARENAS: OnceLock<HandleTable<ArenaSlot>> = OnceLock::new();
static RECORDERS: OnceLock<HandleTable<RecorderSlot>> = OnceLock::new();
static TOKENS: OnceLock<HandleTable<WaitPoint>> = OnceLock::new();

pub fn devices() -> &'static HandleTable<Arc<Device>> {
    DEVICES.get_or_init(|| HandleTable::new("device"))
}

pub fn arenas() -> &'static HandleTable<ArenaSlot> {
    ARENAS.get_or_init(|| HandleTable::new("arena"))
}

pub fn recorders() -> &'static HandleTable<RecorderSlot> {
    RECORDERS.get_or_init(|| HandleTable::new("recorder"))
}

pub fn tokens() -> &'static HandleTable<WaitPoint> {
    TOKENS.get_or_init(|| HandleTable::new("dependency token"))
}

/// Clone the device out of its table so no shard lock is held while it works.
pub fn device(handle: u64) -> Result<Arc<Device>, gpuweave_core::CoreError> {
    devices().get(handle).map(|d| Arc::clone(d.value()))
}
