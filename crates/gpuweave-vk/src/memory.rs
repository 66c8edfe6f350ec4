//! Device memory arenas.
//!
//! An arena packs buffers and images that share one memory type into a
//! single driver allocation. Resources are reserved one after another, each
//! placed at the previous end rounded up to its own alignment, then
//! [`MemoryArena::allocate`] allocates the block once and binds everything.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use tracing::{debug, warn};

use crate::driver::Driver;
use crate::error::{DriverCall, GpuError, Result};
use crate::resource::{Buffer, Image, Placement};

static NEXT_ARENA: AtomicU64 = AtomicU64::new(1);

/// Process-unique arena identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId(u64);

impl ArenaId {
    fn next() -> Self {
        ArenaId(NEXT_ARENA.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A resource reserved in an arena, addressed by arena and reservation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    arena: ArenaId,
    index: usize,
}

impl ResourceId {
    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug)]
pub enum Resource {
    Buffer(Buffer),
    Image(Image),
}

impl Resource {
    /// Host-visible class for host buffers; images are always device-local.
    fn wants_host(&self) -> bool {
        match self {
            Resource::Buffer(b) => b.is_host(),
            Resource::Image(_) => false,
        }
    }

    /// Memory type and host flag the resource would be placed with.
    pub(crate) fn memory_class(&self, types: &[vk::MemoryType]) -> Result<(u32, bool)> {
        let host = self.wants_host();
        let memory_type = select_memory_type(types, self.requirements().memory_type_bits, host)?;
        Ok((memory_type, host))
    }

    fn requirements(&self) -> vk::MemoryRequirements {
        match self {
            Resource::Buffer(b) => b.requirements(),
            Resource::Image(i) => i.requirements(),
        }
    }

    fn place(&mut self, placement: Placement) {
        match self {
            Resource::Buffer(b) => b.place(placement),
            Resource::Image(i) => i.place(placement),
        }
    }

    fn bind(&mut self, memory: vk::DeviceMemory) -> Result<()> {
        match self {
            Resource::Buffer(b) => b.bind(memory),
            Resource::Image(i) => i.bind(memory),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Resource::Buffer(_) => "buffer",
            Resource::Image(_) => "image",
        }
    }
}

impl From<Buffer> for Resource {
    fn from(buffer: Buffer) -> Self {
        Resource::Buffer(buffer)
    }
}

impl From<Image> for Resource {
    fn from(image: Image) -> Self {
        Resource::Image(image)
    }
}

/// Outcome of [`MemoryArena::reserve`].
#[derive(Debug)]
pub enum Reserve {
    Accepted(ResourceId),
    /// The resource needs a different memory class; it is handed back untouched.
    Rejected(Resource),
}

impl Reserve {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Reserve::Accepted(_))
    }

    pub fn id(&self) -> Option<ResourceId> {
        match self {
            Reserve::Accepted(id) => Some(*id),
            Reserve::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaState {
    Open,
    Allocated,
    Disposed,
}

struct Entry {
    resource: Resource,
    offset: u64,
    padded_size: u64,
}

/// Host pointer to the start of a mapped allocation.
#[derive(Clone, Copy)]
struct MappedPtr(NonNull<u8>);

// SAFETY: the mapping is established once, stays valid until the arena unmaps it,
// and host-coherent memory may be accessed from any thread.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

pub struct MemoryArena {
    id: ArenaId,
    driver: Arc<dyn Driver>,
    memory_types: Arc<[vk::MemoryType]>,
    entries: Vec<Entry>,
    memory_type: Option<u32>,
    host_visible: bool,
    memory: vk::DeviceMemory,
    mapped: Option<MappedPtr>,
    state: ArenaState,
}

impl MemoryArena {
    pub(crate) fn new(driver: Arc<dyn Driver>, memory_types: Arc<[vk::MemoryType]>) -> Self {
        Self {
            id: ArenaId::next(),
            driver,
            memory_types,
            entries: Vec::new(),
            memory_type: None,
            host_visible: false,
            memory: vk::DeviceMemory::null(),
            mapped: None,
            state: ArenaState::Open,
        }
    }

    pub fn id(&self) -> ArenaId {
        self.id
    }

    pub fn state(&self) -> ArenaState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Memory type adopted from the first reservation.
    pub fn memory_type(&self) -> Option<u32> {
        self.memory_type
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Bytes the allocation needs (or has): end of the last entry.
    pub fn size(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.offset + e.padded_size)
            .unwrap_or(0)
    }

    /// Reserve space for a resource at the end of the arena.
    ///
    /// The first reservation fixes the arena's memory class. A resource of a
    /// different class comes back as [`Reserve::Rejected`] with the arena unchanged.
    pub fn reserve(&mut self, resource: impl Into<Resource>) -> Result<Reserve> {
        let mut resource = resource.into();
        if self.state != ArenaState::Open {
            return Err(GpuError::ResourceState(format!(
                "cannot reserve in an arena that is {:?}",
                self.state
            )));
        }

        let (memory_type, host) = resource.memory_class(&self.memory_types)?;
        let req = resource.requirements();

        match self.memory_type {
            None => {
                self.memory_type = Some(memory_type);
                self.host_visible = host;
            }
            Some(adopted) if adopted != memory_type || self.host_visible != host => {
                debug!(
                    arena = self.id.0,
                    adopted,
                    requested = memory_type,
                    kind = resource.kind(),
                    "reservation rejected: memory class mismatch"
                );
                return Ok(Reserve::Rejected(resource));
            }
            Some(_) => {}
        }

        let alignment = req.alignment.max(1);
        let offset = align_up(self.size(), alignment);
        let padded_size = align_up(req.size, alignment);
        resource.place(Placement {
            arena: self.id,
            offset,
            padded_size,
            bound: false,
        });
        debug!(
            arena = self.id.0,
            kind = resource.kind(),
            offset,
            padded_size,
            alignment,
            "reserved"
        );

        let index = self.entries.len();
        self.entries.push(Entry {
            resource,
            offset,
            padded_size,
        });
        Ok(Reserve::Accepted(ResourceId {
            arena: self.id,
            index,
        }))
    }

    /// Allocate the single block, map it if host-visible and bind every entry.
    ///
    /// A bind failure cannot be rolled back, so the arena is disposed before
    /// the error is returned.
    pub fn allocate(&mut self) -> Result<()> {
        if self.state != ArenaState::Open {
            return Err(GpuError::ResourceState(format!(
                "cannot allocate an arena that is {:?}",
                self.state
            )));
        }
        let memory_type = match (self.entries.is_empty(), self.memory_type) {
            (false, Some(t)) => t,
            _ => {
                return Err(GpuError::Configuration(
                    "cannot allocate an empty memory arena".to_string(),
                ))
            }
        };

        let size = self.size();
        self.memory = self
            .driver
            .allocate_memory(size, memory_type)
            .call("vkAllocateMemory")?;

        if let Err(e) = self.map_and_bind(size) {
            warn!(arena = self.id.0, error = %e, "arena allocation failed, releasing");
            self.dispose();
            return Err(e);
        }

        self.state = ArenaState::Allocated;
        debug!(
            arena = self.id.0,
            size,
            memory_type,
            host_visible = self.host_visible,
            entries = self.entries.len(),
            "arena allocated"
        );
        Ok(())
    }

    fn map_and_bind(&mut self, size: u64) -> Result<()> {
        if self.host_visible {
            let ptr = self
                .driver
                .map_memory(self.memory, size)
                .call("vkMapMemory")?;
            let ptr = NonNull::new(ptr).ok_or_else(|| {
                GpuError::ResourceState("driver returned a null mapping".to_string())
            })?;
            self.mapped = Some(MappedPtr(ptr));
        }
        for entry in &mut self.entries {
            entry.resource.bind(self.memory)?;
        }
        Ok(())
    }

    /// Unmap, destroy every owned resource, then free the allocation.
    pub fn dispose(&mut self) {
        if self.state == ArenaState::Disposed {
            return;
        }
        if self.mapped.take().is_some() {
            self.driver.unmap_memory(self.memory);
        }
        self.entries.clear();
        if self.memory != vk::DeviceMemory::null() {
            self.driver.free_memory(self.memory);
            self.memory = vk::DeviceMemory::null();
        }
        self.state = ArenaState::Disposed;
        debug!(arena = self.id.0, "arena disposed");
    }

    // ── Entry access ────────────────────────────────────────

    fn entry(&self, id: ResourceId) -> Result<&Entry> {
        if id.arena != self.id {
            return Err(GpuError::ResourceState(format!(
                "resource belongs to arena {}, not {}",
                id.arena.0, self.id.0
            )));
        }
        self.entries.get(id.index).ok_or_else(|| {
            GpuError::ResourceState(format!(
                "no resource {} in arena {} ({:?})",
                id.index, self.id.0, self.state
            ))
        })
    }

    pub fn resource(&self, id: ResourceId) -> Result<&Resource> {
        self.entry(id).map(|e| &e.resource)
    }

    pub fn buffer(&self, id: ResourceId) -> Result<&Buffer> {
        match self.resource(id)? {
            Resource::Buffer(b) => Ok(b),
            Resource::Image(_) => Err(GpuError::ResourceState(
                "resource is an image, not a buffer".to_string(),
            )),
        }
    }

    pub fn image(&self, id: ResourceId) -> Result<&Image> {
        match self.resource(id)? {
            Resource::Image(i) => Ok(i),
            Resource::Buffer(_) => Err(GpuError::ResourceState(
                "resource is a buffer, not an image".to_string(),
            )),
        }
    }

    pub fn offset(&self, id: ResourceId) -> Result<u64> {
        self.entry(id).map(|e| e.offset)
    }

    pub fn padded_size(&self, id: ResourceId) -> Result<u64> {
        self.entry(id).map(|e| e.padded_size)
    }

    // ── Host access ─────────────────────────────────────────

    /// Host pointer to a bound buffer in a host-visible arena.
    pub fn host_ptr(&self, id: ResourceId) -> Result<*mut u8> {
        let buffer = self.buffer(id)?;
        if !buffer.is_bound() {
            return Err(GpuError::ResourceState(
                "buffer memory not bound".to_string(),
            ));
        }
        let mapped = self.mapped.ok_or_else(|| {
            GpuError::ResourceState("buffer is not in host-visible memory".to_string())
        })?;
        let offset = self.entry(id)?.offset as usize;
        // SAFETY: offset lies inside the mapped allocation, which spans every entry.
        Ok(unsafe { mapped.0.as_ptr().add(offset) })
    }

    fn host_range(&self, id: ResourceId, offset: u64, len: usize) -> Result<*mut u8> {
        let size = self.buffer(id)?.size();
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > size) {
            return Err(GpuError::ResourceState(format!(
                "range {offset}+{len} exceeds buffer size {size}"
            )));
        }
        let base = self.host_ptr(id)?;
        // SAFETY: bounds checked against the buffer size above.
        Ok(unsafe { base.add(offset as usize) })
    }

    /// Copy bytes into a host-visible buffer.
    pub fn write(&mut self, id: ResourceId, offset: u64, data: &[u8]) -> Result<()> {
        let dst = self.host_range(id, offset, data.len())?;
        // SAFETY: dst is valid for data.len() bytes and cannot overlap a caller slice.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    pub fn write_pod<T: Pod>(&mut self, id: ResourceId, offset: u64, data: &[T]) -> Result<()> {
        self.write(id, offset, bytemuck::cast_slice(data))
    }

    /// Copy bytes out of a host-visible buffer.
    pub fn read(&self, id: ResourceId, offset: u64, out: &mut [u8]) -> Result<()> {
        let src = self.host_range(id, offset, out.len())?;
        // SAFETY: src is valid for out.len() bytes.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    /// The whole buffer as a mutable byte slice.
    pub fn slice_mut(&mut self, id: ResourceId) -> Result<&mut [u8]> {
        let size = self.buffer(id)?.size() as usize;
        let ptr = self.host_range(id, 0, size)?;
        // SAFETY: the &mut self borrow keeps every other slice into this arena out.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, size) })
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArena")
            .field("id", &self.id)
            .field("entries", &self.entries.len())
            .field("memory_type", &self.memory_type)
            .field("host_visible", &self.host_visible)
            .field("state", &self.state)
            .finish()
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Pick the first memory type allowed by `type_bits` that has the requested class.
///
/// Device-local requests want `DEVICE_LOCAL`; host requests want
/// `HOST_VISIBLE | HOST_COHERENT`.
pub fn select_memory_type(types: &[vk::MemoryType], type_bits: u32, host: bool) -> Result<u32> {
    let wanted = if host {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    } else {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    };
    types
        .iter()
        .enumerate()
        .take(32)
        .find(|(i, t)| type_bits & (1 << i) != 0 && t.property_flags.contains(wanted))
        .map(|(i, _)| i as u32)
        .ok_or_else(|| {
            GpuError::Configuration(format!(
                "no suitable memory found (bits {type_bits:#x}, host: {host})"
            ))
        })
}
