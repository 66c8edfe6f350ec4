use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use crate::driver::Driver;
use crate::error::{GpuError, Result};
use crate::memory::{ArenaState, MemoryArena, Reserve, Resource, ResourceId};
use crate::resource::{Buffer, Image};

/// A resource handed to a [`MemoryPool`], valid across the arenas it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolResourceId(usize);

/// Collects resources of mixed memory classes and spreads them over as
/// many arenas as needed. Each arena takes every pending resource that
/// matches the class of the first one it accepted.
pub struct MemoryPool {
    driver: Arc<dyn Driver>,
    memory_types: Arc<[vk::MemoryType]>,
    pending: Vec<(PoolResourceId, Resource)>,
    /// Filled arenas whose memory is not allocated yet.
    unallocated: Vec<(MemoryArena, Vec<(PoolResourceId, ResourceId)>)>,
    placed: HashMap<PoolResourceId, ResourceId>,
    arenas: Vec<MemoryArena>,
    next: usize,
}

impl MemoryPool {
    pub(crate) fn new(driver: Arc<dyn Driver>, memory_types: Arc<[vk::MemoryType]>) -> Self {
        Self {
            driver,
            memory_types,
            pending: Vec::new(),
            unallocated: Vec::new(),
            placed: HashMap::new(),
            arenas: Vec::new(),
            next: 0,
        }
    }

    pub fn reserve(&mut self, resource: impl Into<Resource>) -> PoolResourceId {
        let id = PoolResourceId(self.next);
        self.next += 1;
        self.pending.push((id, resource.into()));
        id
    }

    pub fn reserve_buffer(&mut self, buffer: Buffer) -> PoolResourceId {
        self.reserve(buffer)
    }

    pub fn reserve_image(&mut self, image: Image) -> PoolResourceId {
        self.reserve(image)
    }

    /// Place every pending resource, opening a new arena per memory class.
    ///
    /// A resource no memory type can hold fails the call before anything is
    /// placed. An arena whose memory allocation fails keeps its resources and
    /// is retried by the next call; an arena whose bind fails is disposed
    /// along with its resources.
    pub fn allocate(&mut self) -> Result<()> {
        for (_, resource) in &self.pending {
            resource.memory_class(&self.memory_types)?;
        }
        while !self.pending.is_empty() {
            self.fill_arena()?;
        }

        let mut queued = std::mem::take(&mut self.unallocated).into_iter();
        let mut failure = None;
        for (mut arena, keys) in queued.by_ref() {
            if let Err(e) = arena.allocate() {
                if arena.state() == ArenaState::Open {
                    self.unallocated.push((arena, keys));
                } else {
                    warn!(lost = keys.len(), error = %e, "pool arena disposed after a failed bind");
                }
                failure = Some(e);
                break;
            }
            debug!(
                arena = arena.id().raw(),
                size = arena.size(),
                resources = keys.len(),
                "pool arena allocated"
            );
            self.placed.extend(keys);
            self.arenas.push(arena);
        }
        self.unallocated.extend(queued);
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Move every pending resource of the first one's class into a new arena.
    fn fill_arena(&mut self) -> Result<()> {
        let mut arena = MemoryArena::new(self.driver.clone(), self.memory_types.clone());
        let mut keys = Vec::new();
        let mut rejected = Vec::new();
        let mut queued = std::mem::take(&mut self.pending).into_iter();
        let mut failure = None;
        for (key, resource) in queued.by_ref() {
            match arena.reserve(resource) {
                Ok(Reserve::Accepted(id)) => keys.push((key, id)),
                Ok(Reserve::Rejected(resource)) => rejected.push((key, resource)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        rejected.extend(queued);
        self.pending = rejected;
        if !keys.is_empty() {
            self.unallocated.push((arena, keys));
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn arenas(&self) -> &[MemoryArena] {
        &self.arenas
    }

    /// Resources not yet in an allocated arena.
    pub fn pending(&self) -> usize {
        self.pending.len()
            + self
                .unallocated
                .iter()
                .map(|(_, keys)| keys.len())
                .sum::<usize>()
    }

    /// Arena holding the resource and its id inside that arena.
    pub fn locate(&self, id: PoolResourceId) -> Result<(&MemoryArena, ResourceId)> {
        let placed = self.placed_id(id)?;
        let arena = self
            .arenas
            .iter()
            .find(|a| a.id() == placed.arena())
            .ok_or_else(|| GpuError::ResourceState("resource arena was disposed".to_string()))?;
        Ok((arena, placed))
    }

    fn locate_mut(&mut self, id: PoolResourceId) -> Result<(&mut MemoryArena, ResourceId)> {
        let placed = self.placed_id(id)?;
        let arena = self
            .arenas
            .iter_mut()
            .find(|a| a.id() == placed.arena())
            .ok_or_else(|| GpuError::ResourceState("resource arena was disposed".to_string()))?;
        Ok((arena, placed))
    }

    fn placed_id(&self, id: PoolResourceId) -> Result<ResourceId> {
        self.placed.get(&id).copied().ok_or_else(|| {
            GpuError::ResourceState(format!("pool resource {} is not allocated yet", id.0))
        })
    }

    pub fn buffer(&self, id: PoolResourceId) -> Result<&Buffer> {
        let (arena, placed) = self.locate(id)?;
        arena.buffer(placed)
    }

    pub fn image(&self, id: PoolResourceId) -> Result<&Image> {
        let (arena, placed) = self.locate(id)?;
        arena.image(placed)
    }

    pub fn write(&mut self, id: PoolResourceId, offset: u64, data: &[u8]) -> Result<()> {
        let (arena, placed) = self.locate_mut(id)?;
        arena.write(placed, offset, data)
    }

    pub fn read(&self, id: PoolResourceId, offset: u64, out: &mut [u8]) -> Result<()> {
        let (arena, placed) = self.locate(id)?;
        arena.read(placed, offset, out)
    }

    pub fn dispose(&mut self) {
        self.pending.clear();
        for (mut arena, _) in self.unallocated.drain(..) {
            arena.dispose();
        }
        for arena in &mut self.arenas {
            arena.dispose();
        }
        self.arenas.clear();
        self.placed.clear();
    }
}
