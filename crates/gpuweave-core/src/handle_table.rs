use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;

use crate::error::CoreError;

/// Maps opaque `u64` handles, as seen by foreign callers, to owned objects.
/// Handles are never reused within one table.
pub struct HandleTable<T> {
    kind: &'static str,
    entries: DashMap<u64, T>,
    /// Counter for generating unique handles
    next: AtomicU64,
}

impl<T> HandleTable<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
            // Start from 1 so 0 can mean "no handle"
            next: AtomicU64::new(1),
        }
    }

    /// Store an object and return its new handle.
    pub fn insert(&self, value: T) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: u64) -> Result<Ref<'_, u64, T>, CoreError> {
        self.entries.get(&handle).ok_or_else(|| self.missing(handle))
    }

    pub fn get_mut(&self, handle: u64) -> Result<RefMut<'_, u64, T>, CoreError> {
        self.entries.get_mut(&handle).ok_or_else(|| self.missing(handle))
    }

    pub fn remove(&self, handle: u64) -> Result<T, CoreError> {
        self.entries
            .remove(&handle)
            .map(|(_, v)| v)
            .ok_or_else(|| self.missing(handle))
    }

    pub fn contains(&self, handle: u64) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Return number of live handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn missing(&self, handle: u64) -> CoreError {
        CoreError::HandleNotFound(format!("{} {:#x}", self.kind, handle))
    }
}
