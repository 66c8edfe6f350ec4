//! Descriptor layouts, pools and sets.
//!
//! A layout is built as a chain: every [`DescriptorLayout`] is one binding
//! plus a reference to the layout it extends, so its binding index is its
//! depth in the chain. Each link owns a driver layout covering every binding
//! up to and including itself.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::driver::{DescriptorInfo, DescriptorWrite, Driver, LayoutBinding};
use crate::error::{DriverCall, GpuError, Result};
use crate::objects::{ImageView, Sampler};
use crate::resource::Buffer;

struct LayoutNode {
    driver: Arc<dyn Driver>,
    binding: LayoutBinding,
    index: u32,
    prev: Option<Arc<LayoutNode>>,
    handle: vk::DescriptorSetLayout,
    update_after_bind: bool,
}

impl Drop for LayoutNode {
    fn drop(&mut self) {
        self.driver.destroy_descriptor_set_layout(self.handle);
    }
}

#[derive(Clone)]
pub struct DescriptorLayout {
    node: Arc<LayoutNode>,
}

impl DescriptorLayout {
    pub(crate) fn root(driver: Arc<dyn Driver>, binding: LayoutBinding) -> Result<Self> {
        Self::link(driver, binding, None)
    }

    /// Extend the chain with the next binding.
    pub fn add(&self, binding: LayoutBinding) -> Result<Self> {
        Self::link(self.node.driver.clone(), binding, Some(self.node.clone()))
    }

    pub fn add_binding(
        &self,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Result<Self> {
        self.add(LayoutBinding {
            descriptor_type,
            count,
            stages,
            flags: vk::DescriptorBindingFlags::empty(),
        })
    }

    fn link(
        driver: Arc<dyn Driver>,
        binding: LayoutBinding,
        prev: Option<Arc<LayoutNode>>,
    ) -> Result<Self> {
        if binding.count == 0 {
            return Err(GpuError::Configuration(
                "descriptor binding count must be at least 1".to_string(),
            ));
        }
        let index = prev.as_ref().map_or(0, |p| p.index + 1);
        let mut bindings = prev.as_ref().map(collect).unwrap_or_default();
        bindings.push(binding);
        let update_after_bind = bindings.iter().any(|b| !b.flags.is_empty());
        let handle = driver
            .create_descriptor_set_layout(&bindings, update_after_bind)
            .call("vkCreateDescriptorSetLayout")?;
        debug!(?handle, index, ty = ?binding.descriptor_type, "created descriptor layout");
        Ok(Self {
            node: Arc::new(LayoutNode {
                driver,
                binding,
                index,
                prev,
                handle,
                update_after_bind,
            }),
        })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.node.handle
    }

    /// Binding index of the last link.
    pub fn index(&self) -> u32 {
        self.node.index
    }

    pub fn binding_count(&self) -> usize {
        self.node.index as usize + 1
    }

    pub fn update_after_bind(&self) -> bool {
        self.node.update_after_bind
    }

    /// All bindings in insertion order.
    pub fn bindings(&self) -> Vec<LayoutBinding> {
        collect(&self.node)
    }

    /// Descriptor type of `binding`, found by walking back along the chain.
    pub fn binding_type(&self, binding: u32) -> Result<vk::DescriptorType> {
        let mut node = Some(&self.node);
        while let Some(n) = node {
            if n.index == binding {
                return Ok(n.binding.descriptor_type);
            }
            node = n.prev.as_ref();
        }
        Err(GpuError::ResourceState(format!(
            "no such binding {binding} in descriptor set layout"
        )))
    }

    /// Pool sizes for `capacity` sets of this layout.
    pub fn pool_sizes(&self, capacity: u32) -> Vec<vk::DescriptorPoolSize> {
        pool_sizes(&self.bindings(), capacity)
    }

    pub fn new_pool(&self, capacity: u32) -> Result<DescriptorPool> {
        DescriptorPool::new(self.clone(), capacity)
    }
}

impl std::fmt::Debug for DescriptorLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorLayout")
            .field("handle", &self.node.handle)
            .field("bindings", &self.binding_count())
            .finish()
    }
}

fn collect(node: &Arc<LayoutNode>) -> Vec<LayoutBinding> {
    let mut out = Vec::with_capacity(node.index as usize + 1);
    let mut cur = Some(node);
    while let Some(n) = cur {
        out.push(n.binding);
        cur = n.prev.as_ref();
    }
    out.reverse();
    out
}

/// Merge bindings by descriptor type, `count * capacity` each, keeping the
/// order in which each type first appears.
pub fn pool_sizes(bindings: &[LayoutBinding], capacity: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let count = binding.count * capacity;
        match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

// ── Pool / Set ──────────────────────────────────────────────

struct PoolInner {
    driver: Arc<dyn Driver>,
    handle: vk::DescriptorPool,
    layout: DescriptorLayout,
    capacity: u32,
    allocated: AtomicU32,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.driver.destroy_descriptor_pool(self.handle);
    }
}

/// Room for `capacity` sets of one layout. Sets keep the pool alive.
pub struct DescriptorPool {
    inner: Arc<PoolInner>,
}

impl DescriptorPool {
    fn new(layout: DescriptorLayout, capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(GpuError::Configuration(
                "descriptor pool capacity must be at least 1".to_string(),
            ));
        }
        let driver = layout.node.driver.clone();
        let sizes = layout.pool_sizes(capacity);
        let handle = driver
            .create_descriptor_pool(capacity, &sizes, layout.update_after_bind())
            .call("vkCreateDescriptorPool")?;
        debug!(?handle, capacity, "created descriptor pool");
        Ok(Self {
            inner: Arc::new(PoolInner {
                driver,
                handle,
                layout,
                capacity,
                allocated: AtomicU32::new(0),
            }),
        })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.inner.handle
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.inner.allocated.load(Ordering::Acquire)
    }

    pub fn alloc(&self) -> Result<DescriptorSet> {
        let inner = &self.inner;
        inner
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < inner.capacity).then_some(n + 1)
            })
            .map_err(|_| {
                GpuError::ResourceState(format!(
                    "descriptor pool exhausted ({} sets)",
                    inner.capacity
                ))
            })?;
        let handle = match inner
            .driver
            .allocate_descriptor_set(inner.handle, inner.layout.handle())
        {
            Ok(handle) => handle,
            Err(result) => {
                inner.allocated.fetch_sub(1, Ordering::AcqRel);
                return Err(GpuError::Driver {
                    call: "vkAllocateDescriptorSets",
                    result,
                });
            }
        };
        Ok(DescriptorSet {
            pool: inner.clone(),
            handle,
        })
    }
}

pub struct DescriptorSet {
    pool: Arc<PoolInner>,
    handle: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    pub fn layout(&self) -> &DescriptorLayout {
        &self.pool.layout
    }

    /// Point `binding` at a range of `buffer`. `from == 0 && size == 0`
    /// means the whole buffer.
    pub fn write_buffer(&self, binding: u32, buffer: &Buffer, from: u64, size: u64) -> Result<()> {
        buffer.ensure_bound("descriptor write")?;
        let descriptor_type = self.pool.layout.binding_type(binding)?;
        let range = if from == 0 && size == 0 {
            vk::WHOLE_SIZE
        } else {
            if from + size > buffer.size() {
                return Err(GpuError::ResourceState(format!(
                    "descriptor range {from}+{size} exceeds buffer size {}",
                    buffer.size()
                )));
            }
            size
        };
        self.pool.driver.update_descriptor_set(&DescriptorWrite {
            set: self.handle,
            binding,
            array_element: 0,
            descriptor_type,
            info: DescriptorInfo::Buffer {
                buffer: buffer.handle(),
                offset: from,
                range,
            },
        });
        Ok(())
    }

    pub fn write_image(
        &self,
        binding: u32,
        array_element: u32,
        view: &ImageView,
        layout: vk::ImageLayout,
        sampler: Option<&Sampler>,
    ) -> Result<()> {
        let descriptor_type = self.pool.layout.binding_type(binding)?;
        if descriptor_type == vk::DescriptorType::COMBINED_IMAGE_SAMPLER && sampler.is_none() {
            return Err(GpuError::Configuration(format!(
                "binding {binding} is a combined image sampler but no sampler was given"
            )));
        }
        self.pool.driver.update_descriptor_set(&DescriptorWrite {
            set: self.handle,
            binding,
            array_element,
            descriptor_type,
            info: DescriptorInfo::Image {
                view: view.handle(),
                layout,
                sampler: sampler.map_or(vk::Sampler::null(), |s| s.handle()),
            },
        });
        Ok(())
    }
}
