//! Buffer objects and the object store

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GemError, GemResult};
use crate::hw::EngineId;

/// GPU page size
pub const PAGE_SIZE: u64 = 4096;

/// Stable index of a buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

bitflags::bitflags! {
    /// Memory domains an object may be read or written through
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Domains: u32 {
        /// CPU caches
        const CPU = 1 << 0;
        /// Render target caches
        const RENDER = 1 << 1;
        /// Texture sampler caches
        const SAMPLER = 1 << 2;
        /// Command streamer
        const COMMAND = 1 << 3;
        /// Instruction cache
        const INSTRUCTION = 1 << 4;
        /// Vertex fetch
        const VERTEX = 1 << 5;
        /// Uncached aperture access
        const GTT = 1 << 6;
        /// Every domain that lives on the GPU side
        const GPU = Self::RENDER.bits()
            | Self::SAMPLER.bits()
            | Self::COMMAND.bits()
            | Self::INSTRUCTION.bits()
            | Self::VERTEX.bits();
    }
}

impl Default for Domains {
    fn default() -> Self {
        Domains::empty()
    }
}

/// Tiling layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tiling {
    /// Linear
    #[default]
    None,
    /// X-major tiles
    X,
    /// Y-major tiles
    Y,
}

/// Cache-coherency class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    /// Not snooped; CPU writes need a clflush before GPU use
    #[default]
    Uncached,
    /// Coherent with the CPU last-level cache
    Llc,
}

/// A GPU-visible allocation
#[derive(Debug, Clone)]
pub struct BufferObject {
    /// Stable id
    pub id: ObjectId,
    /// Size in bytes, page aligned
    pub size: u64,
    /// Coherency class
    pub cache_level: CacheLevel,
    /// Tiling layout
    pub tiling: Tiling,
    /// Row pitch for tiled layouts
    pub stride: u32,
    /// Client handles referencing this object
    pub handle_count: u32,
    /// Domains the current contents are valid in
    pub read_domains: Domains,
    /// Domain holding unflushed writes
    pub write_domain: Domains,
    /// Read domains requested by the submission being built
    pub pending_read: Domains,
    /// Write domain requested by the submission being built
    pub pending_write: Domains,
    /// Last request reading the object
    pub last_read: Option<(EngineId, u32)>,
    /// Last request writing the object
    pub last_write: Option<(EngineId, u32)>,
    /// Last request that used the object through a fence
    pub last_fenced: Option<(EngineId, u32)>,
    /// Display planes with a flip of this object still pending
    pub pending_flip: u32,
    /// Unretired requests referencing the object
    pub active_refs: u32,
    data: Vec<u8>,
}

impl BufferObject {
    fn new(id: ObjectId, size: u64) -> Self {
        Self {
            id,
            size,
            cache_level: CacheLevel::default(),
            tiling: Tiling::default(),
            stride: 0,
            handle_count: 1,
            read_domains: Domains::CPU,
            write_domain: Domains::CPU,
            pending_read: Domains::empty(),
            pending_write: Domains::empty(),
            last_read: None,
            last_write: None,
            last_fenced: None,
            pending_flip: 0,
            active_refs: 0,
            data: vec![0; size as usize],
        }
    }

    /// Whether GPU work still references the object
    pub fn is_active(&self) -> bool {
        self.active_refs > 0
    }

    /// Whether the object can be freed
    pub fn is_orphaned(&self) -> bool {
        self.handle_count == 0 && !self.is_active()
    }

    /// Alignment a fenced binding of this object needs
    pub fn fence_alignment(&self) -> u64 {
        match self.tiling {
            Tiling::None => PAGE_SIZE,
            _ => self.size.next_power_of_two().max(PAGE_SIZE),
        }
    }

    /// Copy bytes into the backing store
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> GemResult<()> {
        let range = self.checked_range(offset, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy bytes out of the backing store
    pub fn read(&self, offset: u64, len: usize) -> GemResult<Vec<u8>> {
        let range = self.checked_range(offset, len)?;
        Ok(self.data[range].to_vec())
    }

    /// Little-endian dword at `offset`
    pub fn read_u32(&self, offset: u64) -> GemResult<u32> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Store a little-endian dword at `offset`
    pub fn write_u32(&mut self, offset: u64, value: u32) -> GemResult<()> {
        self.write(offset, &value.to_le_bytes())
    }

    fn checked_range(&self, offset: u64, len: usize) -> GemResult<std::ops::Range<usize>> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                GemError::InvalidArgument(format!(
                    "access {:#x}+{} outside {} of {} bytes",
                    offset, len, self.id, self.size
                ))
            })?;
        Ok(offset as usize..end as usize)
    }
}

/// Arena of buffer objects keyed by [`ObjectId`]
#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: HashMap<ObjectId, BufferObject>,
    next_id: u32,
}

impl ObjectStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an object of at least `size` bytes, rounded up to a page
    pub fn create(&mut self, size: u64) -> GemResult<ObjectId> {
        if size == 0 {
            return Err(GemError::InvalidArgument("zero-sized object".into()));
        }
        let size = (size + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        self.next_id += 1;
        let id = ObjectId(self.next_id);
        self.objects.insert(id, BufferObject::new(id, size));
        Ok(id)
    }

    /// Look up an object
    pub fn get(&self, id: ObjectId) -> GemResult<&BufferObject> {
        self.objects.get(&id).ok_or(GemError::InvalidHandle(id.0))
    }

    /// Look up an object mutably
    pub fn get_mut(&mut self, id: ObjectId) -> GemResult<&mut BufferObject> {
        self.objects.get_mut(&id).ok_or(GemError::InvalidHandle(id.0))
    }

    /// Drop an object from the arena
    pub fn remove(&mut self, id: ObjectId) -> Option<BufferObject> {
        self.objects.remove(&id)
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// No live objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Iterate live objects
    pub fn iter(&self) -> impl Iterator<Item = &BufferObject> {
        self.objects.values()
    }

    /// Iterate live objects mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferObject> {
        self.objects.values_mut()
    }
}
