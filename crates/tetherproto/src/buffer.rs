//! Buffer descriptors carried by `use_buffers`.
//!
//! A buffer's metadata lives at `[offset, offset + size)` of the region named
//! by `mem_id`; the metas listed in its layout are packed there in order.
//! Payload chunks (`datas`) may live in further regions.

use serde::{Deserialize, Serialize};

use crate::types::MemId;

/// Kind of a metadata block inside a buffer's metadata range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaKind {
    Header,
    Pointer,
    VideoCrop,
    Ringbuffer,
    Shared,
}

/// One metadata block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDesc {
    pub kind: MetaKind,
    pub size: u32,
}

/// One payload chunk, referencing a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDesc {
    pub mem_id: MemId,
    pub offset: u32,
    pub size: u32,
}

/// Application-level buffer structure: headers and chunks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferLayout {
    pub id: u32,
    pub metas: Vec<MetaDesc>,
    pub datas: Vec<DataDesc>,
}

impl BufferLayout {
    /// Total bytes the metas occupy, or `None` on overflow.
    pub fn meta_size(&self) -> Option<u32> {
        self.metas
            .iter()
            .try_fold(0u32, |acc, meta| acc.checked_add(meta.size))
    }
}

/// Entry of a `use_buffers` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDesc {
    /// Region holding the metadata.
    pub mem_id: MemId,
    pub offset: u32,
    pub size: u32,
    pub layout: BufferLayout,
}

impl BufferDesc {
    /// Every region this buffer touches, metadata first.
    pub fn mem_ids(&self) -> impl Iterator<Item = MemId> + '_ {
        std::iter::once(self.mem_id).chain(self.layout.datas.iter().map(|d| d.mem_id))
    }
}
