//! Transport area layout - two SPSC activation rings in one shared mapping
//!
//! ```text
//! 0    magic "TRNS" | version | capacity | record_size      (4 x u32)
//! 16   to_client: write_idx (64 B line) | read_idx (64 B line) | records
//! ..   to_server: same shape
//! ```
//!
//! Indices are free-running u32 counters; `write - read` is the fill level and
//! `idx & (capacity - 1)` the slot. The producer owns `write_idx` and the slot
//! contents, the consumer owns `read_idx`.

use memmap2::MmapRaw;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{NodeError, Result};

pub const MAGIC: u32 = u32::from_le_bytes(*b"TRNS");
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 16;
const INDEX_LINE: usize = 64;
const INDEX_BLOCK: usize = 2 * INDEX_LINE;

/// What an activation record asks for.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    ProcessInput = 0,
    ProcessOutput = 1,
    ReuseBuffer = 2,
    HaveOutput = 3,
    NeedInput = 4,
    Command = 5,
}

impl RecordKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(RecordKind::ProcessInput),
            1 => Some(RecordKind::ProcessOutput),
            2 => Some(RecordKind::ReuseBuffer),
            3 => Some(RecordKind::HaveOutput),
            4 => Some(RecordKind::NeedInput),
            5 => Some(RecordKind::Command),
            _ => None,
        }
    }
}

/// One ring slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivationRecord {
    pub kind: u32,
    pub port_id: u32,
    pub buffer_id: u32,
    pub status: i32,
}

pub const RECORD_SIZE: usize = size_of::<ActivationRecord>();

impl ActivationRecord {
    pub fn new(kind: RecordKind, port_id: u32, buffer_id: u32) -> Self {
        Self {
            kind: kind as u32,
            port_id,
            buffer_id,
            status: 0,
        }
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::from_u32(self.kind)
    }
}

/// Which ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingId {
    /// Server produces, client consumes.
    ToClient,
    /// Client produces, server consumes.
    ToServer,
}

fn ring_bytes(capacity: u32) -> usize {
    INDEX_BLOCK + capacity as usize * RECORD_SIZE
}

/// Bytes needed for an area with `capacity` records per ring.
pub fn required_size(capacity: u32) -> usize {
    HEADER_SIZE + 2 * ring_bytes(capacity)
}

/// A validated transport area.
pub struct TransportArea {
    map: MmapRaw,
    capacity: u32,
}

impl std::fmt::Debug for TransportArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportArea")
            .field("len", &self.map.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl TransportArea {
    fn check_layout(map: &MmapRaw, capacity: u32) -> Result<()> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(NodeError::Transport(format!(
                "ring capacity {capacity} is not a power of two"
            )));
        }
        if map.len() < required_size(capacity) {
            return Err(NodeError::Transport(format!(
                "area of {} bytes cannot hold {} records per ring",
                map.len(),
                capacity
            )));
        }
        if map.as_ptr() as usize % size_of::<AtomicU32>() != 0 {
            return Err(NodeError::Transport("area is misaligned".to_string()));
        }
        Ok(())
    }

    /// Lay out a fresh area (server side).
    pub fn init(map: MmapRaw, capacity: u32) -> Result<Self> {
        Self::check_layout(&map, capacity)?;
        let area = Self { map, capacity };
        // SAFETY: the header is four aligned u32s inside a mapping we just
        // checked; nobody else has the area yet.
        unsafe {
            let base = area.map.as_mut_ptr() as *mut u32;
            base.write_volatile(MAGIC);
            base.add(1).write_volatile(VERSION);
            base.add(2).write_volatile(capacity);
            base.add(3).write_volatile(RECORD_SIZE as u32);
        }
        for ring in [RingId::ToClient, RingId::ToServer] {
            area.write_idx(ring).store(0, Ordering::Relaxed);
            area.read_idx(ring).store(0, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);
        Ok(area)
    }

    /// Validate an area laid out by the peer (client side).
    pub fn attach(map: MmapRaw) -> Result<Self> {
        if map.len() < HEADER_SIZE {
            return Err(NodeError::Transport(format!(
                "area of {} bytes has no header",
                map.len()
            )));
        }
        if map.as_ptr() as usize % size_of::<AtomicU32>() != 0 {
            return Err(NodeError::Transport("area is misaligned".to_string()));
        }
        std::sync::atomic::fence(Ordering::Acquire);
        // SAFETY: aligned and at least HEADER_SIZE bytes, checked above.
        let (magic, version, capacity, record_size) = unsafe {
            let base = map.as_ptr() as *const u32;
            (
                base.read_volatile(),
                base.add(1).read_volatile(),
                base.add(2).read_volatile(),
                base.add(3).read_volatile(),
            )
        };
        if magic != MAGIC {
            return Err(NodeError::Transport(format!(
                "bad area magic {magic:#010x}"
            )));
        }
        if version != VERSION {
            return Err(NodeError::Transport(format!(
                "unsupported area version {version}"
            )));
        }
        if record_size as usize != RECORD_SIZE {
            return Err(NodeError::Transport(format!(
                "record size {record_size}, expected {RECORD_SIZE}"
            )));
        }
        Self::check_layout(&map, capacity)?;
        Ok(Self { map, capacity })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn ring_base(&self, ring: RingId) -> usize {
        match ring {
            RingId::ToClient => HEADER_SIZE,
            RingId::ToServer => HEADER_SIZE + ring_bytes(self.capacity),
        }
    }

    fn index(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: `offset` is one of the index slots inside the checked
        // layout, 4-byte aligned, and the mapping outlives `&self`.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn write_idx(&self, ring: RingId) -> &AtomicU32 {
        self.index(self.ring_base(ring))
    }

    fn read_idx(&self, ring: RingId) -> &AtomicU32 {
        self.index(self.ring_base(ring) + INDEX_LINE)
    }

    fn slot(&self, ring: RingId, idx: u32) -> *mut ActivationRecord {
        let n = (idx & (self.capacity - 1)) as usize;
        let offset = self.ring_base(ring) + INDEX_BLOCK + n * RECORD_SIZE;
        // SAFETY: `n < capacity`, so the slot lies inside the checked layout.
        unsafe { self.map.as_mut_ptr().add(offset) as *mut ActivationRecord }
    }

    /// Records waiting in `ring`.
    pub fn len(&self, ring: RingId) -> u32 {
        let w = self.write_idx(ring).load(Ordering::Acquire);
        let r = self.read_idx(ring).load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    pub fn is_empty(&self, ring: RingId) -> bool {
        self.len(ring) == 0
    }

    /// Producer side. Only one thread may push to a given ring.
    pub fn push(&self, ring: RingId, record: ActivationRecord) -> Result<()> {
        let w = self.write_idx(ring).load(Ordering::Relaxed);
        let r = self.read_idx(ring).load(Ordering::Acquire);
        if w.wrapping_sub(r) >= self.capacity {
            return Err(NodeError::RingFull);
        }
        // SAFETY: the slot is free (consumer is past it) and only the single
        // producer writes slots.
        unsafe { ptr::write_volatile(self.slot(ring, w), record) };
        self.write_idx(ring).store(w.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side. Only one thread may pop from a given ring.
    pub fn pop(&self, ring: RingId) -> Option<ActivationRecord> {
        let r = self.read_idx(ring).load(Ordering::Relaxed);
        let w = self.write_idx(ring).load(Ordering::Acquire);
        if r == w {
            return None;
        }
        // SAFETY: the producer published this slot with the release store.
        let record = unsafe { ptr::read_volatile(self.slot(ring, r)) };
        self.read_idx(ring).store(r.wrapping_add(1), Ordering::Release);
        Some(record)
    }
}

// SAFETY: all shared state is accessed through atomics or slots handed over
// by the SPSC protocol above.
unsafe impl Send for TransportArea {}
unsafe impl Sync for TransportArea {}

#[cfg(test)]
mod tests {
    use super::*;
    use memmap2::MmapOptions;

    fn mapping(len: usize) -> (MmapRaw, std::fs::File) {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len as u64).unwrap();
        let map = MmapOptions::new().len(len).map_raw(&file).unwrap();
        (map, file)
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(RECORD_SIZE, 16);
        assert_eq!(required_size(64), 16 + 2 * (128 + 64 * 16));
    }

    #[test]
    fn attach_sees_what_init_wrote() {
        let (map, file) = mapping(required_size(8));
        let server = TransportArea::init(map, 8).unwrap();

        let peer = MmapOptions::new()
            .len(required_size(8))
            .map_raw(&file)
            .unwrap();
        let client = TransportArea::attach(peer).unwrap();
        assert_eq!(client.capacity(), 8);

        server
            .push(
                RingId::ToClient,
                ActivationRecord::new(RecordKind::ProcessOutput, 0, 3),
            )
            .unwrap();
        let rec = client.pop(RingId::ToClient).unwrap();
        assert_eq!(rec.kind(), Some(RecordKind::ProcessOutput));
        assert_eq!(rec.buffer_id, 3);
        assert!(client.pop(RingId::ToClient).is_none());
        assert!(server.is_empty(RingId::ToServer));
    }

    #[test]
    fn ring_fills_and_wraps() {
        let (map, _file) = mapping(required_size(4));
        let area = TransportArea::init(map, 4).unwrap();

        for round in 0..3u32 {
            for i in 0..4 {
                area.push(
                    RingId::ToServer,
                    ActivationRecord::new(RecordKind::HaveOutput, 0, round * 4 + i),
                )
                .unwrap();
            }
            assert!(matches!(
                area.push(RingId::ToServer, ActivationRecord::default()),
                Err(NodeError::RingFull)
            ));
            for i in 0..4 {
                assert_eq!(
                    area.pop(RingId::ToServer).unwrap().buffer_id,
                    round * 4 + i
                );
            }
        }
        assert_eq!(area.len(RingId::ToServer), 0);
    }

    #[test]
    fn attach_rejects_garbage() {
        let (map, _file) = mapping(required_size(4));
        assert!(TransportArea::attach(map).is_err());
    }

    #[test]
    fn init_rejects_short_area() {
        let (map, _file) = mapping(64);
        assert!(TransportArea::init(map, 64).is_err());
    }
}
