//! Memory region registry - shared segments announced by `add_mem`
//!
//! Regions are keyed by `(direction, port_id, mem_id)` and mapped locally with
//! memmap2 over `[offset, offset + size)` of the received descriptor. The
//! registering side owns the descriptor; this side only holds a mapping, so
//! the descriptor is closed right after mapping.
//!
//! Buffers pin regions through reference counts kept here. A region is never
//! revoked on its own: it lives until replaced (when unpinned) or until the
//! whole session is torn down.

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use tetherproto::{Direction, MemFlags, MemId, MemType, PortId};
use tracing::debug;

use crate::error::{NodeError, Result, Violation};

/// Registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemKey {
    pub direction: Direction,
    pub port_id: PortId,
    pub mem_id: MemId,
}

impl MemKey {
    pub fn new(direction: Direction, port_id: PortId, mem_id: MemId) -> Self {
        Self {
            direction,
            port_id,
            mem_id,
        }
    }
}

impl fmt::Display for MemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/mem{}", self.direction, self.port_id, self.mem_id)
    }
}

/// What makes two registrations "the same descriptor".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Identity {
    dev: u64,
    ino: u64,
    offset: u32,
    size: u32,
    flags: MemFlags,
}

enum Mapping {
    Read(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::Read(m) => &m[..],
            Mapping::ReadWrite(m) => &m[..],
        }
    }
}

/// A mapped region.
pub struct MemRegion {
    key: MemKey,
    mem_type: MemType,
    flags: MemFlags,
    identity: Identity,
    map: Mapping,
    refs: u32,
}

impl fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRegion")
            .field("key", &self.key)
            .field("mem_type", &self.mem_type)
            .field("flags", &self.flags)
            .field("size", &self.identity.size)
            .field("refs", &self.refs)
            .finish()
    }
}

impl MemRegion {
    fn map(
        key: MemKey,
        mem_type: MemType,
        fd: OwnedFd,
        flags: MemFlags,
        offset: u32,
        size: u32,
    ) -> Result<Self> {
        let file = File::from(fd);
        let meta = file
            .metadata()
            .map_err(|e| NodeError::resource(format!("fstat {key}"), e))?;

        // dma-bufs report no size; trust the sender for those.
        let extent = meta.len();
        let end = u64::from(offset) + u64::from(size);
        if size == 0 || (mem_type != MemType::DmaBuf && end > extent) {
            return Err(NodeError::OutOfBounds {
                mem_id: key.mem_id,
                offset: u64::from(offset),
                size: u64::from(size),
                extent,
            });
        }

        let mut opts = MmapOptions::new();
        opts.offset(u64::from(offset)).len(size as usize);

        // SAFETY: the mapping is private to this registry and only handed out
        // as bounds-checked slices; concurrent writers are the ring's business.
        let map = if flags.contains(MemFlags::WRITE) {
            Mapping::ReadWrite(
                unsafe { opts.map_mut(&file) }
                    .map_err(|e| NodeError::resource(format!("mmap {key} read-write"), e))?,
            )
        } else {
            Mapping::Read(
                unsafe { opts.map(&file) }
                    .map_err(|e| NodeError::resource(format!("mmap {key} read-only"), e))?,
            )
        };

        Ok(Self {
            key,
            mem_type,
            flags,
            identity: Identity {
                dev: meta.dev(),
                ino: meta.ino(),
                offset,
                size,
                flags,
            },
            map,
            refs: 0,
        })
    }

    pub fn key(&self) -> MemKey {
        self.key
    }

    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Mapped length in bytes.
    pub fn size(&self) -> u32 {
        self.identity.size
    }

    /// Number of installed buffers pinning this region.
    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, Mapping::ReadWrite(_))
    }

    /// Check `[offset, offset + size)` lies inside the mapping.
    pub fn check_range(&self, offset: u32, size: u32) -> Result<()> {
        let end = u64::from(offset) + u64::from(size);
        if end > u64::from(self.identity.size) {
            return Err(NodeError::OutOfBounds {
                mem_id: self.key.mem_id,
                offset: u64::from(offset),
                size: u64::from(size),
                extent: u64::from(self.identity.size),
            });
        }
        Ok(())
    }

    pub fn slice(&self, offset: u32, size: u32) -> Result<&[u8]> {
        self.check_range(offset, size)?;
        let start = offset as usize;
        Ok(&self.map.bytes()[start..start + size as usize])
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| NodeError::OutOfBounds {
            mem_id: self.key.mem_id,
            offset: u64::from(offset),
            size: data.len() as u64,
            extent: u64::from(self.identity.size),
        })?;
        self.check_range(offset, len)?;
        match &mut self.map {
            Mapping::ReadWrite(m) => {
                let start = offset as usize;
                m[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            Mapping::Read(_) => Err(NodeError::ReadOnly(self.key.mem_id)),
        }
    }
}

/// Result of an `add_mem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Registered,
    /// Same descriptor, range and flags as the existing entry.
    Unchanged,
    /// A different descriptor took over an unpinned entry.
    Replaced,
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    regions: HashMap<MemKey, MemRegion>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map and register a region.
    ///
    /// The new descriptor is mapped before the old entry is touched, so a
    /// failed registration leaves the registry as it was.
    pub fn add(
        &mut self,
        key: MemKey,
        mem_type: MemType,
        fd: OwnedFd,
        flags: MemFlags,
        offset: u32,
        size: u32,
    ) -> Result<AddOutcome> {
        let region = MemRegion::map(key, mem_type, fd, flags, offset, size)?;

        let outcome = match self.regions.get(&key) {
            Some(existing) if existing.identity == region.identity => {
                debug!("{key} re-registered unchanged");
                return Ok(AddOutcome::Unchanged);
            }
            Some(existing) if existing.refs > 0 => {
                return Err(Violation::MemInUse {
                    mem_id: key.mem_id,
                    refs: existing.refs,
                }
                .into());
            }
            Some(_) => AddOutcome::Replaced,
            None => AddOutcome::Registered,
        };

        debug!(
            "{key} {:?} {} bytes {:?}: {:?}",
            mem_type, size, flags, outcome
        );
        self.regions.insert(key, region);
        Ok(outcome)
    }

    pub fn get(&self, key: &MemKey) -> Option<&MemRegion> {
        self.regions.get(key)
    }

    pub fn get_mut(&mut self, key: &MemKey) -> Option<&mut MemRegion> {
        self.regions.get_mut(key)
    }

    pub fn contains(&self, key: &MemKey) -> bool {
        self.regions.contains_key(key)
    }

    pub(crate) fn acquire(&mut self, key: &MemKey) {
        if let Some(region) = self.regions.get_mut(key) {
            region.refs += 1;
        }
    }

    pub(crate) fn release(&mut self, key: &MemKey) {
        if let Some(region) = self.regions.get_mut(key) {
            region.refs = region.refs.saturating_sub(1);
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Unmap everything.
    pub fn clear(&mut self) {
        if !self.regions.is_empty() {
            debug!("unmapping {} region(s)", self.regions.len());
        }
        self.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn backing(len: u64) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len).unwrap();
        file
    }

    fn fd_of(file: &File) -> OwnedFd {
        OwnedFd::from(file.try_clone().unwrap())
    }

    fn key(mem: u32) -> MemKey {
        MemKey::new(Direction::Output, PortId(0), MemId(mem))
    }

    #[test]
    fn maps_and_reads_through_offset() {
        let mut file = backing(8192);
        file.write_all(&[0u8; 4096]).unwrap();
        file.write_all(b"tether").unwrap();

        let mut reg = MemoryRegistry::new();
        let outcome = reg
            .add(key(7), MemType::MemFd, fd_of(&file), MemFlags::READ, 4096, 4096)
            .unwrap();
        assert_eq!(outcome, AddOutcome::Registered);

        let region = reg.get(&key(7)).unwrap();
        assert_eq!(region.slice(0, 6).unwrap(), b"tether");
        assert!(!region.is_writable());
    }

    #[test]
    fn rejects_range_past_end_of_file() {
        let file = backing(4096);
        let mut reg = MemoryRegistry::new();
        let err = reg
            .add(key(1), MemType::Shm, fd_of(&file), MemFlags::READ, 0, 8192)
            .unwrap_err();
        assert!(matches!(err, NodeError::OutOfBounds { extent: 4096, .. }));
        assert!(reg.is_empty());
    }

    #[test]
    fn read_only_regions_refuse_writes() {
        let file = backing(4096);
        let mut reg = MemoryRegistry::new();
        reg.add(key(2), MemType::Shm, fd_of(&file), MemFlags::READ, 0, 4096)
            .unwrap();
        let err = reg.get_mut(&key(2)).unwrap().write(0, b"x").unwrap_err();
        assert!(matches!(err, NodeError::ReadOnly(MemId(2))));

        reg.add(
            key(3),
            MemType::Shm,
            fd_of(&file),
            MemFlags::READWRITE,
            0,
            4096,
        )
        .unwrap();
        reg.get_mut(&key(3)).unwrap().write(10, b"hi").unwrap();
        assert_eq!(reg.get(&key(2)).unwrap().slice(10, 2).unwrap(), b"hi");
    }

    #[test]
    fn identical_registration_is_a_noop() {
        let file = backing(4096);
        let mut reg = MemoryRegistry::new();
        reg.add(key(7), MemType::Shm, fd_of(&file), MemFlags::READWRITE, 0, 4096)
            .unwrap();
        let again = reg
            .add(key(7), MemType::Shm, fd_of(&file), MemFlags::READWRITE, 0, 4096)
            .unwrap();
        assert_eq!(again, AddOutcome::Unchanged);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn pinned_region_cannot_be_replaced() {
        let a = backing(4096);
        let b = backing(4096);
        let mut reg = MemoryRegistry::new();
        reg.add(key(7), MemType::Shm, fd_of(&a), MemFlags::READ, 0, 4096)
            .unwrap();
        reg.acquire(&key(7));

        let err = reg
            .add(key(7), MemType::Shm, fd_of(&b), MemFlags::READ, 0, 4096)
            .unwrap_err();
        assert!(matches!(
            err.violation(),
            Some(Violation::MemInUse { refs: 1, .. })
        ));

        reg.release(&key(7));
        let outcome = reg
            .add(key(7), MemType::Shm, fd_of(&b), MemFlags::READ, 0, 4096)
            .unwrap();
        assert_eq!(outcome, AddOutcome::Replaced);
    }

    #[test]
    fn check_range_is_overflow_safe() {
        let file = backing(4096);
        let mut reg = MemoryRegistry::new();
        reg.add(key(1), MemType::Shm, fd_of(&file), MemFlags::READ, 0, 4096)
            .unwrap();
        let region = reg.get(&key(1)).unwrap();
        assert!(region.check_range(4032, 64).is_ok());
        assert!(region.check_range(4033, 64).is_err());
        assert!(region.check_range(u32::MAX, u32::MAX).is_err());
    }
}
