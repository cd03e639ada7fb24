//! Buffer catalog - the buffers `use_buffers` installs on one port
//!
//! Installation is all-or-nothing: every metadata and data reference is
//! resolved against the memory registry and bounds-checked before a single
//! reference count moves. Each install or clear bumps the catalog generation,
//! so a `BufferHandle` taken from an earlier catalog no longer resolves.

use std::sync::atomic::{AtomicU64, Ordering};
use tetherproto::{BufferDesc, Direction, PortId};
use tracing::debug;

use crate::error::{NodeError, Result, Violation};
use crate::mem::{MemKey, MemoryRegistry};

// Process-wide, so a re-added port never repeats a generation.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Reference to one installed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub direction: Direction,
    pub port_id: PortId,
    pub generation: u64,
    pub index: u32,
}

/// An installed buffer and the registry entries it pins.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub desc: BufferDesc,
    pins: Vec<MemKey>,
}

impl Buffer {
    pub fn meta_key(&self) -> MemKey {
        self.pins[0]
    }

    /// Registry key of data chunk `n`.
    pub fn data_key(&self, n: usize) -> Option<MemKey> {
        self.pins.get(n + 1).copied()
    }
}

#[derive(Debug)]
pub struct BufferCatalog {
    direction: Direction,
    port_id: PortId,
    generation: u64,
    buffers: Vec<Buffer>,
}

impl BufferCatalog {
    pub fn new(direction: Direction, port_id: PortId) -> Self {
        Self {
            direction,
            port_id,
            generation: next_generation(),
            buffers: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    fn key(&self, mem_id: tetherproto::MemId) -> MemKey {
        MemKey::new(self.direction, self.port_id, mem_id)
    }

    fn validate(&self, desc: &BufferDesc, mem: &MemoryRegistry) -> Result<Vec<MemKey>> {
        let mut pins = Vec::with_capacity(1 + desc.layout.datas.len());

        let meta_key = self.key(desc.mem_id);
        let region = mem.get(&meta_key).ok_or(Violation::UnregisteredMem {
            direction: self.direction,
            port_id: self.port_id,
            mem_id: desc.mem_id,
        })?;
        region.check_range(desc.offset, desc.size)?;

        let meta_size = desc.layout.meta_size().unwrap_or(u32::MAX);
        if meta_size > desc.size {
            return Err(NodeError::OutOfBounds {
                mem_id: desc.mem_id,
                offset: u64::from(desc.offset),
                size: u64::from(meta_size),
                extent: u64::from(desc.size),
            });
        }
        pins.push(meta_key);

        for data in &desc.layout.datas {
            let key = self.key(data.mem_id);
            let region = mem.get(&key).ok_or(Violation::UnregisteredMem {
                direction: self.direction,
                port_id: self.port_id,
                mem_id: data.mem_id,
            })?;
            region.check_range(data.offset, data.size)?;
            pins.push(key);
        }

        Ok(pins)
    }

    /// Replace the catalog with `descs`. On error nothing changes.
    pub fn install(&mut self, descs: Vec<BufferDesc>, mem: &mut MemoryRegistry) -> Result<()> {
        let pins = descs
            .iter()
            .map(|d| self.validate(d, mem))
            .collect::<Result<Vec<_>>>()?;

        self.release(mem);
        self.buffers = descs
            .into_iter()
            .zip(pins)
            .map(|(desc, pins)| {
                for key in &pins {
                    mem.acquire(key);
                }
                Buffer { desc, pins }
            })
            .collect();
        self.generation = next_generation();

        debug!(
            "{}:{} installed {} buffer(s), generation {}",
            self.direction,
            self.port_id,
            self.buffers.len(),
            self.generation
        );
        Ok(())
    }

    /// Drop every buffer and invalidate outstanding handles.
    pub fn clear(&mut self, mem: &mut MemoryRegistry) {
        self.release(mem);
        self.generation = next_generation();
    }

    fn release(&mut self, mem: &mut MemoryRegistry) {
        for buffer in self.buffers.drain(..) {
            for key in &buffer.pins {
                mem.release(key);
            }
        }
    }

    pub fn handle(&self, index: u32) -> Option<BufferHandle> {
        ((index as usize) < self.buffers.len()).then_some(BufferHandle {
            direction: self.direction,
            port_id: self.port_id,
            generation: self.generation,
            index,
        })
    }

    pub fn resolve(&self, handle: &BufferHandle) -> Result<&Buffer> {
        if handle.direction != self.direction
            || handle.port_id != self.port_id
            || handle.generation != self.generation
        {
            return Err(NodeError::StaleBuffer);
        }
        self.buffers
            .get(handle.index as usize)
            .ok_or(NodeError::StaleBuffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::OwnedFd;
    use tetherproto::{BufferLayout, DataDesc, MemFlags, MemId, MemType, MetaDesc, MetaKind};

    fn registry_with(mem_ids: &[u32], size: u32) -> (MemoryRegistry, Vec<File>) {
        let mut reg = MemoryRegistry::new();
        let mut files = Vec::new();
        for &id in mem_ids {
            let file = tempfile::tempfile().unwrap();
            file.set_len(u64::from(size)).unwrap();
            reg.add(
                MemKey::new(Direction::Output, PortId(0), MemId(id)),
                MemType::Shm,
                OwnedFd::from(file.try_clone().unwrap()),
                MemFlags::READWRITE,
                0,
                size,
            )
            .unwrap();
            files.push(file);
        }
        (reg, files)
    }

    fn desc(mem_id: u32, offset: u32, size: u32, data: Option<(u32, u32, u32)>) -> BufferDesc {
        BufferDesc {
            mem_id: MemId(mem_id),
            offset,
            size,
            layout: BufferLayout {
                id: 0,
                metas: vec![MetaDesc {
                    kind: MetaKind::Header,
                    size: 32,
                }],
                datas: data
                    .map(|(mem, off, len)| DataDesc {
                        mem_id: MemId(mem),
                        offset: off,
                        size: len,
                    })
                    .into_iter()
                    .collect(),
            },
        }
    }

    fn refs(reg: &MemoryRegistry, mem: u32) -> u32 {
        reg.get(&MemKey::new(Direction::Output, PortId(0), MemId(mem)))
            .unwrap()
            .refs()
    }

    #[test]
    fn install_pins_every_region() {
        let (mut reg, _files) = registry_with(&[7, 8], 4096);
        let mut cat = BufferCatalog::new(Direction::Output, PortId(0));

        cat.install(
            vec![desc(7, 0, 64, Some((8, 0, 4096))), desc(7, 64, 64, None)],
            &mut reg,
        )
        .unwrap();

        assert_eq!(cat.len(), 2);
        assert_eq!(refs(&reg, 7), 2);
        assert_eq!(refs(&reg, 8), 1);
    }

    #[test]
    fn failed_install_changes_nothing() {
        let (mut reg, _files) = registry_with(&[7], 4096);
        let mut cat = BufferCatalog::new(Direction::Output, PortId(0));
        cat.install(vec![desc(7, 0, 64, None)], &mut reg).unwrap();
        let generation = cat.generation();

        // Second buffer's data chunk runs past the region.
        let err = cat
            .install(
                vec![desc(7, 0, 64, None), desc(7, 64, 64, Some((7, 4000, 200)))],
                &mut reg,
            )
            .unwrap_err();
        assert!(matches!(err, NodeError::OutOfBounds { .. }));
        assert_eq!(cat.len(), 1);
        assert_eq!(cat.generation(), generation);
        assert_eq!(refs(&reg, 7), 1);
    }

    #[test]
    fn unregistered_mem_is_a_violation() {
        let (mut reg, _files) = registry_with(&[7], 4096);
        let mut cat = BufferCatalog::new(Direction::Output, PortId(0));
        let err = cat
            .install(vec![desc(7, 0, 64, Some((9, 0, 16)))], &mut reg)
            .unwrap_err();
        assert!(matches!(
            err.violation(),
            Some(Violation::UnregisteredMem {
                mem_id: MemId(9),
                ..
            })
        ));
    }

    #[test]
    fn metas_must_fit_metadata_range() {
        let (mut reg, _files) = registry_with(&[7], 4096);
        let mut cat = BufferCatalog::new(Direction::Output, PortId(0));
        assert!(cat.install(vec![desc(7, 0, 16, None)], &mut reg).is_err());
    }

    #[test]
    fn clear_unpins_and_invalidates_handles() {
        let (mut reg, _files) = registry_with(&[7], 4096);
        let mut cat = BufferCatalog::new(Direction::Output, PortId(0));
        cat.install(vec![desc(7, 0, 64, None)], &mut reg).unwrap();

        let handle = cat.handle(0).unwrap();
        assert!(cat.resolve(&handle).is_ok());
        assert!(cat.handle(1).is_none());

        cat.clear(&mut reg);
        assert_eq!(refs(&reg, 7), 0);
        assert!(matches!(cat.resolve(&handle), Err(NodeError::StaleBuffer)));
    }

    #[test]
    fn reinstall_invalidates_old_handles() {
        let (mut reg, _files) = registry_with(&[7], 4096);
        let mut cat = BufferCatalog::new(Direction::Output, PortId(0));
        cat.install(vec![desc(7, 0, 64, None)], &mut reg).unwrap();
        let old = cat.handle(0).unwrap();

        cat.install(vec![desc(7, 128, 64, None)], &mut reg).unwrap();
        assert!(cat.resolve(&old).is_err());
        assert_eq!(cat.resolve(&cat.handle(0).unwrap()).unwrap().desc.offset, 128);
        assert_eq!(refs(&reg, 7), 1);
    }
}
