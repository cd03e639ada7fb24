//! Port state machine
//!
//! ```text
//! absent ──add_port──▶ added ──formats known──▶ negotiating-format
//!                                                   │        ▲
//!                               set_format + use_buffers    set_format
//!                                                   ▼        │
//!                                                configured ─┘
//! ```
//!
//! Removal drops the port; a later `add_port` with the same id starts over.
//! A `set_format` always invalidates the buffer catalog, so a reconfigured
//! port needs fresh `add_mem`/`use_buffers` before it is usable again.

use std::collections::BTreeMap;
use std::fmt;
use tetherproto::{BufferDesc, Direction, FormatFlags, Pod, PortChange, PortId, PortInfo};

use crate::buffers::BufferCatalog;
use crate::error::{NodeError, Result, Violation};
use crate::mem::MemoryRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    /// Created, no possible formats known yet.
    Added,
    /// Possible formats known; format and buffers not both settled.
    NegotiatingFormat,
    /// Format accepted and buffers installed.
    Configured,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Added => write!(f, "added"),
            PortState::NegotiatingFormat => write!(f, "negotiating-format"),
            PortState::Configured => write!(f, "configured"),
        }
    }
}

/// Negotiable port state as carried by `port_update`.
///
/// Only the fields selected by `change_mask` mean anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortUpdate {
    pub change_mask: PortChange,
    pub possible_formats: Vec<Pod>,
    pub format: Option<Pod>,
    pub params: Vec<Pod>,
    pub info: Option<PortInfo>,
}

impl PortUpdate {
    pub fn possible_formats(mut self, formats: Vec<Pod>) -> Self {
        self.change_mask |= PortChange::POSSIBLE_FORMATS;
        self.possible_formats = formats;
        self
    }

    pub fn format(mut self, format: Option<Pod>) -> Self {
        self.change_mask |= PortChange::FORMAT;
        self.format = format;
        self
    }

    pub fn params(mut self, params: Vec<Pod>) -> Self {
        self.change_mask |= PortChange::PARAMS;
        self.params = params;
        self
    }

    pub fn info(mut self, info: PortInfo) -> Self {
        self.change_mask |= PortChange::INFO;
        self.info = Some(info);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.change_mask.is_empty()
    }
}

#[derive(Debug)]
pub struct Port {
    direction: Direction,
    id: PortId,
    state: PortState,
    possible_formats: Vec<Pod>,
    format: Option<Pod>,
    params: BTreeMap<u32, Pod>,
    info: Option<PortInfo>,
    buffers: BufferCatalog,
}

impl Port {
    pub fn new(direction: Direction, id: PortId) -> Self {
        Self {
            direction,
            id,
            state: PortState::Added,
            possible_formats: Vec::new(),
            format: None,
            params: BTreeMap::new(),
            info: None,
            buffers: BufferCatalog::new(direction, id),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn possible_formats(&self) -> &[Pod] {
        &self.possible_formats
    }

    pub fn format(&self) -> Option<&Pod> {
        self.format.as_ref()
    }

    pub fn param(&self, id: u32) -> Option<&Pod> {
        self.params.get(&id)
    }

    pub fn params(&self) -> impl Iterator<Item = &Pod> {
        self.params.values()
    }

    pub fn info(&self) -> Option<&PortInfo> {
        self.info.as_ref()
    }

    pub fn buffers(&self) -> &BufferCatalog {
        &self.buffers
    }

    fn unsettled_state(&self) -> PortState {
        if self.possible_formats.is_empty() && self.format.is_none() {
            PortState::Added
        } else {
            PortState::NegotiatingFormat
        }
    }

    /// Apply the masked fields of a local `port_update`.
    ///
    /// A proposed `format` is not applied here; the server answers with
    /// `set_format` if it agrees.
    pub fn apply_update(&mut self, update: &PortUpdate) {
        let mask = update.change_mask;
        if mask.contains(PortChange::POSSIBLE_FORMATS) {
            self.possible_formats = update.possible_formats.clone();
        }
        if mask.contains(PortChange::PARAMS) {
            self.params = update
                .params
                .iter()
                .map(|p| (p.type_id, p.clone()))
                .collect();
        }
        if mask.contains(PortChange::INFO) {
            self.info = update.info.clone();
        }
        if self.state != PortState::Configured {
            self.state = self.unsettled_state();
        }
    }

    /// Check `format` against the advertised set.
    pub fn check_format(&self, format: &Pod) -> Result<()> {
        if self.possible_formats.iter().any(|f| f == format) {
            Ok(())
        } else {
            Err(Violation::FormatNotAdvertised {
                direction: self.direction,
                port_id: self.id,
            }
            .into())
        }
    }

    /// Apply a server `set_format`. `None` clears the format.
    ///
    /// Probes (`TEST_ONLY`) only validate. Anything else drops the buffer
    /// catalog and returns the port to negotiation.
    pub fn set_format(
        &mut self,
        flags: FormatFlags,
        format: Option<Pod>,
        mem: &mut MemoryRegistry,
    ) -> Result<()> {
        if let Some(f) = &format {
            self.check_format(f)?;
        }
        if flags.contains(FormatFlags::TEST_ONLY) {
            return Ok(());
        }
        self.buffers.clear(mem);
        self.format = format;
        self.state = self.unsettled_state();
        Ok(())
    }

    /// Store a param, keyed by its type id. An empty body removes it.
    pub fn set_param(&mut self, param: Pod) {
        if param.is_empty() {
            self.params.remove(&param.type_id);
        } else {
            self.params.insert(param.type_id, param);
        }
    }

    /// Install buffers for the current format. An empty list clears them.
    pub fn use_buffers(&mut self, descs: Vec<BufferDesc>, mem: &mut MemoryRegistry) -> Result<()> {
        if descs.is_empty() {
            self.buffers.clear(mem);
            self.state = self.unsettled_state();
            return Ok(());
        }
        if self.format.is_none() {
            return Err(NodeError::negotiation(format!(
                "{}:{} has no format for use_buffers",
                self.direction, self.id
            )));
        }
        self.buffers.install(descs, mem)?;
        self.state = PortState::Configured;
        Ok(())
    }

    /// Unpin everything before the port goes away.
    pub fn release(&mut self, mem: &mut MemoryRegistry) {
        self.buffers.clear(mem);
    }
}
