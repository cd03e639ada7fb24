//! Session policy - how a node session reacts to the peer.
//!
//! These knobs cover the places where the client-node protocol leaves the
//! choice to the implementation: how long to wait for a `done`, what to do
//! when a node shrinks its port capacity below the live port count, and
//! whether the transport area may be re-established.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What to do when `update` lowers a port maximum below the live port count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortShrinkPolicy {
    /// Keep the previous maximum and report the update as rejected.
    #[default]
    Reject,
    /// Accept the new maximum and remove the highest-numbered ports above it.
    ForceRemove,
}

impl fmt::Display for PortShrinkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortShrinkPolicy::Reject => write!(f, "reject"),
            PortShrinkPolicy::ForceRemove => write!(f, "force_remove"),
        }
    }
}

impl FromStr for PortShrinkPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "reject" => Ok(PortShrinkPolicy::Reject),
            "force_remove" => Ok(PortShrinkPolicy::ForceRemove),
            other => Err(format!("unknown port shrink policy: {other}")),
        }
    }
}

/// Control channel policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long the server waits for a `done` before faulting the session.
    /// Default: 5000
    #[serde(default = "SessionConfig::default_done_timeout_ms")]
    pub done_timeout_ms: u64,

    /// Behaviour when port capacity shrinks below the live port count.
    /// Default: reject
    #[serde(default)]
    pub port_shrink_policy: PortShrinkPolicy,

    /// First sequence number issued in a session.
    /// Default: 1
    #[serde(default = "SessionConfig::default_seq_base")]
    pub seq_base: u32,

    /// Largest frame body accepted from the peer.
    /// Default: 1 MiB
    #[serde(default = "SessionConfig::default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Largest number of descriptors accepted in one receive.
    /// Default: 28
    #[serde(default = "SessionConfig::default_max_fds")]
    pub max_fds: usize,
}

impl SessionConfig {
    fn default_done_timeout_ms() -> u64 {
        5_000
    }

    fn default_seq_base() -> u32 {
        1
    }

    fn default_max_frame_bytes() -> usize {
        1024 * 1024
    }

    fn default_max_fds() -> usize {
        28
    }

    pub fn done_timeout(&self) -> Duration {
        Duration::from_millis(self.done_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            done_timeout_ms: Self::default_done_timeout_ms(),
            port_shrink_policy: PortShrinkPolicy::default(),
            seq_base: Self::default_seq_base(),
            max_frame_bytes: Self::default_max_frame_bytes(),
            max_fds: Self::default_max_fds(),
        }
    }
}

/// Real-time transport channel policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Whether a second `transport` event re-establishes the area.
    /// Default: true
    #[serde(default = "TransportConfig::default_allow_renegotiation")]
    pub allow_renegotiation: bool,

    /// Liveness timeout for the real-time wait; expiry is logged, not fatal.
    /// Default: 2000
    #[serde(default = "TransportConfig::default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Activation records per ring when the server lays out a new area.
    /// Must be a power of two. Default: 64
    #[serde(default = "TransportConfig::default_ring_capacity")]
    pub ring_capacity: u32,
}

impl TransportConfig {
    fn default_allow_renegotiation() -> bool {
        true
    }

    fn default_wait_timeout_ms() -> u64 {
        2_000
    }

    fn default_ring_capacity() -> u32 {
        64
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            allow_renegotiation: Self::default_allow_renegotiation(),
            wait_timeout_ms: Self::default_wait_timeout_ms(),
            ring_capacity: Self::default_ring_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrink_policy_parses_both_spellings() {
        assert_eq!("reject".parse::<PortShrinkPolicy>(), Ok(PortShrinkPolicy::Reject));
        assert_eq!(
            "force-remove".parse::<PortShrinkPolicy>(),
            Ok(PortShrinkPolicy::ForceRemove)
        );
        assert_eq!(
            "FORCE_REMOVE".parse::<PortShrinkPolicy>(),
            Ok(PortShrinkPolicy::ForceRemove)
        );
        assert!("drop".parse::<PortShrinkPolicy>().is_err());
    }

    #[test]
    fn shrink_policy_display_matches_serde_name() {
        assert_eq!(PortShrinkPolicy::ForceRemove.to_string(), "force_remove");
    }
}
