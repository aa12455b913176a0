//! Core type definitions for the memory simulator.
//!
//! This module defines the fundamental types used throughout the simulation kernel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Simulated time in clock cycles of a single clock domain.
///
/// Each `EventQueue` counts its own cycles; the `GlobalEventQueue` converts
/// between domains using their frequencies.
pub type Cycle = u64;

/// Unique identifier for a request.
pub type RequestId = u64;

/// Handle returned when an event is scheduled, used to cancel it later.
pub type EventId = u64;

/// Sentinel used for "no pending event".
pub const NEVER: Cycle = Cycle::MAX;

/// Identifies a component of the memory system.
///
/// Events and completions are routed by `ComponentId` instead of by pointer,
/// so a request never holds a reference to the object that will finish it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComponentId {
    /// No recipient; events addressed here are dropped.
    None,
    /// The memory controller of a channel.
    Controller { channel: u64 },
    /// The off-chip bus of a channel.
    Interconnect { channel: u64 },
    /// A rank.
    Rank { channel: u64, rank: u64 },
    /// A bank.
    Bank { channel: u64, rank: u64, bank: u64 },
    /// A subarray.
    SubArray {
        channel: u64,
        rank: u64,
        bank: u64,
        subarray: u64,
    },
    /// Anything outside the memory system (drivers, test harnesses).
    External(u64),
}

impl ComponentId {
    /// Returns the channel this component belongs to, if any.
    pub fn channel(&self) -> Option<u64> {
        match *self {
            ComponentId::Controller { channel }
            | ComponentId::Interconnect { channel }
            | ComponentId::Rank { channel, .. }
            | ComponentId::Bank { channel, .. }
            | ComponentId::SubArray { channel, .. } => Some(channel),
            ComponentId::None | ComponentId::External(_) => None,
        }
    }

    /// Returns the component one level up in the device tree.
    pub fn parent(&self) -> ComponentId {
        match *self {
            ComponentId::SubArray {
                channel, rank, bank, ..
            } => ComponentId::Bank {
                channel,
                rank,
                bank,
            },
            ComponentId::Bank { channel, rank, .. } => ComponentId::Rank { channel, rank },
            ComponentId::Rank { channel, .. } => ComponentId::Interconnect { channel },
            ComponentId::Interconnect { channel } => ComponentId::Controller { channel },
            _ => ComponentId::None,
        }
    }

    /// Returns true for ranks, banks and subarrays.
    pub fn is_device(&self) -> bool {
        matches!(
            self,
            ComponentId::Rank { .. } | ComponentId::Bank { .. } | ComponentId::SubArray { .. }
        )
    }

    /// Dotted statistics name, e.g. `channel0.rank1.bank2`.
    pub fn stat_name(&self) -> String {
        match *self {
            ComponentId::None => "none".to_string(),
            ComponentId::Controller { channel } => format!("channel{}.controller", channel),
            ComponentId::Interconnect { channel } => format!("channel{}.bus", channel),
            ComponentId::Rank { channel, rank } => format!("channel{}.rank{}", channel, rank),
            ComponentId::Bank {
                channel,
                rank,
                bank,
            } => format!("channel{}.rank{}.bank{}", channel, rank, bank),
            ComponentId::SubArray {
                channel,
                rank,
                bank,
                subarray,
            } => format!(
                "channel{}.rank{}.bank{}.subarray{}",
                channel, rank, bank, subarray
            ),
            ComponentId::External(id) => format!("external{}", id),
        }
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stat_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_chain() {
        let sa = ComponentId::SubArray {
            channel: 0,
            rank: 1,
            bank: 2,
            subarray: 3,
        };
        let bank = sa.parent();
        assert_eq!(
            bank,
            ComponentId::Bank {
                channel: 0,
                rank: 1,
                bank: 2
            }
        );
        assert_eq!(bank.parent(), ComponentId::Rank { channel: 0, rank: 1 });
        assert_eq!(bank.parent().parent(), ComponentId::Interconnect { channel: 0 });
        assert_eq!(
            bank.parent().parent().parent(),
            ComponentId::Controller { channel: 0 }
        );
        assert_eq!(ComponentId::Controller { channel: 0 }.parent(), ComponentId::None);
    }

    #[test]
    fn test_stat_names() {
        let bank = ComponentId::Bank {
            channel: 0,
            rank: 1,
            bank: 2,
        };
        assert_eq!(bank.stat_name(), "channel0.rank1.bank2");
        assert_eq!(bank.to_string(), "channel0.rank1.bank2");
        assert_eq!(bank.channel(), Some(0));
        assert!(bank.is_device());
        assert!(!ComponentId::External(7).is_device());
        assert_eq!(ComponentId::External(7).channel(), None);
    }
}
