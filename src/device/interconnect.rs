//! Off-chip bus.
//!
//! The interconnect is the root of a channel's device tree. It forwards
//! commands to the addressed rank, tells the other ranks about data bus
//! usage, and delays completions on their way back to the controller.

use std::sync::Arc;

use super::{refuse, Device, FailReason, IssueContext, Rank, SavedState};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointSet};
use crate::config::MemoryConfig;
use crate::endurance::WriteModel;
use crate::request::Request;
use crate::types::{ComponentId, Cycle};

/// Bus statistics.
#[derive(Clone, Debug, Default)]
pub struct InterconnectStats {
    pub commands: u64,
    pub column_commands: u64,
    pub completions: u64,
}

/// The bus connecting a controller to its ranks.
pub struct Interconnect {
    id: ComponentId,
    ranks: Vec<Rank>,
    off_chip_latency: Cycle,
    stats: InterconnectStats,
}

impl Interconnect {
    /// Builds the device tree of one channel.
    pub fn new(channel: u64, config: &MemoryConfig, model: Arc<dyn WriteModel>) -> Self {
        let params = Arc::new(config.timing.clone());
        let ranks = (0..config.geometry.ranks)
            .map(|rank| {
                Rank::new(
                    channel,
                    rank,
                    &config.geometry,
                    &config.bank,
                    params.clone(),
                    model.clone(),
                    config.controller.precharge_counting,
                )
            })
            .collect();

        Self {
            id: ComponentId::Interconnect { channel },
            ranks,
            off_chip_latency: config.controller.off_chip_latency,
            stats: InterconnectStats::default(),
        }
    }

    pub fn rank(&self, index: u64) -> Option<&Rank> {
        self.ranks.get(index as usize)
    }

    pub fn rank_mut(&mut self, index: u64) -> Option<&mut Rank> {
        self.ranks.get_mut(index as usize)
    }

    pub fn rank_count(&self) -> usize {
        self.ranks.len()
    }

    pub fn stats(&self) -> &InterconnectStats {
        &self.stats
    }

    pub fn off_chip_latency(&self) -> Cycle {
        self.off_chip_latency
    }

    fn rank_index(&self, request: &Request) -> Result<usize, FailReason> {
        let index = request.address.rank as usize;
        if index < self.ranks.len() {
            Ok(index)
        } else {
            Err(FailReason::NoSuchDevice)
        }
    }

    /// Rolls back the write recorded in `saved`.
    ///
    /// Returns the write-pulse cycles already completed, or `None` if the
    /// write was no longer in flight.
    pub fn interrupt_write(&mut self, saved: &SavedState, ctx: &mut IssueContext<'_>) -> Option<Cycle> {
        self.ranks
            .get_mut(saved.address.rank as usize)?
            .interrupt_write(saved, ctx)
    }

    /// Routes a completion addressed to `recipient` up through the tree.
    pub fn complete_at(&mut self, recipient: ComponentId, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        match recipient {
            ComponentId::Rank { rank, .. }
            | ComponentId::Bank { rank, .. }
            | ComponentId::SubArray { rank, .. } => {
                let Some(child) = self.ranks.get_mut(rank as usize) else {
                    tracing::warn!("{}: completion for missing {}", self.id, recipient);
                    return false;
                };
                if !child.complete_at(recipient, request, ctx) {
                    return false;
                }
                self.request_complete(request, ctx)
            }
            _ => self.request_complete(request, ctx),
        }
    }
}

impl Device for Interconnect {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn is_issuable(&mut self, request: &Request, now: Cycle) -> Result<(), FailReason> {
        let index = self.rank_index(request)?;
        self.ranks[index].validate(request, now, true)
    }

    fn issue_command(&mut self, request: &Request, ctx: &mut IssueContext<'_>) -> Result<SavedState, FailReason> {
        let now = ctx.now();
        let index = match self.rank_index(request) {
            Ok(index) => index,
            Err(reason) => return Err(refuse(self.id, request, now, reason)),
        };

        let saved = self.ranks[index].issue_command(request, ctx)?;
        self.stats.commands += 1;

        if request.op.is_column() {
            self.stats.column_commands += 1;
            for (other, rank) in self.ranks.iter_mut().enumerate() {
                if other != index {
                    rank.notify(request.op, now);
                }
            }
        }
        Ok(saved)
    }

    fn request_complete(&mut self, request: &mut Request, ctx: &mut IssueContext<'_>) -> bool {
        let Some(channel) = self.id.channel() else {
            return false;
        };
        let when = ctx.now() + self.off_chip_latency;
        ctx.queue
            .insert_response(ComponentId::Controller { channel }, request.clone(), when);
        self.stats.completions += 1;
        false
    }

    fn cycle(&mut self, steps: Cycle) {
        for rank in &mut self.ranks {
            rank.cycle(steps);
        }
    }

    fn calculate_stats(&mut self) {
        for rank in &mut self.ranks {
            rank.calculate_stats();
        }
    }

    fn export_stats(&self) -> serde_json::Value {
        let mut stats = serde_json::json!({
            "commands": self.stats.commands,
            "column_commands": self.stats.column_commands,
            "completions": self.stats.completions,
        });
        for (index, rank) in self.ranks.iter().enumerate() {
            stats[format!("rank{}", index)] = rank.export_stats();
        }
        stats
    }
}

impl Checkpoint for Interconnect {
    fn create_checkpoint(&self, set: &mut CheckpointSet) {
        for rank in &self.ranks {
            rank.create_checkpoint(set);
        }
    }

    fn restore_checkpoint(&mut self, set: &CheckpointSet) -> Result<(), CheckpointError> {
        for rank in &mut self.ranks {
            rank.restore_checkpoint(set)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::endurance::NullModel;
    use crate::event::{EventQueue, EventType, NullHandler};
    use crate::hooks::HookRegistry;
    use crate::request::{OpType, Owner};

    fn bus() -> Interconnect {
        let config = MemoryConfig::builder().organization(1, 2, 4).build().unwrap();
        Interconnect::new(0, &config, Arc::new(NullModel))
    }

    fn request(op: OpType, rank: u64, bank: u64, row: u64) -> Request {
        Request::new(1, op, Address::new(0, rank, bank, row, 0)).with_owner(Owner::Controller)
    }

    fn issue(bus: &mut Interconnect, queue: &mut EventQueue, req: &Request) -> Result<SavedState, FailReason> {
        let hooks = HookRegistry::new();
        let mut ctx = IssueContext::new(queue, &hooks);
        bus.issue_command(req, &mut ctx)
    }

    #[test]
    fn test_missing_rank() {
        let mut b = bus();
        assert_eq!(
            b.is_issuable(&request(OpType::Activate, 5, 0, 0), 10),
            Err(FailReason::NoSuchDevice)
        );
    }

    #[test]
    fn test_column_command_notifies_siblings() {
        let mut b = bus();
        let mut queue = EventQueue::new();
        queue.loop_steps(1, &mut NullHandler);
        issue(&mut b, &mut queue, &request(OpType::Activate, 0, 0, 3)).unwrap();
        queue.loop_steps(20, &mut NullHandler);

        let before = b.rank(1).map(|r| r.timing().next_read);
        issue(&mut b, &mut queue, &request(OpType::Read, 0, 0, 3)).unwrap();

        let sibling = b.rank(1).unwrap();
        assert_eq!(sibling.stats().notifies, 1);
        assert!(Some(sibling.timing().next_read) > before);
        assert_eq!(b.rank(0).map(|r| r.stats().notifies), Some(0));
        assert_eq!(b.stats().column_commands, 1);
    }

    #[test]
    fn test_completion_delayed_to_controller() {
        let mut b = bus();
        let mut queue = EventQueue::new();
        queue.loop_steps(5, &mut NullHandler);
        let hooks = HookRegistry::new();
        let mut ctx = IssueContext::new(&mut queue, &hooks);

        let mut req = request(OpType::Read, 0, 0, 3);
        assert!(!b.request_complete(&mut req, &mut ctx));
        assert!(queue
            .find_event(EventType::Response, ComponentId::Controller { channel: 0 }, 15)
            .is_some());
        assert_eq!(b.stats().completions, 1);
    }
}
