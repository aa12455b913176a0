//! Write models.
//!
//! A `WriteModel` is consulted by a subarray for every column write. It
//! returns the extra write-pulse cycles the write costs on top of the
//! protocol timing, or reports that the written cells have failed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::address::Address;
use crate::config::{EnduranceKind, EnduranceParams};
use crate::types::Cycle;

/// Result of a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write succeeded and needs this many extra cycles
    Latency(Cycle),
    /// The cells at this address can no longer be written
    HardFailure,
}

/// Endurance model or data encoder consulted on every write.
pub trait WriteModel: Send + Sync + fmt::Debug {
    /// Records a write of `data` to `address`.
    fn write(&self, address: &Address, data: &[u8]) -> WriteOutcome;

    /// Exports model statistics.
    fn export_stats(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

/// Model for volatile memories: writes cost nothing extra.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullModel;

impl WriteModel for NullModel {
    fn write(&self, _address: &Address, _data: &[u8]) -> WriteOutcome {
        WriteOutcome::Latency(0)
    }
}

/// Every write costs a constant write pulse.
#[derive(Clone, Copy, Debug)]
pub struct FixedLatencyModel {
    pulse: Cycle,
}

impl FixedLatencyModel {
    pub fn new(pulse: Cycle) -> Self {
        Self { pulse }
    }
}

impl WriteModel for FixedLatencyModel {
    fn write(&self, _address: &Address, _data: &[u8]) -> WriteOutcome {
        WriteOutcome::Latency(self.pulse)
    }
}

/// Constant write pulse plus a per-row write budget.
///
/// Once a row has absorbed `limit` writes, every further write to it is a
/// hard failure.
#[derive(Debug)]
pub struct RowEnduranceModel {
    pulse: Cycle,
    limit: u64,
    writes: Mutex<HashMap<(u64, u64, u64, u64, u64), u64>>,
}

impl RowEnduranceModel {
    /// Creates a model with the given pulse and per-row budget.
    pub fn new(pulse: Cycle, limit: u64) -> Self {
        Self {
            pulse,
            limit,
            writes: Mutex::new(HashMap::new()),
        }
    }

    /// Writes recorded so far for the row holding `address`.
    pub fn row_writes(&self, address: &Address) -> u64 {
        self.writes
            .lock()
            .get(&Self::key(address))
            .copied()
            .unwrap_or(0)
    }

    fn key(address: &Address) -> (u64, u64, u64, u64, u64) {
        (
            address.channel,
            address.rank,
            address.bank,
            address.subarray,
            address.row,
        )
    }
}

impl WriteModel for RowEnduranceModel {
    fn write(&self, address: &Address, _data: &[u8]) -> WriteOutcome {
        let mut writes = self.writes.lock();
        let count = writes.entry(Self::key(address)).or_insert(0);
        if *count >= self.limit {
            return WriteOutcome::HardFailure;
        }
        *count += 1;
        WriteOutcome::Latency(self.pulse)
    }

    fn export_stats(&self) -> serde_json::Value {
        let writes = self.writes.lock();
        let worn_out = writes.values().filter(|&&c| c >= self.limit).count();
        serde_json::json!({
            "rows_written": writes.len(),
            "rows_worn_out": worn_out,
            "max_row_writes": writes.values().copied().max().unwrap_or(0),
        })
    }
}

/// Builds the write model described by the configuration.
pub fn model_from_config(params: &EnduranceParams) -> Arc<dyn WriteModel> {
    match params.model {
        EnduranceKind::None => Arc::new(NullModel),
        EnduranceKind::Fixed => Arc::new(FixedLatencyModel::new(params.write_pulse)),
        EnduranceKind::Row => Arc::new(RowEnduranceModel::new(
            params.write_pulse,
            params.row_write_limit,
        )),
    }
}
