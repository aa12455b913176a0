//! Physical address translation.
//!
//! A physical address is decomposed into `(row, col, bank, rank, channel)`
//! by repeated modulo/divide over the field counts, lowest-order field first.
//! The subarray is derived from the row. The mapping is deterministic and
//! injective over the configured geometry, and `reverse_translate` inverts it.
//!
//! # Mapping schemes
//!
//! A scheme string lists fields from most to least significant:
//!
//! ```text
//! R:RK:BK:CH:C    row | rank | bank | channel | column | burst offset
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ComponentId;

/// Errors produced while configuring a translation method.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address mapping orders are not unique: {0:?}")]
    DuplicateOrder([u32; 5]),

    #[error("Address mapping order {0} is outside 1..=5")]
    OrderOutOfRange(u32),

    #[error("Unknown address mapping field: {0}")]
    UnknownField(String),

    #[error("Address mapping scheme must name all five fields: {0}")]
    IncompleteScheme(String),

    #[error("Field {0} has a count of zero")]
    ZeroCount(&'static str),
}

/// One field of a decomposed address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryPartition {
    Row = 0,
    Col = 1,
    Bank = 2,
    Rank = 3,
    Channel = 4,
}

impl MemoryPartition {
    /// All partitions in storage order.
    pub const ALL: [MemoryPartition; 5] = [
        MemoryPartition::Row,
        MemoryPartition::Col,
        MemoryPartition::Bank,
        MemoryPartition::Rank,
        MemoryPartition::Channel,
    ];

    fn name(self) -> &'static str {
        match self {
            MemoryPartition::Row => "row",
            MemoryPartition::Col => "col",
            MemoryPartition::Bank => "bank",
            MemoryPartition::Rank => "rank",
            MemoryPartition::Channel => "channel",
        }
    }

    fn from_token(token: &str) -> Result<Self, AddressError> {
        match token.trim().to_ascii_uppercase().as_str() {
            "R" | "ROW" => Ok(MemoryPartition::Row),
            "C" | "COL" => Ok(MemoryPartition::Col),
            "BK" | "BANK" => Ok(MemoryPartition::Bank),
            "RK" | "RANK" => Ok(MemoryPartition::Rank),
            "CH" | "CHANNEL" => Ok(MemoryPartition::Channel),
            other => Err(AddressError::UnknownField(other.to_string())),
        }
    }
}

/// A translated device address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// The untranslated physical address
    pub physical: u64,
    pub row: u64,
    pub col: u64,
    pub bank: u64,
    pub rank: u64,
    pub channel: u64,
    /// Derived from the row
    pub subarray: u64,
}

impl Address {
    /// Creates an address from already-translated coordinates.
    pub fn new(channel: u64, rank: u64, bank: u64, row: u64, col: u64) -> Self {
        Self {
            physical: 0,
            row,
            col,
            bank,
            rank,
            channel,
            subarray: 0,
        }
    }

    /// Sets the subarray coordinate.
    pub fn with_subarray(mut self, subarray: u64) -> Self {
        self.subarray = subarray;
        self
    }

    /// Sets the physical address.
    pub fn with_physical(mut self, physical: u64) -> Self {
        self.physical = physical;
        self
    }

    /// Identifier of the addressed rank.
    pub fn rank_id(&self) -> ComponentId {
        ComponentId::Rank {
            channel: self.channel,
            rank: self.rank,
        }
    }

    /// Identifier of the addressed bank.
    pub fn bank_id(&self) -> ComponentId {
        ComponentId::Bank {
            channel: self.channel,
            rank: self.rank,
            bank: self.bank,
        }
    }

    /// Identifier of the addressed subarray.
    pub fn subarray_id(&self) -> ComponentId {
        ComponentId::SubArray {
            channel: self.channel,
            rank: self.rank,
            bank: self.bank,
            subarray: self.subarray,
        }
    }
}

/// Field counts and ordering used by an `AddressTranslator`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationMethod {
    /// Number of values per field, indexed by `MemoryPartition`
    count: [u64; 5],
    /// Position of each field, 0 being the least significant
    order: [u32; 5],
}

impl Default for TranslationMethod {
    fn default() -> Self {
        // R:RK:BK:CH:C
        Self {
            count: [1; 5],
            order: [4, 0, 2, 3, 1],
        }
    }
}

impl TranslationMethod {
    /// Creates a method with the default `R:RK:BK:CH:C` order and unit counts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of rows, columns, banks, ranks and channels.
    pub fn set_count(
        &mut self,
        rows: u64,
        cols: u64,
        banks: u64,
        ranks: u64,
        channels: u64,
    ) -> Result<(), AddressError> {
        let count = [rows, cols, banks, ranks, channels];
        for part in MemoryPartition::ALL {
            if count[part as usize] == 0 {
                return Err(AddressError::ZeroCount(part.name()));
            }
        }
        self.count = count;
        Ok(())
    }

    /// Sets the field order, 1 being the least significant field.
    pub fn set_order(
        &mut self,
        row: u32,
        col: u32,
        bank: u32,
        rank: u32,
        channel: u32,
    ) -> Result<(), AddressError> {
        let order = [row, col, bank, rank, channel];
        for &o in &order {
            if !(1..=5).contains(&o) {
                return Err(AddressError::OrderOutOfRange(o));
            }
        }
        for i in 0..order.len() {
            if order[i + 1..].contains(&order[i]) {
                return Err(AddressError::DuplicateOrder(order));
            }
        }
        self.order = order.map(|o| o - 1);
        Ok(())
    }

    /// Parses a scheme such as `R:RK:BK:CH:C` (most significant first).
    pub fn set_scheme(&mut self, scheme: &str) -> Result<(), AddressError> {
        let parts = scheme
            .split(':')
            .map(MemoryPartition::from_token)
            .collect::<Result<Vec<_>, _>>()?;
        if parts.len() != 5 {
            return Err(AddressError::IncompleteScheme(scheme.to_string()));
        }

        let mut order = [0u32; 5];
        for (position, part) in parts.iter().rev().enumerate() {
            order[*part as usize] = position as u32 + 1;
        }
        self.set_order(order[0], order[1], order[2], order[3], order[4])
    }

    /// Returns the field counts as `(rows, cols, banks, ranks, channels)`.
    pub fn count(&self) -> (u64, u64, u64, u64, u64) {
        let c = self.count;
        (c[0], c[1], c[2], c[3], c[4])
    }

    /// Returns the number of address bits each field occupies (rounded up).
    pub fn bit_widths(&self) -> [u32; 5] {
        self.count.map(|c| 64 - (c - 1).leading_zeros())
    }

    /// Finds the field stored at `position` (0 = least significant).
    fn find_order(&self, position: u32) -> MemoryPartition {
        MemoryPartition::ALL
            .into_iter()
            .find(|p| self.order[*p as usize] == position)
            .unwrap_or_else(|| unreachable!("translation order {:?} is not a permutation", self.order))
    }
}

/// Maps physical addresses onto device coordinates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressTranslator {
    method: TranslationMethod,
    /// Low address bits addressing bytes within a burst
    offset_bits: u32,
    /// Subarrays per bank
    subarrays: u64,
}

impl AddressTranslator {
    /// Creates a translator.
    ///
    /// # Arguments
    /// * `method` - Field counts and order
    /// * `offset_bits` - Number of low bits that select a byte within one burst
    /// * `subarrays` - Subarrays per bank (rows are split evenly between them)
    pub fn new(method: TranslationMethod, offset_bits: u32, subarrays: u64) -> Self {
        Self {
            method,
            offset_bits,
            subarrays: subarrays.max(1),
        }
    }

    /// Returns the translation method.
    pub fn method(&self) -> &TranslationMethod {
        &self.method
    }

    /// Decomposes a physical address.
    pub fn translate(&self, physical: u64) -> Address {
        let mut fields = [0u64; 5];
        let mut rest = physical >> self.offset_bits;

        for position in 0..5 {
            let part = self.method.find_order(position);
            let count = self.method.count[part as usize];
            fields[part as usize] = rest % count;
            rest /= count;
        }

        let rows = self.method.count[MemoryPartition::Row as usize];
        let rows_per_subarray = (rows / self.subarrays).max(1);

        Address {
            physical,
            row: fields[MemoryPartition::Row as usize],
            col: fields[MemoryPartition::Col as usize],
            bank: fields[MemoryPartition::Bank as usize],
            rank: fields[MemoryPartition::Rank as usize],
            channel: fields[MemoryPartition::Channel as usize],
            subarray: fields[MemoryPartition::Row as usize] / rows_per_subarray,
        }
    }

    /// Rebuilds the physical address of a translated address.
    ///
    /// The burst offset bits are zero in the result.
    pub fn reverse_translate(&self, address: &Address) -> u64 {
        let fields = [
            address.row,
            address.col,
            address.bank,
            address.rank,
            address.channel,
        ];

        let mut physical = 0u64;
        for position in (0..5).rev() {
            let part = self.method.find_order(position);
            physical = physical * self.method.count[part as usize] + fields[part as usize];
        }
        physical << self.offset_bits
    }
}
