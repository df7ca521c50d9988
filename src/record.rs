//! Message shapes stored in chunk files, and the persisted metadata record.
use crate::ticker::MarketTicker;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Price in cents, valid range `MIN_PRICE..=MAX_PRICE`.
pub type Price = u8;
/// Resting quantity at a level.
pub type Quantity = u64;
/// Signed change to a level's quantity.
pub type QuantityDelta = i64;

pub const MIN_PRICE: Price = 1;
pub const MAX_PRICE: Price = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Yes,
    No,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Yes => f.write_str("yes"),
            Side::No => f.write_str("no"),
        }
    }
}

/// Full book for one market at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMessage {
    pub ticker: MarketTicker,
    pub ts: OffsetDateTime,
    /// Ascending by price.
    pub yes: Vec<(Price, Quantity)>,
    /// Ascending by price.
    pub no: Vec<(Price, Quantity)>,
}

/// Change to a single (side, price) level.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaMessage {
    pub ticker: MarketTicker,
    pub ts: OffsetDateTime,
    pub side: Side,
    pub price: Price,
    pub delta: QuantityDelta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Snapshot(SnapshotMessage),
    Delta(DeltaMessage),
}

impl Message {
    pub fn ticker(&self) -> &MarketTicker {
        match self {
            Message::Snapshot(s) => &s.ticker,
            Message::Delta(d) => &d.ticker,
        }
    }

    pub fn ts(&self) -> OffsetDateTime {
        match self {
            Message::Snapshot(s) => s.ts,
            Message::Delta(d) => d.ts,
        }
    }
}

impl From<SnapshotMessage> for Message {
    fn from(s: SnapshotMessage) -> Self {
        Message::Snapshot(s)
    }
}

impl From<DeltaMessage> for Message {
    fn from(d: DeltaMessage) -> Self {
        Message::Delta(d)
    }
}

/// Body of the `metadata` file, bincode-encoded inside a checksummed frame
/// (see [`crate::metadata`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Unix nanoseconds of each chunk's leading snapshot; index i is chunk i+1.
    pub chunk_start_unix_ns: Vec<i128>,
    pub last_chunk_number: u32,
    pub messages_in_last_chunk: u32,
}
