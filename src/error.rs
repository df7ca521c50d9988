//! Error and Result types for the order book store.

use crate::record::{Price, Side};
use crate::ticker::MarketTicker;
use std::io;
use thiserror::Error;
use time::OffsetDateTime;

/// A convenience `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure reading bits from a [`crate::bits::BitCursor`].
#[derive(Debug, Error)]
pub enum BitReadError {
    /// The source ran dry before the requested bits were available.
    #[error("end of stream")]
    EndOfStream,

    /// Zero-width reads are not allowed.
    #[error("cannot read zero bits")]
    ZeroWidth,

    /// More bits were requested than fit in a `u64`.
    #[error("cannot read {0} bits at once (max 64)")]
    TooWide(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Timestamp delta from the chunk start needs more than 32 bits.
    #[error("timestamp delta of {tenths} tenths of a second for {ticker} does not fit in 32 bits")]
    TimestampOverflow { ticker: MarketTicker, tenths: i128 },

    /// Message is older than the chunk it would be written to.
    #[error("message for {ticker} at {ts} precedes chunk start {chunk_start}")]
    TimestampBeforeChunkStart {
        ticker: MarketTicker,
        ts: OffsetDateTime,
        chunk_start: OffsetDateTime,
    },

    /// Signed quantity delta needs more than 32 bits including its sign.
    #[error("quantity delta {delta} for {ticker} {side} @ {price} does not fit in 32 bits")]
    QuantityDeltaOverflow {
        ticker: MarketTicker,
        side: Side,
        price: Price,
        delta: i64,
    },

    /// Snapshot level quantity needs more than 32 bits.
    #[error("quantity {quantity} for {ticker} {side} @ {price} does not fit in 32 bits")]
    QuantityOverflow {
        ticker: MarketTicker,
        side: Side,
        price: Price,
        quantity: u64,
    },

    /// Price outside 1..=99.
    #[error("price {price} for {ticker} is outside 1..=99")]
    InvalidPrice { ticker: MarketTicker, price: Price },

    /// The same price appears twice on one side of a snapshot.
    #[error("snapshot for {ticker} lists {side} @ {price} more than once")]
    DuplicateLevel {
        ticker: MarketTicker,
        side: Side,
        price: Price,
    },

    /// A dataset must begin with a snapshot.
    #[error("first message for {0} must be a snapshot")]
    MissingSnapshot(MarketTicker),

    /// A delta would drive a level below zero.
    #[error("delta drives {ticker} {side} @ {price} to negative quantity {quantity}")]
    NegativeQuantity {
        ticker: MarketTicker,
        side: Side,
        price: Price,
        quantity: i128,
    },

    /// Read range with end before start.
    #[error("read range end {end} is before start {start}")]
    InvalidRange {
        start: OffsetDateTime,
        end: OffsetDateTime,
    },

    /// Stream ended in the middle of a message.
    #[error("chunk for {ticker} truncated mid-message at bit {bit_offset}")]
    Truncated { ticker: MarketTicker, bit_offset: u64 },

    /// Chunk content that the writer could never have produced.
    #[error("corrupt chunk data: {0}")]
    Corrupt(String),

    #[error("invalid market ticker {0:?}: expected SERIES-EVENT-MARKET")]
    InvalidTicker(String),

    /// Another handle holds the writer lock for this market.
    #[error("market {0} is locked by another writer")]
    MarketLocked(MarketTicker),

    #[error("invalid metadata magic: expected OBSM, got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported metadata version: {0}")]
    UnsupportedMetadataVersion(u16),

    #[error("metadata checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    MetadataChecksum { expected: u32, actual: u32 },

    #[error("metadata encoding error: {0}")]
    Metadata(#[from] bincode::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
