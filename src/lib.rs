//! Chunked time-series store for order book snapshots and deltas.
//!
//! This crate provides the storage engine used by the `orderbook_store`
//! binary:
//!
//! - `bits`: MSB-first bit cursor and writer
//! - `codec`: variable-width, byte-aligned encoding of snapshots and deltas
//! - `book`: order book state rebuilt from a snapshot by folding deltas
//! - `metadata`: per-market chunk index with a checksummed, versioned file
//! - `store`: market directory layout, chunk rotation and time-range reads
//! - `merge`: time-ordered merge of several market readers
//!
//! Each market lives in `<root>/<series>/<event>/<market>/` as numbered
//! chunk files that each begin with a snapshot, so a read only replays from
//! the chunk covering its start time.
pub mod bits;
pub mod book;
pub mod codec;
pub mod config;
pub mod error;
pub mod merge;
pub mod metadata;
pub mod record;
pub mod store;
pub mod ticker;

pub use book::{OrderBookSide, OrderBookState};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use record::{DeltaMessage, Message, Side, SnapshotMessage};
pub use store::{MarketStore, OrderBookReader};
pub use ticker::MarketTicker;
