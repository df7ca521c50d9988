//! Reconstructed order book state.
//!
//! An [`OrderBookState`] is built fresh from a snapshot and then mutated in
//! place by folding deltas:
//! - a delta adds to the quantity at its (side, price) level
//! - a level that reaches zero is removed, so zero quantities are never stored
//! - a level driven below zero is an error and leaves the state untouched
use crate::error::{Result, StoreError};
use crate::record::{DeltaMessage, Price, Quantity, Side, SnapshotMessage};
use crate::ticker::MarketTicker;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Price -> quantity for one side. Only present levels are stored.
pub type OrderBookSide = BTreeMap<Price, Quantity>;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookState {
    pub ticker: MarketTicker,
    pub yes: OrderBookSide,
    pub no: OrderBookSide,
    pub ts: OffsetDateTime,
}

impl OrderBookState {
    pub fn from_snapshot(snapshot: &SnapshotMessage) -> Self {
        let collect = |levels: &[(Price, Quantity)]| {
            levels
                .iter()
                .filter(|(_, q)| *q > 0)
                .copied()
                .collect::<OrderBookSide>()
        };
        Self {
            ticker: snapshot.ticker.clone(),
            yes: collect(&snapshot.yes),
            no: collect(&snapshot.no),
            ts: snapshot.ts,
        }
    }

    pub fn side(&self, side: Side) -> &OrderBookSide {
        match side {
            Side::Yes => &self.yes,
            Side::No => &self.no,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut OrderBookSide {
        match side {
            Side::Yes => &mut self.yes,
            Side::No => &mut self.no,
        }
    }

    /// Fold a delta into the book and advance its timestamp.
    pub fn apply_delta(&mut self, delta: &DeltaMessage) -> Result<()> {
        let ticker = self.ticker.clone();
        let levels = self.side_mut(delta.side);
        let current = levels.get(&delta.price).copied().unwrap_or(0);
        let updated = current as i128 + delta.delta as i128;
        if updated < 0 {
            return Err(StoreError::NegativeQuantity {
                ticker,
                side: delta.side,
                price: delta.price,
                quantity: updated,
            });
        }
        if updated == 0 {
            levels.remove(&delta.price);
        } else {
            levels.insert(delta.price, updated as Quantity);
        }
        self.ts = delta.ts;
        Ok(())
    }

    pub fn to_snapshot(&self) -> SnapshotMessage {
        SnapshotMessage {
            ticker: self.ticker.clone(),
            ts: self.ts,
            yes: self.yes.iter().map(|(p, q)| (*p, *q)).collect(),
            no: self.no.iter().map(|(p, q)| (*p, *q)).collect(),
        }
    }

    /// Highest priced YES level.
    pub fn best_yes(&self) -> Option<(Price, Quantity)> {
        self.yes.iter().next_back().map(|(p, q)| (*p, *q))
    }

    /// Highest priced NO level.
    pub fn best_no(&self) -> Option<(Price, Quantity)> {
        self.no.iter().next_back().map(|(p, q)| (*p, *q))
    }
}
