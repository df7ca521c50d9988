//! Time-ordered merge of several per-market readers.
use crate::book::OrderBookState;
use crate::error::{Result, StoreError};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use time::OffsetDateTime;

/// k-way merge that always yields the state with the smallest timestamp.
/// Ties go to the reader listed first. Errors are passed through in the
/// order they are encountered.
pub struct MergeByTime<I> {
    sources: Vec<I>,
    heads: Vec<Option<OrderBookState>>,
    order: BinaryHeap<Reverse<(OffsetDateTime, usize)>>,
    errors: VecDeque<StoreError>,
    primed: bool,
}

impl<I> MergeByTime<I>
where
    I: Iterator<Item = Result<OrderBookState>>,
{
    pub fn new(sources: Vec<I>) -> Self {
        let heads = sources.iter().map(|_| None).collect();
        Self {
            sources,
            heads,
            order: BinaryHeap::new(),
            errors: VecDeque::new(),
            primed: false,
        }
    }

    fn pull(&mut self, idx: usize) {
        match self.sources[idx].next() {
            Some(Ok(state)) => {
                self.order.push(Reverse((state.ts, idx)));
                self.heads[idx] = Some(state);
            }
            Some(Err(e)) => self.errors.push_back(e),
            None => {}
        }
    }
}

impl<I> Iterator for MergeByTime<I>
where
    I: Iterator<Item = Result<OrderBookState>>,
{
    type Item = Result<OrderBookState>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            for idx in 0..self.sources.len() {
                self.pull(idx);
            }
        }
        if let Some(e) = self.errors.pop_front() {
            return Some(Err(e));
        }
        let Reverse((_, idx)) = self.order.pop()?;
        let state = self.heads[idx].take()?;
        self.pull(idx);
        Some(Ok(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::OrderBookSide;
    use crate::ticker::MarketTicker;
    use time::Duration;
    use time::macros::datetime;

    fn state(ticker: &str, secs: i64) -> OrderBookState {
        OrderBookState {
            ticker: MarketTicker::parse(ticker).unwrap(),
            yes: OrderBookSide::new(),
            no: OrderBookSide::new(),
            ts: datetime!(2024-01-01 0:00 UTC) + Duration::seconds(secs),
        }
    }

    fn source(ticker: &str, secs: &[i64]) -> std::vec::IntoIter<Result<OrderBookState>> {
        secs.iter()
            .map(|s| Ok(state(ticker, *s)))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn merges_in_time_order() {
        let merged: Vec<_> = MergeByTime::new(vec![
            source("A-B-C", &[1, 4, 5]),
            source("X-Y-Z", &[2, 3, 6]),
            source("Q-R-S", &[]),
        ])
        .map(|r| r.unwrap())
        .map(|s| (s.ticker.to_string(), (s.ts - datetime!(2024-01-01 0:00 UTC)).whole_seconds()))
        .collect();
        let expect = [("A-B-C", 1), ("X-Y-Z", 2), ("X-Y-Z", 3), ("A-B-C", 4), ("A-B-C", 5), ("X-Y-Z", 6)];
        assert_eq!(
            merged,
            expect.iter().map(|(t, s)| (t.to_string(), *s)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn ties_prefer_earlier_source() {
        let merged: Vec<_> = MergeByTime::new(vec![source("A-B-C", &[1]), source("X-Y-Z", &[1])])
            .map(|r| r.unwrap().ticker.to_string())
            .collect();
        assert_eq!(merged, vec!["A-B-C", "X-Y-Z"]);
    }

    #[test]
    fn errors_pass_through() {
        let failing = vec![
            Ok(state("A-B-C", 1)),
            Err(StoreError::Corrupt("boom".into())),
        ]
        .into_iter();
        let mut merged = MergeByTime::new(vec![failing, source("X-Y-Z", &[5])]);
        assert!(merged.next().unwrap().is_ok());
        assert!(matches!(merged.next(), Some(Err(StoreError::Corrupt(_)))));
        assert_eq!(merged.next().unwrap().unwrap().ticker.to_string(), "X-Y-Z");
        assert!(merged.next().is_none());
    }
}
