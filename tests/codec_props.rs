use orderbook_store::bits::BitCursor;
use orderbook_store::codec::{decode_next, encode_delta, encode_snapshot};
use orderbook_store::{DeltaMessage, MarketTicker, Message, Side, SnapshotMessage};
use proptest::collection::vec;
use proptest::prelude::*;
use std::io::Cursor;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const START: OffsetDateTime = datetime!(2023-07-01 0:00 UTC);

fn ticker_strategy() -> impl Strategy<Value = MarketTicker> {
    ("[A-Z]{1,40}", "[A-Z0-9]{1,20}", "[A-Z0-9.]{1,300}")
        .prop_map(|(s, e, m)| MarketTicker::parse(&format!("{s}-{e}-{m}")).unwrap())
}

fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Yes), Just(Side::No)]
}

fn delta_strategy() -> impl Strategy<Value = DeltaMessage> {
    (
        ticker_strategy(),
        0..=u32::MAX as i64,
        side_strategy(),
        1u8..=99,
        -((1i64 << 31) - 1)..(1i64 << 31),
    )
        .prop_map(|(ticker, tenths, side, price, delta)| DeltaMessage {
            ticker,
            ts: START + Duration::milliseconds(tenths * 100),
            side,
            price,
            delta,
        })
}

fn snapshot_strategy() -> impl Strategy<Value = SnapshotMessage> {
    // One optional quantity per price 1..=99.
    let side = || vec(proptest::option::of(0..=u32::MAX as u64), 99);
    let levels = |qs: Vec<Option<u64>>| -> Vec<(u8, u64)> {
        qs.into_iter()
            .enumerate()
            .filter_map(|(i, q)| q.map(|q| (i as u8 + 1, q)))
            .collect()
    };
    (ticker_strategy(), 0..=u32::MAX as i64, side(), side()).prop_map(move |(ticker, tenths, yes, no)| {
        SnapshotMessage {
            ticker,
            ts: START + Duration::milliseconds(tenths * 100),
            yes: levels(yes),
            no: levels(no),
        }
    })
}

fn decode_one(bytes: Vec<u8>, ticker: &MarketTicker) -> (Message, u64) {
    let mut cursor = BitCursor::new(Cursor::new(bytes));
    let msg = decode_next(&mut cursor, ticker, START).unwrap().unwrap();
    assert!(decode_next(&mut cursor, ticker, START).unwrap().is_none());
    (msg, cursor.position())
}

proptest! {
    #[test]
    fn delta_round_trip(msg in delta_strategy()) {
        let bytes = encode_delta(&msg, START).unwrap();
        let len = bytes.len() as u64;
        let (decoded, consumed) = decode_one(bytes, &msg.ticker);
        prop_assert_eq!(consumed, len * 8);
        prop_assert_eq!(decoded, Message::Delta(msg));
    }

    #[test]
    fn snapshot_round_trip(msg in snapshot_strategy()) {
        let bytes = encode_snapshot(&msg, START).unwrap();
        let len = bytes.len() as u64;
        let (decoded, consumed) = decode_one(bytes, &msg.ticker);
        prop_assert_eq!(consumed, len * 8);
        prop_assert_eq!(decoded, Message::Snapshot(msg));
    }

    #[test]
    fn concatenation_stays_decodable(
        snap in snapshot_strategy(),
        deltas in vec(delta_strategy(), 0..20),
    ) {
        let ticker = snap.ticker.clone();
        let mut expected = vec![Message::Snapshot(snap.clone())];
        let mut bytes = encode_snapshot(&snap, START).unwrap();
        for mut d in deltas {
            d.ticker = ticker.clone();
            bytes.extend(encode_delta(&d, START).unwrap());
            expected.push(Message::Delta(d));
        }
        let mut cursor = BitCursor::new(Cursor::new(bytes));
        let mut decoded = Vec::new();
        while let Some(m) = decode_next(&mut cursor, &ticker, START).unwrap() {
            prop_assert_eq!(cursor.position() % 8, 0);
            decoded.push(m);
        }
        prop_assert_eq!(decoded, expected);
    }

    #[test]
    fn oversized_delta_is_rejected(magnitude in (1i64 << 31)..(1i64 << 40), negative: bool) {
        let msg = DeltaMessage {
            ticker: MarketTicker::parse("S-E-M").unwrap(),
            ts: START,
            side: Side::Yes,
            price: 50,
            delta: if negative { -magnitude } else { magnitude },
        };
        prop_assert!(encode_delta(&msg, START).is_err());
    }
}
