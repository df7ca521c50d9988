//! Variable-width binary encoding of snapshot and delta messages.
//!
//! Every message starts with an explicit type bit and is zero-padded to a
//! byte boundary, so a chunk is a plain concatenation of messages. Numeric
//! fields are prefixed by a 3-bit `len_code` holding `groups - 1`, where the
//! field is `groups * 4` bits wide (4..=32).
//!
//! ```text
//! delta:    1 | ts_len:3 | qty_len:3 | ts | sign+|delta| | price:7 | side:1 | pad
//! snapshot: 0 | ts_len:3 | ts | 99 x (presence:2 [yes: len:3 qty] [no: len:3 qty]) | pad
//! ```
//!
//! Timestamps are stored as tenths of a second since the chunk start, rounded
//! to the nearest tenth with ties to even. Side is
//! `1` for YES; the presence code has `2` for a YES level and `1` for a NO
//! level at that price.
use crate::bits::{BitCursor, BitWriter};
use crate::error::{BitReadError, Result, StoreError};
use crate::record::{
    DeltaMessage, MAX_PRICE, MIN_PRICE, Message, Price, Quantity, Side, SnapshotMessage,
};
use crate::ticker::MarketTicker;
use std::cmp::Ordering;
use std::io::Read;
use time::{Duration, OffsetDateTime};

pub const LEN_CODE_BITS: usize = 3;
pub const PRICE_BITS: usize = 7;
pub const PRESENCE_BITS: usize = 2;
/// Widest encodable numeric field.
pub const MAX_FIELD_BITS: u32 = 32;

const TYPE_DELTA: bool = true;
const NANOS_PER_TENTH: i128 = 100_000_000;
const PRESENT_YES: u64 = 0b10;
const PRESENT_NO: u64 = 0b01;

fn bit_len(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}

/// Number of 4-bit groups needed for `bits` bits, at least one.
fn groups_for(bits: u32) -> u32 {
    bits.max(1).div_ceil(4)
}

/// Push `len_code` then the value itself. `value` must fit in 32 bits.
fn push_sized(w: &mut BitWriter, value: u64) {
    let groups = groups_for(bit_len(value));
    w.push((groups - 1) as u64, LEN_CODE_BITS);
    w.push(value, (groups * 4) as usize);
}

fn check_price(ticker: &MarketTicker, price: Price) -> Result<()> {
    if !(MIN_PRICE..=MAX_PRICE).contains(&price) {
        return Err(StoreError::InvalidPrice {
            ticker: ticker.clone(),
            price,
        });
    }
    Ok(())
}

/// Round to the nearest tenth, ties to even.
fn round_tenths(nanos: i128) -> i128 {
    let (q, r) = (nanos.div_euclid(NANOS_PER_TENTH), nanos.rem_euclid(NANOS_PER_TENTH));
    match (2 * r).cmp(&NANOS_PER_TENTH) {
        Ordering::Greater => q + 1,
        Ordering::Equal if q % 2 != 0 => q + 1,
        _ => q,
    }
}

/// Tenths of a second from `chunk_start` to `ts`, rounded before the range
/// check so a timestamp a few milliseconds early still stores as zero.
fn timestamp_tenths(
    ticker: &MarketTicker,
    ts: OffsetDateTime,
    chunk_start: OffsetDateTime,
) -> Result<u64> {
    let tenths = round_tenths((ts - chunk_start).whole_nanoseconds());
    if tenths < 0 {
        return Err(StoreError::TimestampBeforeChunkStart {
            ticker: ticker.clone(),
            ts,
            chunk_start,
        });
    }
    if tenths > u32::MAX as i128 {
        return Err(StoreError::TimestampOverflow {
            ticker: ticker.clone(),
            tenths,
        });
    }
    Ok(tenths as u64)
}

/// The timestamp `ts` decodes to when stored relative to `chunk_start`.
pub fn stored_ts(
    ticker: &MarketTicker,
    ts: OffsetDateTime,
    chunk_start: OffsetDateTime,
) -> Result<OffsetDateTime> {
    Ok(tenths_to_ts(chunk_start, timestamp_tenths(ticker, ts, chunk_start)?))
}

pub fn encode(message: &Message, chunk_start: OffsetDateTime) -> Result<Vec<u8>> {
    match message {
        Message::Snapshot(s) => encode_snapshot(s, chunk_start),
        Message::Delta(d) => encode_delta(d, chunk_start),
    }
}

pub fn encode_delta(msg: &DeltaMessage, chunk_start: OffsetDateTime) -> Result<Vec<u8>> {
    check_price(&msg.ticker, msg.price)?;
    let tenths = timestamp_tenths(&msg.ticker, msg.ts, chunk_start)?;

    let magnitude = msg.delta.unsigned_abs();
    let needed = bit_len(magnitude) + 1;
    if needed > MAX_FIELD_BITS {
        return Err(StoreError::QuantityDeltaOverflow {
            ticker: msg.ticker.clone(),
            side: msg.side,
            price: msg.price,
            delta: msg.delta,
        });
    }
    let qty_groups = groups_for(needed);
    let qty_width = (qty_groups * 4) as usize;
    let sign = u64::from(msg.delta < 0) << (qty_width - 1);
    let ts_groups = groups_for(bit_len(tenths));

    let mut w = BitWriter::new();
    w.push_bit(TYPE_DELTA);
    w.push((ts_groups - 1) as u64, LEN_CODE_BITS);
    w.push((qty_groups - 1) as u64, LEN_CODE_BITS);
    w.push(tenths, (ts_groups * 4) as usize);
    w.push(sign | magnitude, qty_width);
    w.push(msg.price as u64, PRICE_BITS);
    w.push_bit(msg.side == Side::Yes);
    Ok(w.finish())
}

/// Index a snapshot side by price, validating prices, duplicates and widths.
fn level_table(
    ticker: &MarketTicker,
    side: Side,
    levels: &[(Price, Quantity)],
) -> Result<[Option<Quantity>; MAX_PRICE as usize + 1]> {
    let mut table = [None; MAX_PRICE as usize + 1];
    for &(price, quantity) in levels {
        check_price(ticker, price)?;
        if bit_len(quantity) > MAX_FIELD_BITS {
            return Err(StoreError::QuantityOverflow {
                ticker: ticker.clone(),
                side,
                price,
                quantity,
            });
        }
        let slot = &mut table[price as usize];
        if slot.is_some() {
            return Err(StoreError::DuplicateLevel {
                ticker: ticker.clone(),
                side,
                price,
            });
        }
        *slot = Some(quantity);
    }
    Ok(table)
}

pub fn encode_snapshot(msg: &SnapshotMessage, chunk_start: OffsetDateTime) -> Result<Vec<u8>> {
    let tenths = timestamp_tenths(&msg.ticker, msg.ts, chunk_start)?;
    let yes = level_table(&msg.ticker, Side::Yes, &msg.yes)?;
    let no = level_table(&msg.ticker, Side::No, &msg.no)?;

    let mut w = BitWriter::new();
    w.push_bit(!TYPE_DELTA);
    push_sized(&mut w, tenths);
    for price in MIN_PRICE..=MAX_PRICE {
        let (y, n) = (yes[price as usize], no[price as usize]);
        let mut presence = 0;
        if y.is_some() {
            presence |= PRESENT_YES;
        }
        if n.is_some() {
            presence |= PRESENT_NO;
        }
        w.push(presence, PRESENCE_BITS);
        for quantity in [y, n].into_iter().flatten() {
            push_sized(&mut w, quantity);
        }
    }
    Ok(w.finish())
}

fn read_field<R: Read>(
    cursor: &mut BitCursor<R>,
    n_bits: usize,
    ticker: &MarketTicker,
) -> Result<u64> {
    cursor.read(n_bits).map_err(|e| match e {
        BitReadError::EndOfStream => StoreError::Truncated {
            ticker: ticker.clone(),
            bit_offset: cursor.position(),
        },
        BitReadError::Io(io) => StoreError::Io(io),
        other => StoreError::Corrupt(other.to_string()),
    })
}

fn read_sized<R: Read>(cursor: &mut BitCursor<R>, ticker: &MarketTicker) -> Result<(u64, usize)> {
    let groups = read_field(cursor, LEN_CODE_BITS, ticker)? as usize + 1;
    let width = groups * 4;
    Ok((read_field(cursor, width, ticker)?, width))
}

fn tenths_to_ts(chunk_start: OffsetDateTime, tenths: u64) -> OffsetDateTime {
    chunk_start + Duration::milliseconds(tenths as i64 * 100)
}

fn read_price<R: Read>(cursor: &mut BitCursor<R>, ticker: &MarketTicker) -> Result<Price> {
    let price = read_field(cursor, PRICE_BITS, ticker)? as Price;
    if !(MIN_PRICE..=MAX_PRICE).contains(&price) {
        return Err(StoreError::Corrupt(format!(
            "{ticker}: decoded price {price} outside {MIN_PRICE}..={MAX_PRICE}"
        )));
    }
    Ok(price)
}

/// Decode a delta body; the type bit has already been consumed.
///
/// Returns the message and the number of payload bits read.
pub fn decode_delta_body<R: Read>(
    cursor: &mut BitCursor<R>,
    ticker: &MarketTicker,
    chunk_start: OffsetDateTime,
) -> Result<(DeltaMessage, usize)> {
    let begin = cursor.position();
    let ts_width = (read_field(cursor, LEN_CODE_BITS, ticker)? as usize + 1) * 4;
    let qty_width = (read_field(cursor, LEN_CODE_BITS, ticker)? as usize + 1) * 4;
    let tenths = read_field(cursor, ts_width, ticker)?;
    let field = read_field(cursor, qty_width, ticker)?;
    let price = read_price(cursor, ticker)?;
    let side = if read_field(cursor, 1, ticker)? == 1 {
        Side::Yes
    } else {
        Side::No
    };

    let magnitude = (field & ((1u64 << (qty_width - 1)) - 1)) as i64;
    let delta = if field >> (qty_width - 1) == 1 {
        -magnitude
    } else {
        magnitude
    };
    let msg = DeltaMessage {
        ticker: ticker.clone(),
        ts: tenths_to_ts(chunk_start, tenths),
        side,
        price,
        delta,
    };
    Ok((msg, (cursor.position() - begin) as usize))
}

/// Decode a snapshot body; the type bit has already been consumed.
///
/// Returns the message and the number of payload bits read.
pub fn decode_snapshot_body<R: Read>(
    cursor: &mut BitCursor<R>,
    ticker: &MarketTicker,
    chunk_start: OffsetDateTime,
) -> Result<(SnapshotMessage, usize)> {
    let begin = cursor.position();
    let (tenths, _) = read_sized(cursor, ticker)?;
    let mut yes = Vec::new();
    let mut no = Vec::new();
    for price in MIN_PRICE..=MAX_PRICE {
        let presence = read_field(cursor, PRESENCE_BITS, ticker)?;
        if presence & PRESENT_YES != 0 {
            yes.push((price, read_sized(cursor, ticker)?.0));
        }
        if presence & PRESENT_NO != 0 {
            no.push((price, read_sized(cursor, ticker)?.0));
        }
    }
    let msg = SnapshotMessage {
        ticker: ticker.clone(),
        ts: tenths_to_ts(chunk_start, tenths),
        yes,
        no,
    };
    Ok((msg, (cursor.position() - begin) as usize))
}

/// Decode the next message, or `None` at a clean end of stream.
///
/// End of stream anywhere other than a message boundary is
/// [`StoreError::Truncated`]; non-zero padding is [`StoreError::Corrupt`].
pub fn decode_next<R: Read>(
    cursor: &mut BitCursor<R>,
    ticker: &MarketTicker,
    chunk_start: OffsetDateTime,
) -> Result<Option<Message>> {
    let is_delta = match cursor.read_bit() {
        Ok(bit) => bit,
        Err(BitReadError::EndOfStream) if cursor.buffered_bits() == 0 => return Ok(None),
        Err(BitReadError::EndOfStream) => {
            return Err(StoreError::Truncated {
                ticker: ticker.clone(),
                bit_offset: cursor.position(),
            });
        }
        Err(BitReadError::Io(e)) => return Err(StoreError::Io(e)),
        Err(e) => return Err(StoreError::Corrupt(e.to_string())),
    };
    let (message, payload_bits) = if is_delta == TYPE_DELTA {
        let (d, bits) = decode_delta_body(cursor, ticker, chunk_start)?;
        (Message::Delta(d), bits)
    } else {
        let (s, bits) = decode_snapshot_body(cursor, ticker, chunk_start)?;
        (Message::Snapshot(s), bits)
    };

    let used = 1 + payload_bits;
    let padding = (8 - used % 8) % 8;
    if padding > 0 && read_field(cursor, padding, ticker)? != 0 {
        return Err(StoreError::Corrupt(format!(
            "{ticker}: non-zero padding after message ending at bit {}",
            cursor.position()
        )));
    }
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use time::macros::datetime;

    const START: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

    fn ticker() -> MarketTicker {
        MarketTicker::parse("SERIES-EVENT-MARKET").unwrap()
    }

    fn delta(secs_tenths: i64, side: Side, price: Price, delta: i64) -> DeltaMessage {
        DeltaMessage {
            ticker: ticker(),
            ts: START + Duration::milliseconds(secs_tenths * 100),
            side,
            price,
            delta,
        }
    }

    fn decode_all(bytes: Vec<u8>) -> Vec<Message> {
        let mut cursor = BitCursor::new(Cursor::new(bytes));
        let mut out = Vec::new();
        while let Some(m) = decode_next(&mut cursor, &ticker(), START).unwrap() {
            out.push(m);
        }
        out
    }

    #[test]
    fn delta_bit_layout() {
        // 1 | 000 | 000 | 1010 | 1011 | 0110010 | 1 | 0
        let bytes = encode_delta(&delta(10, Side::Yes, 50, -3), START).unwrap();
        assert_eq!(bytes, vec![0x81, 0x56, 0xCA]);
    }

    #[test]
    fn empty_snapshot_is_all_padding_zeros() {
        let snap = SnapshotMessage {
            ticker: ticker(),
            ts: START,
            yes: vec![],
            no: vec![],
        };
        // 1 + 3 + 4 + 99 * 2 = 206 bits -> 26 bytes
        assert_eq!(encode_snapshot(&snap, START).unwrap(), vec![0u8; 26]);
    }

    #[test]
    fn delta_edge_values_round_trip() {
        let cases = [
            delta(0, Side::No, MIN_PRICE, 0),
            delta(1, Side::Yes, MAX_PRICE, (1 << 31) - 1),
            delta(2, Side::No, 42, -((1 << 31) - 1)),
            delta(u32::MAX as i64, Side::Yes, 7, 1),
        ];
        for msg in cases {
            let bytes = encode_delta(&msg, START).unwrap();
            assert_eq!(decode_all(bytes), vec![Message::Delta(msg)]);
        }
    }

    #[test]
    fn saturated_snapshot_round_trip() {
        let levels: Vec<_> = (MIN_PRICE..=MAX_PRICE)
            .map(|p| (p, u32::MAX as u64 - p as u64))
            .collect();
        let snap = SnapshotMessage {
            ticker: ticker(),
            ts: START + Duration::seconds(90),
            yes: levels.clone(),
            no: levels,
        };
        let bytes = encode_snapshot(&snap, START).unwrap();
        assert_eq!(decode_all(bytes), vec![Message::Snapshot(snap)]);
    }

    #[test]
    fn concatenated_messages_decode_in_order() {
        let snap = SnapshotMessage {
            ticker: ticker(),
            ts: START,
            yes: vec![(50, 10)],
            no: vec![(40, 5)],
        };
        let d1 = delta(10, Side::Yes, 50, -3);
        let d2 = delta(25, Side::No, 40, 1000);
        let mut bytes = encode_snapshot(&snap, START).unwrap();
        bytes.extend(encode_delta(&d1, START).unwrap());
        bytes.extend(encode_delta(&d2, START).unwrap());
        assert_eq!(
            decode_all(bytes),
            vec![Message::Snapshot(snap), Message::Delta(d1), Message::Delta(d2)]
        );
    }

    #[test]
    fn timestamps_round_to_nearest_tenth() {
        let mut msg = delta(0, Side::Yes, 1, 1);
        msg.ts = START + Duration::milliseconds(1_249);
        let bytes = encode_delta(&msg, START).unwrap();
        let Message::Delta(back) = decode_all(bytes).remove(0) else {
            panic!("expected delta");
        };
        assert_eq!(back.ts, START + Duration::milliseconds(1_200));
    }

    #[test]
    fn rounding_ties_go_to_even() {
        let stored = |ms: i64| stored_ts(&ticker(), START + Duration::milliseconds(ms), START).unwrap();
        assert_eq!(stored(50), START);
        assert_eq!(stored(150), START + Duration::milliseconds(200));
        assert_eq!(stored(250), START + Duration::milliseconds(200));
        assert_eq!(stored(251), START + Duration::milliseconds(300));
    }

    #[test]
    fn slightly_early_timestamp_rounds_to_chunk_start() {
        let mut msg = delta(0, Side::Yes, 1, 1);
        msg.ts = START - Duration::milliseconds(30);
        let Message::Delta(back) = decode_all(encode_delta(&msg, START).unwrap()).remove(0) else {
            panic!("expected delta");
        };
        assert_eq!(back.ts, START);

        msg.ts = START - Duration::milliseconds(60);
        assert!(matches!(
            encode_delta(&msg, START),
            Err(StoreError::TimestampBeforeChunkStart { .. })
        ));
    }

    #[test]
    fn overflow_is_rejected() {
        let too_wide = delta(0, Side::Yes, 10, 1 << 31);
        assert!(matches!(
            encode_delta(&too_wide, START),
            Err(StoreError::QuantityDeltaOverflow { price: 10, .. })
        ));

        let too_late = delta(u32::MAX as i64 + 1, Side::Yes, 10, 1);
        assert!(matches!(
            encode_delta(&too_late, START),
            Err(StoreError::TimestampOverflow { .. })
        ));

        let snap = SnapshotMessage {
            ticker: ticker(),
            ts: START,
            yes: vec![],
            no: vec![(3, 1 << 32)],
        };
        assert!(matches!(
            encode_snapshot(&snap, START),
            Err(StoreError::QuantityOverflow { side: Side::No, price: 3, .. })
        ));
    }

    #[test]
    fn invalid_messages_are_rejected() {
        assert!(matches!(
            encode_delta(&delta(0, Side::Yes, 0, 1), START),
            Err(StoreError::InvalidPrice { price: 0, .. })
        ));
        assert!(matches!(
            encode_delta(&delta(-1, Side::Yes, 5, 1), START),
            Err(StoreError::TimestampBeforeChunkStart { .. })
        ));
        let dup = SnapshotMessage {
            ticker: ticker(),
            ts: START,
            yes: vec![(5, 1), (5, 2)],
            no: vec![],
        };
        assert!(matches!(
            encode_snapshot(&dup, START),
            Err(StoreError::DuplicateLevel { price: 5, .. })
        ));
    }

    #[test]
    fn truncated_message_is_not_a_clean_end() {
        let mut bytes = encode_delta(&delta(10, Side::Yes, 50, -3), START).unwrap();
        bytes.pop();
        let mut cursor = BitCursor::new(Cursor::new(bytes));
        assert!(matches!(
            decode_next(&mut cursor, &ticker(), START),
            Err(StoreError::Truncated { .. })
        ));

        let mut empty = BitCursor::new(Cursor::new(Vec::new()));
        assert!(decode_next(&mut empty, &ticker(), START).unwrap().is_none());
    }
}
