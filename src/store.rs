//! Chunked on-disk store of order book snapshots and deltas.
//!
//! Layout under the root:
//!
//! ```text
//! <series>/<event>/<market>/metadata   chunk index (see `metadata`)
//! <series>/<event>/<market>/1, 2, ...  chunk files, each starting with a snapshot
//! <series>/<event>/<market>/.lock      writer lock
//! ```
//!
//! A writer keeps each market's current book, rebuilt from the newest chunk
//! when it first touches an existing market. Writes append to the newest
//! chunk. Once it holds `msgs_per_chunk` messages the next write rotates: a
//! new chunk is seeded with the current book as a snapshot, and the message
//! goes in after it. Reads locate the chunk covering the start
//! time, replay from its snapshot and continue through later chunks.
use crate::bits::BitCursor;
use crate::book::OrderBookState;
use crate::codec;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::merge::MergeByTime;
use crate::metadata::{ChunkMetadata, METADATA_FILE};
use crate::record::{Message, Quantity, SnapshotMessage};
use crate::ticker::{MarketTicker, TICKER_SEPARATOR};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const LOCK_FILE: &str = ".lock";

fn chunk_path(market_dir: &Path, chunk: u32) -> PathBuf {
    market_dir.join(chunk.to_string())
}

/// Metadata, current book and writer lock for a market this handle has
/// written to.
struct WriteHandle {
    metadata: ChunkMetadata,
    /// State after the last stored message, with its stored timestamp.
    /// `None` until the first snapshot.
    state: Option<OrderBookState>,
    _lock: File,
}

/// Handle over a store root. Writing to a market takes that market's lock
/// for the lifetime of the handle.
pub struct MarketStore {
    config: StoreConfig,
    open: HashMap<MarketTicker, WriteHandle>,
}

impl MarketStore {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root)?;
        Ok(Self {
            config,
            open: HashMap::new(),
        })
    }

    /// Open with default settings under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open(StoreConfig::new(root))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn market_dir(&self, ticker: &MarketTicker) -> PathBuf {
        ticker.market_dir(&self.config.root)
    }

    fn write_handle(&mut self, ticker: &MarketTicker) -> Result<&mut WriteHandle> {
        let root = &self.config.root;
        let sync = self.config.sync_writes;
        match self.open.entry(ticker.clone()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let dir = ticker.market_dir(root);
                fs::create_dir_all(&dir)?;
                let lock = acquire_lock(&dir, ticker)?;
                let metadata = ChunkMetadata::load_or_create(dir.join(METADATA_FILE), sync)?;
                let last = metadata.last_chunk_number();
                let state = match last {
                    0 => None,
                    n => Some(replay_chunk(&dir, ticker, n, chunk_start(&metadata, n)?)?),
                };
                Ok(v.insert(WriteHandle {
                    metadata,
                    state,
                    _lock: lock,
                }))
            }
        }
    }

    /// Metadata as this handle sees it: the cached copy if it has written to
    /// the market, otherwise a fresh load. `None` if the market has no data.
    pub fn metadata(&self, ticker: &MarketTicker) -> Result<Option<ChunkMetadata>> {
        if let Some(handle) = self.open.get(ticker) {
            return Ok(Some(handle.metadata.clone()));
        }
        let path = self.market_dir(ticker).join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        ChunkMetadata::load(&path).map(Some)
    }

    pub fn chunk_count(&self, ticker: &MarketTicker) -> Result<u32> {
        Ok(self
            .metadata(ticker)?
            .map_or(0, |m| m.last_chunk_number()))
    }

    /// Append a message to its market, rotating to a new chunk when full.
    ///
    /// The first message of a market must be a snapshot. Messages must be
    /// written in timestamp order. Every message is folded into the
    /// market's current book before anything is written, so a rejected
    /// message leaves the chunk files and metadata untouched. A rejected
    /// first delta does not create the market directory.
    pub fn write(&mut self, message: &Message) -> Result<()> {
        let ticker = message.ticker().clone();
        if matches!(message, Message::Delta(_))
            && !self.open.contains_key(&ticker)
            && self.chunk_count(&ticker)? == 0
        {
            return Err(StoreError::MissingSnapshot(ticker));
        }
        let dir = self.market_dir(&ticker);
        let msgs_per_chunk = self.config.msgs_per_chunk;
        let sync = self.config.sync_writes;
        let handle = self.write_handle(&ticker)?;

        let Some(state) = handle.state.as_ref() else {
            let Message::Snapshot(snapshot) = message else {
                return Err(StoreError::MissingSnapshot(ticker));
            };
            let bytes = codec::encode_snapshot(snapshot, snapshot.ts)?;
            write_new_chunk(&chunk_path(&dir, 1), &bytes, sync)?;
            handle.metadata.record_rotation(snapshot.ts)?;
            handle.metadata.record_write()?;
            handle.state = Some(OrderBookState::from_snapshot(snapshot));
            info!(%ticker, ts = %snapshot.ts, "created market dataset");
            return Ok(());
        };

        if handle.metadata.messages_in_last_chunk() >= msgs_per_chunk {
            let seed = state.to_snapshot();
            let bytes = codec::encode(message, seed.ts)?;
            let next = fold(state, message, seed.ts)?;
            return rotate(&dir, &ticker, handle, &seed, &bytes, next, sync);
        }

        let current = handle.metadata.last_chunk_number();
        let start = chunk_start(&handle.metadata, current)?;
        let bytes = codec::encode(message, start)?;
        let next = fold(state, message, start)?;
        append_to_chunk(&chunk_path(&dir, current), &bytes, sync)?;
        handle.metadata.record_write()?;
        handle.state = Some(next);
        Ok(())
    }

    /// Lazily reconstruct the market's states with timestamps in
    /// `[start, end]`. Either bound may be omitted.
    pub fn read(
        &self,
        ticker: &MarketTicker,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<OrderBookReader> {
        if let (Some(start), Some(end)) = (start, end) {
            if end < start {
                return Err(StoreError::InvalidRange { start, end });
            }
        }
        let (chunk_starts, first_chunk) = match self.metadata(ticker)? {
            Some(meta) => {
                let first = meta.locate_chunk_for(start).unwrap_or(1);
                (meta.chunk_start_timestamps().to_vec(), first)
            }
            None => (Vec::new(), 1),
        };
        Ok(OrderBookReader {
            dir: self.market_dir(ticker),
            ticker: ticker.clone(),
            chunk_starts,
            chunk: first_chunk,
            decoder: None,
            state: None,
            start,
            end,
            done: false,
        })
    }

    /// Read several markets merged into one time-ordered sequence.
    pub fn read_many(
        &self,
        tickers: &[MarketTicker],
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<MergeByTime<OrderBookReader>> {
        let readers = tickers
            .iter()
            .map(|t| self.read(t, start, end))
            .collect::<Result<Vec<_>>>()?;
        Ok(MergeByTime::new(readers))
    }

    pub fn list_series(&self) -> Result<Vec<String>> {
        list_dirs(&self.config.root)
    }

    /// Event tickers (`SERIES-EVENT`) under a series.
    pub fn list_events(&self, series: &str) -> Result<Vec<String>> {
        if series.is_empty() || series.contains(TICKER_SEPARATOR) {
            return Err(StoreError::InvalidTicker(series.to_string()));
        }
        Ok(list_dirs(&self.config.root.join(series))?
            .into_iter()
            .map(|event| format!("{series}{TICKER_SEPARATOR}{event}"))
            .collect())
    }

    /// Market tickers under an event ticker (`SERIES-EVENT`).
    pub fn list_markets(&self, event: &str) -> Result<Vec<MarketTicker>> {
        let Some((series, suffix)) = event.split_once(TICKER_SEPARATOR) else {
            return Err(StoreError::InvalidTicker(event.to_string()));
        };
        if series.is_empty() || suffix.is_empty() || suffix.contains(TICKER_SEPARATOR) {
            return Err(StoreError::InvalidTicker(event.to_string()));
        }
        let dir = self.config.root.join(series).join(suffix);
        Ok(list_dirs(&dir)?
            .into_iter()
            .filter_map(|market| {
                MarketTicker::parse(&format!("{event}{TICKER_SEPARATOR}{market}")).ok()
            })
            .collect())
    }
}

fn chunk_start(meta: &ChunkMetadata, chunk: u32) -> Result<OffsetDateTime> {
    meta.chunk_start(chunk).ok_or_else(|| {
        StoreError::Corrupt(format!(
            "{}: no start time for chunk {chunk}",
            meta.path().display()
        ))
    })
}

/// Book after storing `message` in a chunk starting at `chunk_start`.
///
/// Fails without touching `state` if a level would go negative or grow past
/// what a snapshot can encode.
fn fold(
    state: &OrderBookState,
    message: &Message,
    chunk_start: OffsetDateTime,
) -> Result<OrderBookState> {
    let mut next = match message {
        Message::Snapshot(s) => OrderBookState::from_snapshot(s),
        Message::Delta(d) => {
            let mut next = state.clone();
            next.apply_delta(d)?;
            if let Some(&quantity) = next.side(d.side).get(&d.price) {
                if quantity > u32::MAX as Quantity {
                    return Err(StoreError::QuantityOverflow {
                        ticker: d.ticker.clone(),
                        side: d.side,
                        price: d.price,
                        quantity,
                    });
                }
            }
            next
        }
    };
    next.ts = codec::stored_ts(message.ticker(), message.ts(), chunk_start)?;
    Ok(next)
}

/// Start chunk `n+1` with `seed`, the current book, then append the encoded
/// message that triggered the rotation.
fn rotate(
    dir: &Path,
    ticker: &MarketTicker,
    handle: &mut WriteHandle,
    seed: &SnapshotMessage,
    message_bytes: &[u8],
    next: OrderBookState,
    sync: bool,
) -> Result<()> {
    let seed_bytes = codec::encode_snapshot(seed, seed.ts)?;

    let chunk = handle.metadata.last_chunk_number() + 1;
    let path = chunk_path(dir, chunk);
    write_new_chunk(&path, &seed_bytes, sync)?;
    handle.metadata.record_rotation(seed.ts)?;
    append_to_chunk(&path, message_bytes, sync)?;
    handle.metadata.record_write()?;
    handle.state = Some(next);
    debug!(%ticker, chunk, start = %seed.ts, "rotated chunk");
    Ok(())
}

/// Decode a whole chunk and return its final state.
fn replay_chunk(
    dir: &Path,
    ticker: &MarketTicker,
    chunk: u32,
    chunk_start: OffsetDateTime,
) -> Result<OrderBookState> {
    let mut decoder = ChunkDecoder::open(&chunk_path(dir, chunk), ticker, chunk_start)?;
    let mut state: Option<OrderBookState> = None;
    while let Some(message) = decoder.next_message()? {
        match (message, state.as_mut()) {
            (Message::Snapshot(s), _) => state = Some(OrderBookState::from_snapshot(&s)),
            (Message::Delta(d), Some(st)) => st.apply_delta(&d)?,
            (Message::Delta(_), None) => {
                return Err(StoreError::Corrupt(format!(
                    "{ticker}: chunk {chunk} has a delta before any snapshot"
                )));
            }
        }
    }
    state.ok_or_else(|| StoreError::Corrupt(format!("{ticker}: chunk {chunk} is empty")))
}

fn acquire_lock(dir: &Path, ticker: &MarketTicker) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(StoreError::MarketLocked(ticker.clone())),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

fn write_new_chunk(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    let mut f = File::create(path)?;
    f.write_all(bytes)?;
    if sync {
        f.sync_data()?;
    }
    Ok(())
}

fn append_to_chunk(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    let mut f = OpenOptions::new().append(true).open(path)?;
    f.write_all(bytes)?;
    if sync {
        f.sync_data()?;
    }
    Ok(())
}

/// Sorted names of visible subdirectories; empty if `dir` is missing.
fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Message stream over one chunk file.
struct ChunkDecoder {
    cursor: BitCursor<File>,
    ticker: MarketTicker,
    chunk_start: OffsetDateTime,
    at_head: bool,
}

impl ChunkDecoder {
    fn open(path: &Path, ticker: &MarketTicker, chunk_start: OffsetDateTime) -> Result<Self> {
        Ok(Self {
            cursor: BitCursor::new(File::open(path)?),
            ticker: ticker.clone(),
            chunk_start,
            at_head: true,
        })
    }

    fn next_message(&mut self) -> Result<Option<Message>> {
        let message = codec::decode_next(&mut self.cursor, &self.ticker, self.chunk_start)?;
        if self.at_head {
            if let Some(Message::Delta(_)) = message {
                return Err(StoreError::Corrupt(format!(
                    "{}: chunk does not start with a snapshot",
                    self.ticker
                )));
            }
            self.at_head = false;
        }
        Ok(message)
    }
}

/// Lazy sequence of reconstructed states for one market.
///
/// Yields `Err` at most once, then ends.
pub struct OrderBookReader {
    dir: PathBuf,
    ticker: MarketTicker,
    chunk_starts: Vec<OffsetDateTime>,
    /// Chunk being decoded (1-indexed).
    chunk: u32,
    decoder: Option<ChunkDecoder>,
    state: Option<OrderBookState>,
    start: Option<OffsetDateTime>,
    end: Option<OffsetDateTime>,
    done: bool,
}

impl OrderBookReader {
    pub fn ticker(&self) -> &MarketTicker {
        &self.ticker
    }

    fn last_chunk(&self) -> u32 {
        self.chunk_starts.len() as u32
    }

    /// Next state produced by a stored message, crossing chunk boundaries.
    fn advance(&mut self) -> Result<Option<OrderBookState>> {
        loop {
            if self.decoder.is_none() {
                if self.chunk > self.last_chunk() {
                    return Ok(None);
                }
                let start = self.chunk_starts[self.chunk as usize - 1];
                let decoder = ChunkDecoder::open(&chunk_path(&self.dir, self.chunk), &self.ticker, start)?;
                self.decoder = Some(decoder);
            }
            let Some(decoder) = self.decoder.as_mut() else {
                continue;
            };
            let at_head = decoder.at_head;
            match decoder.next_message()? {
                None => {
                    self.decoder = None;
                    self.chunk += 1;
                    continue;
                }
                Some(Message::Snapshot(s)) => {
                    // A later chunk's seed repeats the state we already hold.
                    let seed = at_head && self.state.is_some();
                    self.state = Some(OrderBookState::from_snapshot(&s));
                    if seed {
                        continue;
                    }
                }
                Some(Message::Delta(d)) => match self.state.as_mut() {
                    Some(state) => state.apply_delta(&d)?,
                    None => {
                        return Err(StoreError::Corrupt(format!(
                            "{}: delta before any snapshot",
                            self.ticker
                        )));
                    }
                },
            }
            return Ok(self.state.clone());
        }
    }
}

impl Iterator for OrderBookReader {
    type Item = Result<OrderBookState>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.advance() {
                Err(e) => {
                    self.done = true;
                    self.decoder = None;
                    if let StoreError::Truncated { bit_offset, .. } = &e {
                        warn!(ticker = %self.ticker, chunk = self.chunk, bit_offset, "truncated chunk");
                    }
                    return Some(Err(e));
                }
                Ok(None) => self.done = true,
                Ok(Some(state)) => {
                    if self.end.is_some_and(|end| state.ts > end) {
                        self.done = true;
                        self.decoder = None;
                        return None;
                    }
                    if self.start.is_none_or(|start| state.ts >= start) {
                        return Some(Ok(state));
                    }
                }
            }
        }
        None
    }
}
