use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use orderbook_store::{MarketStore, MarketTicker, OrderBookState, StoreConfig};
use std::path::PathBuf;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Browse and replay a chunked order book store")]
struct Args {
    /// Store root directory
    #[arg(long, env = "ORDERBOOK_STORE_ROOT", default_value = "storage")]
    root: PathBuf,

    /// Messages per chunk (only matters for writers sharing this config)
    #[arg(long, env = "MSGS_PER_CHUNK", default_value_t = 5000)]
    msgs_per_chunk: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List series tickers
    Series,
    /// List event tickers under a series
    Events { series: String },
    /// List market tickers under an event (SERIES-EVENT)
    Markets { event: String },
    /// Reconstruct and print a market's book over a time range
    Replay {
        /// Market ticker (SERIES-EVENT-MARKET)
        ticker: String,

        /// Inclusive start, RFC 3339
        #[arg(long, value_parser = parse_ts)]
        start: Option<OffsetDateTime>,

        /// Inclusive end, RFC 3339
        #[arg(long, value_parser = parse_ts)]
        end: Option<OffsetDateTime>,

        /// Print the top levels of every state
        #[arg(long, default_value_t = false)]
        dump: bool,

        /// Number of levels to print when dumping
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
}

fn parse_ts(s: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(s, &Rfc3339)
}

fn print_state(state: &OrderBookState, top: usize) -> Result<()> {
    println!("ts={} | top{} yes / no:", state.ts.format(&Rfc3339)?, top);
    let yes: Vec<_> = state.yes.iter().rev().take(top).collect();
    let no: Vec<_> = state.no.iter().rev().take(top).collect();
    for i in 0..yes.len().max(no.len()) {
        let y = yes
            .get(i)
            .map(|(p, q)| format!("{:>3}: {:>3}c x {:>8}", i, p, q))
            .unwrap_or_else(|| format!("{:>3}: -", i));
        let n = no
            .get(i)
            .map(|(p, q)| format!("{:>3}c x {:>8}", p, q))
            .unwrap_or_else(|| "-".to_string());
        println!("{} | {}", y, n);
    }
    println!("---");
    Ok(())
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = StoreConfig::new(&args.root).with_msgs_per_chunk(args.msgs_per_chunk);
    let store = MarketStore::open(config).with_context(|| format!("open store at {:?}", args.root))?;

    match args.command {
        Command::Series => {
            for s in store.list_series()? {
                println!("{s}");
            }
        }
        Command::Events { series } => {
            for e in store.list_events(&series)? {
                println!("{e}");
            }
        }
        Command::Markets { event } => {
            for m in store.list_markets(&event)? {
                println!("{m}");
            }
        }
        Command::Replay { ticker, start, end, dump, top } => {
            let ticker = MarketTicker::parse(&ticker)?;
            let mut states = 0usize;
            let mut last: Option<OrderBookState> = None;
            for state in store.read(&ticker, start, end)? {
                let state = state.with_context(|| format!("replay {ticker} after {states} states"))?;
                states += 1;
                if dump {
                    print_state(&state, top)?;
                }
                last = Some(state);
            }
            match last {
                Some(book) => eprintln!(
                    "Read {} states. Final book at {}: {} yes levels, {} no levels, best yes {:?}, best no {:?}.",
                    states,
                    book.ts.format(&Rfc3339)?,
                    book.yes.len(),
                    book.no.len(),
                    book.best_yes(),
                    book.best_no()
                ),
                None => eprintln!("Read 0 states for {ticker}."),
            }
        }
    }
    Ok(())
}
