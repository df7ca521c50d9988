//! Market identifiers and their on-disk directory layout.
//!
//! A market ticker such as `CPICORE-23JUL-TN0.1` names a series
//! (`CPICORE`), an event within it (`23JUL`) and the market itself
//! (`TN0.1`). Each part becomes one directory level under the store root.
use crate::error::{Result, StoreError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Separator between the series, event and market parts of a ticker.
pub const TICKER_SEPARATOR: char = '-';

/// Full market ticker, validated to have exactly three non-empty parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarketTicker(String);

impl MarketTicker {
    pub fn parse(ticker: &str) -> Result<Self> {
        let parts: Vec<&str> = ticker.split(TICKER_SEPARATOR).collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(StoreError::InvalidTicker(ticker.to_string()));
        }
        Ok(Self(ticker.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> (&str, &str, &str) {
        let mut it = self.0.splitn(3, TICKER_SEPARATOR);
        // Validated in `parse`.
        let series = it.next().unwrap_or_default();
        let event = it.next().unwrap_or_default();
        let market = it.next().unwrap_or_default();
        (series, event, market)
    }

    /// Series part, e.g. `CPICORE`.
    pub fn series(&self) -> &str {
        self.parts().0
    }

    /// Event ticker including its series, e.g. `CPICORE-23JUL`.
    pub fn event_ticker(&self) -> String {
        let (series, event, _) = self.parts();
        format!("{series}{TICKER_SEPARATOR}{event}")
    }

    /// Directory of this market relative to the store root.
    pub fn relative_dir(&self) -> PathBuf {
        let (series, event, market) = self.parts();
        [series, event, market].iter().collect()
    }

    pub fn market_dir(&self, root: &Path) -> PathBuf {
        root.join(self.relative_dir())
    }
}

impl FromStr for MarketTicker {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for MarketTicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
