//! Domain types for archive work units.
//!
//! A `WorkUnit` is the atomic fetch target: one dated archive file for one
//! (venue segment, data kind, symbol, interval?, period) combination. The
//! remote key and local destination path are both derived from the same
//! fields, so two runs over the same selection always agree on where a
//! unit lives — on the host and on disk.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root of the public archive host.
pub const BASE_URL: &str = "https://data.binance.vision/";

/// Venue segment: spot market or one of the two derivatives markets.
///
/// Serialized with the short codes the archive host uses in its paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VenueSegment {
    #[serde(rename = "spot")]
    Spot,
    #[serde(rename = "um")]
    UsdMarginedFutures,
    #[serde(rename = "cm")]
    CoinMarginedFutures,
}

impl VenueSegment {
    pub const ALL: [VenueSegment; 3] = [
        VenueSegment::Spot,
        VenueSegment::UsdMarginedFutures,
        VenueSegment::CoinMarginedFutures,
    ];

    /// Short code used in archive paths and CLI arguments.
    pub fn code(&self) -> &'static str {
        match self {
            VenueSegment::Spot => "spot",
            VenueSegment::UsdMarginedFutures => "um",
            VenueSegment::CoinMarginedFutures => "cm",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            VenueSegment::Spot => "spot market",
            VenueSegment::UsdMarginedFutures => "USD-margined futures",
            VenueSegment::CoinMarginedFutures => "coin-margined futures",
        }
    }

    pub fn is_futures(&self) -> bool {
        !matches!(self, VenueSegment::Spot)
    }

    /// Archive path prefix: `data/spot` or `data/futures/{um,cm}`.
    fn path_prefix(&self) -> &'static str {
        match self {
            VenueSegment::Spot => "data/spot",
            VenueSegment::UsdMarginedFutures => "data/futures/um",
            VenueSegment::CoinMarginedFutures => "data/futures/cm",
        }
    }
}

impl fmt::Display for VenueSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for VenueSegment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot" => Ok(VenueSegment::Spot),
            "um" => Ok(VenueSegment::UsdMarginedFutures),
            "cm" => Ok(VenueSegment::CoinMarginedFutures),
            other => Err(format!("unknown venue segment '{other}' (expected spot, um, cm)")),
        }
    }
}

/// Kind of archived data.
///
/// Candle-like kinds carry an interval dimension; trade-like kinds are
/// event streams with no interval. The three derived price series are
/// only published for the futures segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataKind {
    #[serde(rename = "klines")]
    Klines,
    #[serde(rename = "trades")]
    Trades,
    #[serde(rename = "aggTrades")]
    AggTrades,
    #[serde(rename = "markPriceKlines")]
    MarkPriceKlines,
    #[serde(rename = "indexPriceKlines")]
    IndexPriceKlines,
    #[serde(rename = "premiumIndexKlines")]
    PremiumIndexKlines,
}

impl DataKind {
    pub const ALL: [DataKind; 6] = [
        DataKind::Klines,
        DataKind::Trades,
        DataKind::AggTrades,
        DataKind::MarkPriceKlines,
        DataKind::IndexPriceKlines,
        DataKind::PremiumIndexKlines,
    ];

    /// Name used in archive paths and file names.
    pub fn archive_name(&self) -> &'static str {
        match self {
            DataKind::Klines => "klines",
            DataKind::Trades => "trades",
            DataKind::AggTrades => "aggTrades",
            DataKind::MarkPriceKlines => "markPriceKlines",
            DataKind::IndexPriceKlines => "indexPriceKlines",
            DataKind::PremiumIndexKlines => "premiumIndexKlines",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DataKind::Klines => "candlestick series",
            DataKind::Trades => "raw trades",
            DataKind::AggTrades => "aggregated trades",
            DataKind::MarkPriceKlines => "mark price series (futures only)",
            DataKind::IndexPriceKlines => "index price series (futures only)",
            DataKind::PremiumIndexKlines => "premium index series (futures only)",
        }
    }

    /// Fixed-interval series kinds. These require at least one interval.
    pub fn is_candle_like(&self) -> bool {
        !self.is_trade_like()
    }

    /// Event-stream kinds. These have no interval dimension.
    pub fn is_trade_like(&self) -> bool {
        matches!(self, DataKind::Trades | DataKind::AggTrades)
    }

    /// Kinds the host only publishes for futures segments.
    pub fn is_futures_only(&self) -> bool {
        matches!(
            self,
            DataKind::MarkPriceKlines | DataKind::IndexPriceKlines | DataKind::PremiumIndexKlines
        )
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.archive_name())
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataKind::ALL
            .iter()
            .copied()
            .find(|k| k.archive_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown data kind '{s}' (see `list kinds`)"))
    }
}

/// Candle interval, sub-second excluded. Declared in ascending duration
/// order so the derived `Ord` matches the expansion ordering contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1s")]
    Sec1,
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "3m")]
    Min3,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "8h")]
    Hour8,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "3d")]
    Day3,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1mo")]
    Month1,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Interval::Sec1,
        Interval::Min1,
        Interval::Min3,
        Interval::Min5,
        Interval::Min15,
        Interval::Min30,
        Interval::Hour1,
        Interval::Hour2,
        Interval::Hour4,
        Interval::Hour6,
        Interval::Hour8,
        Interval::Hour12,
        Interval::Day1,
        Interval::Day3,
        Interval::Week1,
        Interval::Month1,
    ];

    /// Code used in archive paths and file names.
    pub fn code(&self) -> &'static str {
        match self {
            Interval::Sec1 => "1s",
            Interval::Min1 => "1m",
            Interval::Min3 => "3m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Min30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour2 => "2h",
            Interval::Hour4 => "4h",
            Interval::Hour6 => "6h",
            Interval::Hour8 => "8h",
            Interval::Hour12 => "12h",
            Interval::Day1 => "1d",
            Interval::Day3 => "3d",
            Interval::Week1 => "1w",
            Interval::Month1 => "1mo",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.code() == s)
            .ok_or_else(|| format!("unknown interval '{s}' (see `list intervals`)"))
    }
}

/// Calendar period of one archive file: a whole month or a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    Month { year: i32, month: u32 },
    Day(NaiveDate),
}

impl Period {
    /// First calendar day covered by this period.
    pub fn start_date(&self) -> NaiveDate {
        match *self {
            Period::Month { year, month } => {
                NaiveDate::from_ymd_opt(year, month, 1).expect("valid month period")
            }
            Period::Day(d) => d,
        }
    }

    /// Date stamp used in archive file names: `YYYY-MM` or `YYYY-MM-DD`.
    pub fn stamp(&self) -> String {
        match *self {
            Period::Month { year, month } => format!("{year:04}-{month:02}"),
            Period::Day(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    /// Archive directory granularity: `monthly` or `daily`.
    pub fn cadence(&self) -> &'static str {
        match self {
            Period::Month { .. } => "monthly",
            Period::Day(_) => "daily",
        }
    }
}

impl Ord for Period {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ascending by start date; a month sorts before a day with the
        // same start so boundary days land after the covering month.
        (self.start_date(), matches!(self, Period::Day(_)))
            .cmp(&(other.start_date(), matches!(other, Period::Day(_))))
    }
}

impl PartialOrd for Period {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stamp())
    }
}

/// The atomic fetch target.
///
/// Field order matches the expansion ordering contract (segment, kind,
/// symbol, interval, period), so the derived `Ord` is the unit ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    pub segment: VenueSegment,
    pub kind: DataKind,
    pub symbol: String,
    pub interval: Option<Interval>,
    pub period: Period,
}

impl WorkUnit {
    /// Canonical identity string, used as the progress-store key.
    ///
    /// `spot/klines/BTCUSDT/1h/2024-06`, or without the interval element
    /// for trade-like kinds: `um/trades/BTCUSDT/2024-06-05`.
    pub fn key(&self) -> String {
        match self.interval {
            Some(iv) => format!(
                "{}/{}/{}/{}/{}",
                self.segment, self.kind, self.symbol, iv, self.period
            ),
            None => format!("{}/{}/{}/{}", self.segment, self.kind, self.symbol, self.period),
        }
    }

    /// Archive file name: `{SYMBOL}-{interval|kind}-{stamp}.zip`.
    pub fn file_name(&self) -> String {
        let tag = match self.interval {
            Some(iv) => iv.code(),
            None => self.kind.archive_name(),
        };
        format!("{}-{}-{}.zip", self.symbol, tag, self.period.stamp())
    }

    /// Relative key on the archive host, e.g.
    /// `data/futures/um/monthly/klines/BTCUSDT/1h/BTCUSDT-1h-2024-06.zip`.
    pub fn remote_key(&self) -> String {
        let mut key = format!(
            "{}/{}/{}/{}",
            self.segment.path_prefix(),
            self.period.cadence(),
            self.kind.archive_name(),
            self.symbol
        );
        if let Some(iv) = self.interval {
            key.push('/');
            key.push_str(iv.code());
        }
        key.push('/');
        key.push_str(&self.file_name());
        key
    }

    /// Local destination: the remote key mirrored under `output_dir`.
    pub fn local_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(self.remote_key())
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
