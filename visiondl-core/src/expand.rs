//! Matrix expansion — turns a `BatchSpec` selection into an explicit,
//! deduplicated, deterministically ordered list of work units.
//!
//! All validity rules (interval requirements, futures-only kinds, date
//! range sanity) are checked here, before any network activity. A
//! rejected spec is a configuration error, never a runtime failure.

use crate::domain::{DataKind, Interval, Period, VenueSegment, WorkUnit};
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// One requested data kind, optionally paired with intervals.
///
/// Intervals are required for candle-like kinds and ignored for
/// trade-like kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KindSelection {
    pub kind: DataKind,
    #[serde(default)]
    pub intervals: Vec<Interval>,
}

/// The user-level selection: everything the expander needs to produce
/// the unit list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSpec {
    pub segment: VenueSegment,
    pub kinds: Vec<KindSelection>,
    pub symbols: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BatchSpec {
    /// Deterministic fingerprint of the selection, recorded in the
    /// progress file so a resumed run can be matched to its spec.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).expect("BatchSpec must serialize");
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }
}

/// Validation failure for a `BatchSpec`.
#[derive(Debug, Error, PartialEq)]
pub enum ExpandError {
    #[error("no symbols requested")]
    NoSymbols,

    #[error("no data kinds requested")]
    NoKinds,

    #[error("start date {start} is after end date {end}")]
    InvertedRange { start: NaiveDate, end: NaiveDate },

    #[error("data kind '{kind}' requires at least one interval")]
    MissingInterval { kind: DataKind },

    #[error("data kind '{kind}' is only published for futures segments")]
    FuturesOnlyKind { kind: DataKind },
}

/// Expand a spec into the ordered, deduplicated unit sequence.
///
/// Ordering is (segment, kind, symbol, interval, period ascending), so
/// two calls over the same spec always produce the identical sequence.
pub fn expand(spec: &BatchSpec) -> Result<Vec<WorkUnit>, ExpandError> {
    validate(spec)?;

    let periods = periods_for_range(spec.start, spec.end);
    let mut units: BTreeSet<WorkUnit> = BTreeSet::new();

    for sel in &spec.kinds {
        // Trade-like kinds carry no interval; any supplied ones are ignored.
        let intervals: Vec<Option<Interval>> = if sel.kind.is_trade_like() {
            vec![None]
        } else {
            let mut ivs: Vec<Interval> = sel.intervals.clone();
            ivs.sort();
            ivs.dedup();
            ivs.into_iter().map(Some).collect()
        };

        for symbol in &spec.symbols {
            for &interval in &intervals {
                for &period in &periods {
                    units.insert(WorkUnit {
                        segment: spec.segment,
                        kind: sel.kind,
                        symbol: symbol.clone(),
                        interval,
                        period,
                    });
                }
            }
        }
    }

    Ok(units.into_iter().collect())
}

fn validate(spec: &BatchSpec) -> Result<(), ExpandError> {
    if spec.symbols.is_empty() {
        return Err(ExpandError::NoSymbols);
    }
    if spec.kinds.is_empty() {
        return Err(ExpandError::NoKinds);
    }
    if spec.start > spec.end {
        return Err(ExpandError::InvertedRange {
            start: spec.start,
            end: spec.end,
        });
    }
    for sel in &spec.kinds {
        if sel.kind.is_candle_like() && sel.intervals.is_empty() {
            return Err(ExpandError::MissingInterval { kind: sel.kind });
        }
        if sel.kind.is_futures_only() && !spec.segment.is_futures() {
            return Err(ExpandError::FuturesOnlyKind { kind: sel.kind });
        }
    }
    Ok(())
}

/// Period selection for `[start, end]`: a fully contained calendar month
/// becomes one monthly archive; a partial boundary month is enumerated
/// as daily archives clipped to the range. Both boundaries are treated
/// symmetrically.
pub fn periods_for_range(start: NaiveDate, end: NaiveDate) -> Vec<Period> {
    let mut periods = Vec::new();
    let mut cursor = first_of_month(start);

    while cursor <= end {
        let month_start = cursor;
        let month_end = last_of_month(cursor);

        if start <= month_start && month_end <= end {
            periods.push(Period::Month {
                year: cursor.year(),
                month: cursor.month(),
            });
        } else {
            let lo = month_start.max(start);
            let hi = month_end.min(end);
            let mut day = lo;
            while day <= hi {
                periods.push(Period::Day(day));
                day = day.checked_add_days(Days::new(1)).expect("date overflow");
            }
        }

        cursor = next_month(cursor);
    }

    periods
}

fn first_of_month(d: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(d.year(), d.month(), 1).expect("valid first of month")
}

fn next_month(d: NaiveDate) -> NaiveDate {
    let (y, m) = if d.month() == 12 {
        (d.year() + 1, 1)
    } else {
        (d.year(), d.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1).expect("valid next month")
}

fn last_of_month(d: NaiveDate) -> NaiveDate {
    next_month(d).pred_opt().expect("valid last of month")
}
