// ABOUTME: Index tracker - persisted per (source alias, table) watermarks
// ABOUTME: Defines IndexValue and the IndexStore trait with PostgreSQL and in-memory stores

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::source::SqlValue;

pub use memory::MemoryIndexStore;
pub use postgres::PostgresIndexStore;

/// A high-water mark of an incremental index.
///
/// Values are persisted as text and parsed back into the most specific variant. Numbers
/// compare numerically and timestamps chronologically; anything else (dates, zoned
/// timestamps, strings) compares as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    Integer(i64),
    /// Non-integral numbers. Integral values are always `Integer`.
    Decimal(Decimal),
    Timestamp(NaiveDateTime),
    Text(String),
}

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

impl IndexValue {
    /// Parse a persisted or source-reported value.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return IndexValue::Integer(i);
        }
        if let Ok(d) = Decimal::from_str(trimmed) {
            return IndexValue::decimal(d);
        }
        TIMESTAMP_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
            .map(IndexValue::Timestamp)
            .unwrap_or_else(|| IndexValue::Text(text.to_string()))
    }

    fn decimal(d: Decimal) -> Self {
        match d.fract().is_zero().then(|| d.to_i64()).flatten() {
            Some(i) => IndexValue::Integer(i),
            None => IndexValue::Decimal(d.normalize()),
        }
    }

    /// Convert a value read from a source. NULL means the source reported no bound.
    pub fn from_sql(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::Null => None,
            SqlValue::Int(i) => Some(IndexValue::Integer(*i)),
            SqlValue::UInt(u) => Some(match i64::try_from(*u) {
                Ok(i) => IndexValue::Integer(i),
                Err(_) => IndexValue::decimal(Decimal::from(*u)),
            }),
            // Shortest round-trip form, so the literal selects the same double again
            SqlValue::Float(f) => Some(IndexValue::parse(&f.to_string())),
            SqlValue::Timestamp(ts) => Some(IndexValue::Timestamp(*ts)),
            SqlValue::Text(s) => Some(IndexValue::parse(s)),
            other => other.to_text().map(IndexValue::Text),
        }
    }

    /// Text stored in the tracking table.
    pub fn as_text(&self) -> String {
        match self {
            IndexValue::Integer(i) => i.to_string(),
            IndexValue::Decimal(d) => d.to_string(),
            IndexValue::Timestamp(ts) => ts.format(TIMESTAMP_FORMATS[0]).to_string(),
            IndexValue::Text(s) => s.clone(),
        }
    }

    /// SQL literal for use in a window predicate: bare number or quoted string.
    pub fn to_sql_literal(&self) -> String {
        match self {
            IndexValue::Integer(_) | IndexValue::Decimal(_) => self.as_text(),
            IndexValue::Timestamp(_) | IndexValue::Text(_) => {
                crate::utils::quote_literal(&self.as_text())
            }
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            IndexValue::Integer(i) => Some(Decimal::from(*i)),
            IndexValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Integer(a), IndexValue::Integer(b)) => a.cmp(b),
            (IndexValue::Timestamp(a), IndexValue::Timestamp(b)) => a.cmp(b),
            _ => match (self.as_decimal(), other.as_decimal()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => self.as_text().cmp(&other.as_text()),
            },
        }
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// Persisted watermarks keyed by (source alias, table id).
///
/// `set` is an upsert: writing the same pair twice overwrites. Several aliases may feed the
/// same destination table; each keeps its own watermark.
#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn get(&self, source_alias: &str, table_id: &str) -> Result<Option<IndexValue>>;

    /// Record a watermark. Only called after the guarded load has committed.
    async fn set(&self, source_alias: &str, table_id: &str, value: &IndexValue) -> Result<()>;
}
