//! Cache key generation and management

use chrono::{DateTime, Datelike};
use std::fmt;

/// A structured cache key that can be converted to a string
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// Payments of an address received during one ISO week
    PaymentWeek { address: String, year: i32, week: u32 },
    /// Balance summary of an address
    Balance(String),
}

impl CacheKey {
    /// Week bucket holding a payment made at `timestamp`
    pub fn payment_week(address: &str, timestamp: i64) -> Self {
        let (year, week) = DateTime::from_timestamp(timestamp, 0)
            .map(|dt| {
                let iso = dt.iso_week();
                (iso.year(), iso.week())
            })
            .unwrap_or((1970, 1));
        Self::PaymentWeek {
            address: address.to_string(),
            year,
            week,
        }
    }

    pub fn balance(address: &str) -> Self {
        Self::Balance(address.to_string())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PaymentWeek { address, year, week } => {
                write!(f, "{}:payments:{}:{:02}", address, year, week)
            }
            Self::Balance(address) => write!(f, "{}:balance", address),
        }
    }
}
