//! Date helpers.
//!
//! Dates are ISO `YYYY-MM-DD` strings throughout the pipeline, compared and
//! sorted lexically. "Today" is the date portion of the current instant in
//! the target locale, taken as a fixed UTC+1 offset; DST is deliberately
//! ignored since the upstream publishes by calendar date.

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveDate, Utc};

const LOCAL_OFFSET_SECS: i32 = 3600;

/// Today's date in the target locale as `YYYY-MM-DD`.
pub fn today() -> String {
    let offset = FixedOffset::east_opt(LOCAL_OFFSET_SECS).expect("static offset");
    Utc::now().with_timezone(&offset).date_naive().to_string()
}

/// Validate a `YYYY-MM-DD` string, returning it unchanged.
pub fn validate(date: &str) -> Result<&str> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", date))?;
    Ok(date)
}
