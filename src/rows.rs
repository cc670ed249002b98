//! CSV decoding for the upstream's tabular files.
//!
//! The upstream publishes a modest dialect: UTF-8, one header line, `,`
//! separator, `"` as the only quote character, no doubled-quote escaping.
//! Records are exposed by header name; a row shorter than the header yields
//! empty strings for the missing columns and extra columns are ignored.
//! Decoding streams over the member text, no pre-pass.

use std::sync::Arc;

use anyhow::Result;

/// A lazily decoded CSV table. Iterate to get [`Row`]s; blank and
/// whitespace-only lines after the header are skipped.
pub struct Table<'a> {
    headers: Arc<Vec<String>>,
    records: csv::StringRecordsIntoIter<&'a [u8]>,
}

/// One decoded record, addressed by header token.
pub struct Row {
    headers: Arc<Vec<String>>,
    record: csv::StringRecord,
}

impl<'a> Table<'a> {
    /// Start decoding `text`. Empty input yields a table with no rows.
    pub fn parse(text: &'a str) -> Result<Table<'a>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b',')
            .quote(b'"')
            .double_quote(false)
            .flexible(true)
            .trim(csv::Trim::None)
            .from_reader(text.as_bytes());

        let headers = if text.trim().is_empty() {
            Vec::new()
        } else {
            reader
                .headers()?
                .iter()
                .map(|h| h.trim().to_string())
                .collect()
        };

        Ok(Table {
            headers: Arc::new(headers),
            records: reader.into_records(),
        })
    }
}

impl Iterator for Table<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        loop {
            match self.records.next()? {
                Ok(record) => {
                    if record.iter().all(|f| f.trim().is_empty()) {
                        continue;
                    }
                    return Some(Row {
                        headers: Arc::clone(&self.headers),
                        record,
                    });
                }
                // Tolerant dialect: a record the reader cannot shape is dropped.
                Err(_) => continue,
            }
        }
    }
}

impl Row {
    /// Field value for `header`, trimmed. Missing columns yield `""`.
    pub fn get(&self, header: &str) -> &str {
        self.headers
            .iter()
            .position(|h| h == header)
            .and_then(|idx| self.record.get(idx))
            .map(str::trim)
            .unwrap_or("")
    }
}

/// Coerce the mandatory `price` column. Unparseable input is the sentinel
/// zero, matching the upstream feed's established behavior.
pub fn price_or_zero(field: &str) -> f64 {
    field.trim().parse::<f64>().unwrap_or(0.0)
}

/// Coerce one of the optional price columns. Empty or unparseable is absent.
pub fn optional_price(field: &str) -> Option<f64> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}
