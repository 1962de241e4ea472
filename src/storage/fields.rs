//! Line-oriented `field:value` records
//!
//! Every small state file (cache metadata, token bucket, breaker state, lock
//! owner) uses the same trivially inspectable format: one `field:value`
//! pair per line. Unknown fields are kept, malformed lines are skipped.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::error::Result;

/// Parsed `field:value` record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    values: BTreeMap<String, String>,
}

impl Fields {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a record. Lines without a `:` and blank lines are ignored;
    /// only the first `:` separates field from value.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let values = text
            .lines()
            .filter_map(|line| {
                let (field, value) = line.split_once(':')?;
                let field = field.trim();
                if field.is_empty() || field.starts_with('#') {
                    return None;
                }
                Some((field.to_string(), value.trim().to_string()))
            })
            .collect();
        Self { values }
    }

    /// Read and parse a record file, `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error for any I/O failure other than `NotFound`.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(Self::parse(&text))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn with(mut self, field: &str, value: impl ToString) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl ToString) {
        self.values.insert(field.to_string(), value.to_string());
    }

    pub fn remove(&mut self, field: &str) {
        self.values.remove(field);
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    /// Typed lookup; `None` when absent or unparseable.
    #[must_use]
    pub fn parse_field<T: FromStr>(&self, field: &str) -> Option<T> {
        self.get(field)?.parse().ok()
    }

    /// Render back to text, one field per line in sorted order.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (field, value) in &self.values {
            out.push_str(field);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}
