//! Transport header parsing.
//!
//! Headers arrive as one environment string of newline-delimited `KEY=VALUE`
//! lines, e.g. the value of `OTEL_EXPORTER_OTLP_HEADERS`.

use crate::error::ConfigError;
use reqwest::header::{HeaderName, HeaderValue};
use std::str::FromStr;

/// Parsed transport headers, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderConfig {
    entries: Vec<(String, String)>,
}

impl HeaderConfig {
    /// Parses newline-delimited `KEY=VALUE` lines.
    ///
    /// Each line is split on its first `=`, so values may contain `=`.
    /// Blank lines are skipped. A repeated name keeps its last value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedHeaderLine`] with the zero-based line
    /// index for a line without `=`, or whose name or value is not a valid
    /// HTTP header.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut headers = Self::default();

        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (name, value) = line
                .split_once('=')
                .ok_or(ConfigError::MalformedHeaderLine { index })?;
            let (name, value) = (name.trim(), value.trim());
            if HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(value).is_err()
            {
                return Err(ConfigError::MalformedHeaderLine { index });
            }

            headers.insert(name, value);
        }

        Ok(headers)
    }

    /// Sets a header, replacing any previous value for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Returns the value for `name`, if set.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over `(name, value)` pairs in input order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no headers are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromStr for HeaderConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
