//! Metadata header parsing and serialization.
//!
//! A page file is an optional header block followed by the raw markdown
//! body:
//!
//! ```text
//! ---
//! title: Deployment Guide
//! reviewed: true
//! tags: [ops, infra]
//! last_updated: 2025-11-03 14:22:08.114532
//! ---
//!
//! # Deployment Guide
//! ...
//! ```
//!
//! The grammar is deliberately small: a `---` delimiter line, `key: value`
//! pairs, a closing `---` line, then the body. Values are coerced to typed
//! scalars (bool, integer, float, date, datetime, list-of-string, string)
//! and serialized back in the same form, so a parse/serialize round trip
//! preserves both key order and value types. A file that does not start
//! with the delimiter is all body.

use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub const DELIMITER: &str = "---";

/// A typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    List(Vec<String>),
}

impl MetaValue {
    /// Coerce a raw header value into its typed form.
    pub fn parse(raw: &str) -> MetaValue {
        let s = raw.trim();

        if s == "true" {
            return MetaValue::Bool(true);
        }
        if s == "false" {
            return MetaValue::Bool(false);
        }
        if let Ok(n) = s.parse::<i64>() {
            return MetaValue::Int(n);
        }
        if let Ok(f) = s.parse::<f64>() {
            if s.contains('.') || s.contains('e') || s.contains('E') {
                return MetaValue::Float(f);
            }
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return MetaValue::Date(d);
        }
        for format in [
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%d %H:%M",
            "%Y-%m-%dT%H:%M",
        ] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                return MetaValue::DateTime(dt);
            }
        }
        if s.starts_with('[') && s.ends_with(']') {
            let inner = &s[1..s.len() - 1];
            let items: Vec<String> = if inner.trim().is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|item| unquote(item.trim()).to_string()).collect()
            };
            return MetaValue::List(items);
        }

        MetaValue::Str(unquote(s).to_string())
    }

    /// HTML input type for form rendering of this value.
    pub fn input_type(&self) -> &'static str {
        match self {
            MetaValue::Bool(_) => "checkbox",
            MetaValue::DateTime(_) => "datetime-local",
            MetaValue::Date(_) => "date",
            MetaValue::Int(_) | MetaValue::Float(_) => "number",
            MetaValue::Str(_) | MetaValue::List(_) => "text",
        }
    }

    /// Value formatted for an HTML form input.
    pub fn form_value(&self) -> String {
        match self {
            MetaValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M").to_string(),
            MetaValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            MetaValue::List(items) => items.join(", "),
            other => other.to_string(),
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            MetaValue::DateTime(dt) => Some(*dt),
            MetaValue::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    /// Header serialization form; `MetaValue::parse` of the output yields
    /// the same value back.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Str(s) => write!(f, "{}", s),
            MetaValue::Int(n) => write!(f, "{}", n),
            MetaValue::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            MetaValue::Bool(b) => write!(f, "{}", b),
            MetaValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            MetaValue::DateTime(dt) => {
                if dt.format("%.6f").to_string() == ".000000" {
                    write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S"))
                } else {
                    write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.6f"))
                }
            }
            MetaValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

fn unquote(s: &str) -> &str {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[s.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[s.len() - 1] == b'\'')
        {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// An order-preserving metadata mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, MetaValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: MetaValue) {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, MetaValue)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, MetaValue)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// Parse a raw page file into `(metadata, body)`.
///
/// A missing or unterminated header block means the whole input is body.
/// Header lines without a colon are skipped.
pub fn parse(raw: &str) -> (Metadata, String) {
    let mut lines = raw.lines();

    match lines.next() {
        Some(line) if line.trim_end() == DELIMITER => {}
        _ => return (Metadata::new(), raw.to_string()),
    }

    let mut metadata = Metadata::new();
    let mut closed = false;

    for line in lines.by_ref() {
        if line.trim_end() == DELIMITER {
            closed = true;
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                metadata.insert(key, MetaValue::parse(value));
            }
        }
    }

    if !closed {
        return (Metadata::new(), raw.to_string());
    }

    let mut body: Vec<&str> = lines.collect();
    // The serializer emits one blank separator line after the header.
    if body.first().is_some_and(|line| line.trim().is_empty()) {
        body.remove(0);
    }

    (metadata, body.join("\n"))
}

/// Serialize metadata + body back into the on-disk form.
pub fn serialize(metadata: &Metadata, body: &str) -> String {
    if metadata.is_empty() {
        return body.to_string();
    }

    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');
    for (key, value) in metadata.iter() {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&value.to_string());
        out.push('\n');
    }
    out.push_str(DELIMITER);
    out.push_str("\n\n");
    out.push_str(body);
    out
}

/// Read only the metadata header of a file, stopping at the closing
/// delimiter without reading the body. Returns an empty mapping for files
/// with no header.
///
/// This is the batch-read path behind sidebar titles and widget dates; on
/// large pages it avoids pulling the full body into memory.
pub fn read_header(path: &Path) -> std::io::Result<Metadata> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim_end() != DELIMITER {
        return Ok(Metadata::new());
    }

    let mut metadata = Metadata::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            // Unterminated header: treat as no metadata, same as parse().
            return Ok(Metadata::new());
        }
        if line.trim_end() == DELIMITER {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                metadata.insert(key, MetaValue::parse(value));
            }
        }
    }

    Ok(metadata)
}
