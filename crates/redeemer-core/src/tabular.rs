//! Minimal RFC 4180 CSV reading and writing for ledger and export files.
//!
//! Fields are quoted only when they contain a comma, quote, or line break;
//! embedded quotes are doubled. The reader accepts a UTF-8 BOM, CRLF line
//! endings and quoted line breaks.

use std::fmt::Write;

/// Append one CSV record (with trailing newline) to `out`.
pub fn write_record<S: AsRef<str>>(out: &mut String, fields: &[S]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let field = field.as_ref();
        if needs_quoting(field) {
            let _ = write!(out, "\"{}\"", field.replace('"', "\"\""));
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

fn needs_quoting(field: &str) -> bool {
    field.contains([',', '"', '\n', '\r'])
}

/// Parse CSV text into records. Blank lines are skipped.
#[must_use]
pub fn parse_records(text: &str) -> Vec<Vec<String>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut field_started = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if !field_started => {
                in_quotes = true;
                field_started = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                field_started = true;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                finish_record(&mut records, &mut record, &mut field, field_started);
                field_started = false;
            }
            _ => {
                field.push(c);
                field_started = true;
            }
        }
    }
    finish_record(&mut records, &mut record, &mut field, field_started);
    records
}

fn finish_record(
    records: &mut Vec<Vec<String>>,
    record: &mut Vec<String>,
    field: &mut String,
    field_started: bool,
) {
    if !field_started && record.is_empty() && field.is_empty() {
        return;
    }
    record.push(std::mem::take(field));
    records.push(std::mem::take(record));
}

/// Header-addressed view over parsed records.
#[derive(Debug, Clone)]
pub struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Parse text whose first record is the header. Header names are
    /// compared case-insensitively.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut records = parse_records(text).into_iter();
        let header = records.next().unwrap_or_default();
        Self::from_parts(header, records.collect())
    }

    /// Like [`Table::parse`], but when no field of the first record equals
    /// `marker` the text is headerless and `fallback` names its columns.
    #[must_use]
    pub fn parse_with_fallback(text: &str, marker: &str, fallback: &[&str]) -> Self {
        let mut records = parse_records(text);
        let has_header = records
            .first()
            .is_some_and(|first| first.iter().any(|f| f.trim().eq_ignore_ascii_case(marker)));
        if has_header {
            let header = records.remove(0);
            Self::from_parts(header, records)
        } else {
            let header = fallback.iter().map(|h| (*h).to_string()).collect();
            Self::from_parts(header, records)
        }
    }

    fn from_parts(header: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            header: header
                .into_iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
            rows,
        }
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    /// Iterate rows as accessors keyed by header name.
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |fields| Row {
            table: self,
            fields,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One data row of a [`Table`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    table: &'a Table,
    fields: &'a [String],
}

impl<'a> Row<'a> {
    /// Field under the first of `names` present in the header; empty when absent.
    #[must_use]
    pub fn get(&self, names: &[&str]) -> &'a str {
        names
            .iter()
            .find_map(|name| self.table.column(name))
            .and_then(|idx| self.fields.get(idx))
            .map_or("", String::as_str)
    }
}
