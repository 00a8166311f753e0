//! Capture log: the received input stream as CSV
//! (`timestamp_ms,name,id,value_literal`), timestamps relative to capture
//! start. Replay feeds the same records back through the driver at a
//! scaled rate.

use crate::compiler::parser::parse_value_literal;
use crate::types::{SignalId, Timestamp, Value};
use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("line {line}: expected 4 fields, got {got}")]
    FieldCount { line: usize, got: usize },
    #[error("line {line}: invalid timestamp `{text}`")]
    BadTimestamp { line: usize, text: String },
    #[error("line {line}: invalid signal id `{text}`")]
    BadId { line: usize, text: String },
    #[error("line {line}: {reason}")]
    BadValue { line: usize, reason: String },
    #[error("line {line}: unterminated quoted field")]
    UnterminatedQuote { line: usize },
}

/// One replayable record.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureRecord {
    pub at: Timestamp,
    pub name: String,
    pub id: Option<SignalId>,
    pub value: Value,
}

// ─── Writer ───────────────────────────────────────────────────

pub struct CaptureWriter<W: Write> {
    out: W,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn record(&mut self, rec: &CaptureRecord) -> io::Result<()> {
        let id = rec.id.map(|i| i.to_string()).unwrap_or_default();
        writeln!(
            self.out,
            "{},{},{},{}",
            rec.at,
            csv_escape(&rec.name),
            id,
            csv_escape(&rec.value.to_string())
        )
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

// ─── Reader ───────────────────────────────────────────────────

pub fn read_capture(text: &str) -> Result<Vec<CaptureRecord>, CaptureError> {
    let mut records = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let fields = split_csv(raw, line)?;
        if fields.len() != 4 {
            return Err(CaptureError::FieldCount {
                line,
                got: fields.len(),
            });
        }
        let at = fields[0]
            .parse::<Timestamp>()
            .map_err(|_| CaptureError::BadTimestamp {
                line,
                text: fields[0].clone(),
            })?;
        let id = if fields[2].is_empty() {
            None
        } else {
            Some(fields[2].parse::<SignalId>().map_err(|_| CaptureError::BadId {
                line,
                text: fields[2].clone(),
            })?)
        };
        let value =
            parse_value_literal(&fields[3]).map_err(|e| CaptureError::BadValue {
                line,
                reason: e.to_string(),
            })?;
        records.push(CaptureRecord {
            at,
            name: fields[1].clone(),
            id,
            value,
        });
    }
    Ok(records)
}

// ─── CSV escaping (RFC 4180 double quotes) ────────────────────

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        let mut out = String::with_capacity(field.len() + 2);
        out.push('"');
        for c in field.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
        out
    } else {
        field.to_string()
    }
}

fn split_csv(line: &str, line_no: usize) -> Result<Vec<String>, CaptureError> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    loop {
        match chars.peek() {
            Some('"') => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') => {
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                field.push('"');
                            } else {
                                break;
                            }
                        }
                        Some(c) => field.push(c),
                        None => {
                            return Err(CaptureError::UnterminatedQuote { line: line_no })
                        }
                    }
                }
            }
            _ => loop {
                match chars.peek() {
                    Some(',') | None => break,
                    Some(_) => field.push(chars.next().unwrap()),
                }
            },
        }
        match chars.next() {
            Some(',') => fields.push(std::mem::take(&mut field)),
            _ => {
                fields.push(std::mem::take(&mut field));
                return Ok(fields);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(at: Timestamp, name: &str, id: Option<SignalId>, value: Value) -> CaptureRecord {
        CaptureRecord {
            at,
            name: name.to_string(),
            id,
            value,
        }
    }

    #[test]
    fn round_trips_plain_records() {
        let records = vec![
            rec(0, "phone.call", Some(3), Value::Str("active".into())),
            rec(150, "wipers.front.on", None, Value::Bool(true)),
            rec(2000, "engine.rpm", Some(9), Value::Int(-500)),
        ];
        let mut buf = Vec::new();
        let mut writer = CaptureWriter::new(&mut buf);
        for r in &records {
            writer.record(r).unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(read_capture(&text).unwrap(), records);
    }

    #[test]
    fn escapes_values_containing_commas_and_quotes() {
        let record = rec(5, "nav.note", None, Value::Str("turn, then \"stop\"".into()));
        let mut buf = Vec::new();
        CaptureWriter::new(&mut buf).record(&record).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\"'turn, then \"\"stop\"\"'\""));
        assert_eq!(read_capture(&text).unwrap(), vec![record]);
    }

    #[test]
    fn round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.csv");
        let records = vec![rec(0, "a", None, Value::Int(1)), rec(7, "b", Some(2), Value::Float(1.5))];
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut writer = CaptureWriter::new(file);
            for r in &records {
                writer.record(r).unwrap();
            }
            writer.flush().unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(read_capture(&text).unwrap(), records);
    }

    #[test]
    fn reports_malformed_lines() {
        assert!(matches!(
            read_capture("0,a,1\n"),
            Err(CaptureError::FieldCount { line: 1, got: 3 })
        ));
        assert!(matches!(
            read_capture("x,a,1,2\n"),
            Err(CaptureError::BadTimestamp { .. })
        ));
        assert!(matches!(
            read_capture("0,a,nope,2\n"),
            Err(CaptureError::BadId { .. })
        ));
        assert!(matches!(
            read_capture("0,a,1,\"'x\n"),
            Err(CaptureError::UnterminatedQuote { .. })
        ));
    }
}
