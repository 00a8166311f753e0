//! Terminal wire format: `name = value` input lines, `<`/`>` prefixed
//! output and echo lines.

use crate::compiler::parser::parse_value_literal;
use crate::events::Emission;
use crate::types::{SignalId, Timestamp, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("expected `name = value`, got `{0}`")]
    MissingSeparator(String),
    #[error("invalid signal reference `{0}`")]
    BadName(String),
    #[error("invalid value `{text}`: {reason}")]
    BadValue { text: String, reason: String },
}

/// One parsed input line: signals arrive by name or by numeric id.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Named { name: String, value: Value },
    Numbered { id: SignalId, value: Value },
}

pub fn parse_input_line(line: &str) -> Result<Input, WireError> {
    let (lhs, rhs) = line
        .split_once('=')
        .ok_or_else(|| WireError::MissingSeparator(line.to_string()))?;
    let lhs = lhs.trim();
    let rhs = rhs.trim();

    let value = parse_value_literal(rhs).map_err(|e| WireError::BadValue {
        text: rhs.to_string(),
        reason: e.to_string(),
    })?;

    if lhs.is_empty() {
        return Err(WireError::BadName(lhs.to_string()));
    }
    if lhs.bytes().all(|b| b.is_ascii_digit()) {
        let id = lhs
            .parse::<SignalId>()
            .map_err(|_| WireError::BadName(lhs.to_string()))?;
        return Ok(Input::Numbered { id, value });
    }
    if !valid_name(lhs) {
        return Err(WireError::BadName(lhs.to_string()));
    }
    Ok(Input::Named {
        name: lhs.to_string(),
        value,
    })
}

fn valid_name(name: &str) -> bool {
    name.split('.').all(|part| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// `< <timestamp_ms>,<name>,<signal_id>,<value_literal>` — the id column
/// is left empty when no mapping is loaded.
pub fn format_emission(e: &Emission) -> String {
    match e.id {
        Some(id) => format!("< {},{},{},{}", e.at, e.name, id, e.value),
        None => format!("< {},{},,{}", e.at, e.name, e.value),
    }
}

/// Echoed input, `>` marking the incoming direction.
pub fn format_echo(at: Timestamp, name: &str, id: Option<SignalId>, value: &Value) -> String {
    match id {
        Some(id) => format!("> {},{},{},{}", at, name, id, value),
        None => format!("> {},{},,{}", at, name, value),
    }
}
