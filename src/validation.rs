//! Structural validation of incoming commands.
//!
//! The schema is fixed: the kind must be one of [`CommandKind::all`], and each kind
//! has a set of required numeric parameters. Unknown extra fields are ignored so
//! clients can keep sending envelope bookkeeping (e.g. `block`) alongside the
//! command. Numbers may be JSON numbers or numeric strings.

use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::messages::{Command, CommandKind, RawCommand};

/// Why a command was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    description: String,
}

impl ValidationError {
    /// Creates a validation error with a human-readable description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl std::error::Error for ValidationError {}

/// Checks a raw command against the schema and returns the typed command.
pub fn validate(raw: &RawCommand) -> Result<Command, ValidationError> {
    let kind = CommandKind::parse(&raw.kind).ok_or_else(|| {
        let known: Vec<&str> = CommandKind::all().iter().map(|k| k.as_str()).collect();
        ValidationError::new(format!(
            "'{}' is not one of [{}]",
            raw.kind,
            known.join(", ")
        ))
    })?;

    match kind {
        CommandKind::SetVoltage => Ok(Command::SetVoltage {
            voltage: finite_number(&raw.params, "voltage")?,
        }),
        CommandKind::SetVoltageAndCheck => {
            let voltage = finite_number(&raw.params, "voltage")?;
            let max_error = finite_number(&raw.params, "max_error")?;
            if max_error < 0.0 {
                return Err(ValidationError::new(format!(
                    "'max_error' must be non-negative, got {max_error}"
                )));
            }
            let timeout = finite_number(&raw.params, "timeout")?;
            if timeout <= 0.0 {
                return Err(ValidationError::new(format!(
                    "'timeout' must be greater than 0, got {timeout}"
                )));
            }
            let timeout = Duration::try_from_secs_f64(timeout).map_err(|e| {
                ValidationError::new(format!("'timeout' is out of range: {e}"))
            })?;
            Ok(Command::SetVoltageAndCheck {
                voltage,
                max_error,
                timeout,
            })
        }
    }
}

fn finite_number(params: &Map<String, Value>, name: &str) -> Result<f64, ValidationError> {
    let value = params
        .get(name)
        .ok_or_else(|| ValidationError::new(format!("'{name}' is a required property")))?;

    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ValidationError::new(format!("'{name}' must be a number, got {value}")))?;

    if !number.is_finite() {
        return Err(ValidationError::new(format!(
            "'{name}' must be finite, got {number}"
        )));
    }
    Ok(number)
}
