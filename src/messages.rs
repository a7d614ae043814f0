//! Command and reply types exchanged between transports and the coordinator.
//!
//! Inbound messages arrive as [`RawCommand`] (`{kind, params}`) and are turned into
//! a typed [`Command`] by [`crate::validation::validate`]. Everything the coordinator
//! emits is a [`Reply`]; transports serialize it with [`Reply::to_meta`] into the
//! JSON meta shape clients expect:
//!
//! ```text
//! {type: "answer"|"reply", answer_type|reply_type, status?, voltage?, error?,
//!  error_code?, error_text_code?, description?}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::validation::ValidationError;

/// Rack block number attached to every answer.
pub const RACK_BLOCK: u32 = 1;

/// Key under which clients send the command kind.
pub const COMMAND_TYPE_KEY: &str = "command_type";

/// Command kinds understood by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Apply a setpoint, no convergence check.
    SetVoltage,
    /// Apply a setpoint and wait for the measured voltage to settle.
    SetVoltageAndCheck,
}

impl CommandKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::SetVoltage => "set_voltage",
            CommandKind::SetVoltageAndCheck => "set_voltage_and_check",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "set_voltage" => Some(CommandKind::SetVoltage),
            "set_voltage_and_check" => Some(CommandKind::SetVoltageAndCheck),
            _ => None,
        }
    }

    /// All recognized kinds.
    pub fn all() -> [CommandKind; 2] {
        [CommandKind::SetVoltage, CommandKind::SetVoltageAndCheck]
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unvalidated command as decoded by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommand {
    /// Command kind as sent by the client.
    pub kind: String,
    /// Remaining parameters, untyped.
    pub params: Map<String, Value>,
}

impl RawCommand {
    /// Creates a raw command from its parts.
    pub fn new(kind: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    /// Builds a raw command from a decoded JSON meta object.
    ///
    /// `command_type` becomes the kind; every other key is kept as a parameter.
    pub fn from_meta(meta: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut params) = meta else {
            return Err(ValidationError::new("message meta must be a JSON object"));
        };
        let kind = match params.remove(COMMAND_TYPE_KEY) {
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(ValidationError::new(format!(
                    "'{COMMAND_TYPE_KEY}' must be a string, got {other}"
                )))
            }
            None => {
                return Err(ValidationError::new(format!(
                    "'{COMMAND_TYPE_KEY}' is a required property"
                )))
            }
        };
        Ok(Self { kind, params })
    }

    /// Parses JSON text into a raw command.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        let meta: Value = serde_json::from_str(text)
            .map_err(|e| ValidationError::new(format!("message is not valid JSON: {e}")))?;
        Self::from_meta(meta)
    }
}

/// A validated, immutable command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Apply `voltage` and acknowledge.
    SetVoltage {
        /// Requested rack voltage.
        voltage: f64,
    },
    /// Apply `voltage`, then wait until `|measured - voltage| <= max_error`
    /// or `timeout` elapses.
    SetVoltageAndCheck {
        /// Requested rack voltage.
        voltage: f64,
        /// Allowed deviation.
        max_error: f64,
        /// Deadline measured from acceptance.
        timeout: Duration,
    },
}

impl Command {
    /// Kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::SetVoltage { .. } => CommandKind::SetVoltage,
            Command::SetVoltageAndCheck { .. } => CommandKind::SetVoltageAndCheck,
        }
    }

    /// Requested setpoint.
    pub fn voltage(&self) -> f64 {
        match self {
            Command::SetVoltage { voltage } | Command::SetVoltageAndCheck { voltage, .. } => {
                *voltage
            }
        }
    }
}

/// Which operation an answer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    /// Acknowledgement of `set_voltage`.
    SetVoltage,
    /// Outcome of `set_voltage_and_check`.
    SetVoltageAndCheck,
    /// Telemetry tick.
    GetVoltage,
}

impl AnswerKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerKind::SetVoltage => "set_voltage",
            AnswerKind::SetVoltageAndCheck => "set_voltage_and_check",
            AnswerKind::GetVoltage => "get_voltage",
        }
    }
}

impl From<CommandKind> for AnswerKind {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::SetVoltage => AnswerKind::SetVoltage,
            CommandKind::SetVoltageAndCheck => AnswerKind::SetVoltageAndCheck,
        }
    }
}

/// Terminal status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerStatus {
    /// Completed (and converged, for checked setpoints).
    Ok,
    /// Deadline elapsed before convergence. The setpoint stays applied.
    Timeout,
}

impl AnswerStatus {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerStatus::Ok => "ok",
            AnswerStatus::Timeout => "timeout",
        }
    }
}

/// Error codes shared with the clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Unexpected failure during execution or telemetry.
    AlgorithmError,
    /// A command arrived while another one was executing.
    ServerBusy,
    /// The command failed validation.
    IncorrectMessageParams,
}

impl ErrorCode {
    /// Numeric code.
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::AlgorithmError => 5,
            ErrorCode::ServerBusy => 8,
            ErrorCode::IncorrectMessageParams => 9,
        }
    }

    /// Text code. `ALGORITM_ERROR` is spelled as the clients expect it.
    pub fn text_code(&self) -> &'static str {
        match self {
            ErrorCode::AlgorithmError => "ALGORITM_ERROR",
            ErrorCode::ServerBusy => "SERVER_BUSY_ERROR",
            ErrorCode::IncorrectMessageParams => "INCORRECT_MESSAGE_PARAMS",
        }
    }
}

/// A reply or telemetry message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Result of a command or a telemetry reading.
    Answer {
        /// Operation the answer belongs to.
        kind: AnswerKind,
        /// Terminal status, absent for telemetry.
        status: Option<AnswerStatus>,
        /// Measured voltage, when relevant.
        voltage: Option<f64>,
        /// `measured - setpoint`, for checked setpoints.
        error: Option<f64>,
    },
    /// A rejected command or a caught fault.
    Error {
        /// Error classification.
        code: ErrorCode,
        /// Human-readable description.
        description: String,
    },
}

impl Reply {
    /// Telemetry tick carrying the latest reading.
    pub fn telemetry(voltage: f64) -> Self {
        Reply::Answer {
            kind: AnswerKind::GetVoltage,
            status: None,
            voltage: Some(voltage),
            error: None,
        }
    }

    /// Acknowledgement of a plain setpoint.
    pub fn setpoint_applied() -> Self {
        Reply::Answer {
            kind: AnswerKind::SetVoltage,
            status: Some(AnswerStatus::Ok),
            voltage: None,
            error: None,
        }
    }

    /// Outcome of a checked setpoint.
    pub fn convergence(status: AnswerStatus, measured: f64, setpoint: f64) -> Self {
        Reply::Answer {
            kind: AnswerKind::SetVoltageAndCheck,
            status: Some(status),
            voltage: Some(measured),
            error: Some(measured - setpoint),
        }
    }

    /// Busy rejection.
    pub fn busy() -> Self {
        Reply::Error {
            code: ErrorCode::ServerBusy,
            description: "HV server is busy".to_string(),
        }
    }

    /// Validation rejection.
    pub fn invalid(err: &ValidationError) -> Self {
        Reply::Error {
            code: ErrorCode::IncorrectMessageParams,
            description: err.description().to_string(),
        }
    }

    /// Caught execution or telemetry fault.
    pub fn algorithm_error(description: impl Into<String>) -> Self {
        Reply::Error {
            code: ErrorCode::AlgorithmError,
            description: description.into(),
        }
    }

    /// Error code, if this is an error reply.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Reply::Error { code, .. } => Some(*code),
            Reply::Answer { .. } => None,
        }
    }

    /// Answer kind, if this is an answer.
    pub fn answer_kind(&self) -> Option<AnswerKind> {
        match self {
            Reply::Answer { kind, .. } => Some(*kind),
            Reply::Error { .. } => None,
        }
    }

    /// Flat wire representation.
    pub fn to_wire(&self) -> ReplyMeta {
        match self {
            Reply::Answer {
                kind,
                status,
                voltage,
                error,
            } => ReplyMeta {
                message_type: "answer".to_string(),
                answer_type: Some(kind.as_str().to_string()),
                block: Some(RACK_BLOCK),
                status: status.map(|s| s.as_str().to_string()),
                voltage: *voltage,
                error: *error,
                ..ReplyMeta::default()
            },
            Reply::Error { code, description } => ReplyMeta {
                message_type: "reply".to_string(),
                reply_type: Some("error".to_string()),
                error_code: Some(code.code()),
                error_text_code: Some(code.text_code().to_string()),
                description: Some(description.clone()),
                ..ReplyMeta::default()
            },
        }
    }

    /// JSON meta object sent to clients.
    pub fn to_meta(&self) -> Value {
        serde_json::to_value(self.to_wire()).unwrap_or(Value::Null)
    }
}

/// Wire shape of a reply. Absent fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyMeta {
    /// "answer" or "reply".
    #[serde(rename = "type")]
    pub message_type: String,
    /// Answer kind for answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_type: Option<String>,
    /// Always "error" for error replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_type: Option<String>,
    /// Rack block number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<u32>,
    /// "ok" or "timeout".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Measured voltage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    /// Deviation from the setpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,
    /// Numeric error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
    /// Text error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text_code: Option<String>,
    /// Error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_command_from_meta_splits_kind() {
        let raw = RawCommand::from_meta(json!({
            "command_type": "set_voltage",
            "voltage": 1200.0,
            "block": "1"
        }))
        .unwrap();
        assert_eq!(raw.kind, "set_voltage");
        assert_eq!(raw.params.get("voltage"), Some(&json!(1200.0)));
        assert!(!raw.params.contains_key("command_type"));
    }

    #[test]
    fn test_raw_command_requires_command_type() {
        let err = RawCommand::from_meta(json!({"voltage": 1.0})).unwrap_err();
        assert!(err.description().contains("command_type"));

        let err = RawCommand::from_json("[1, 2]").unwrap_err();
        assert!(err.description().contains("object"));

        assert!(RawCommand::from_json("{not json").is_err());
    }

    #[test]
    fn test_telemetry_meta_shape() {
        let meta = Reply::telemetry(1499.5).to_meta();
        assert_eq!(
            meta,
            json!({"type": "answer", "answer_type": "get_voltage", "block": 1, "voltage": 1499.5})
        );
    }

    #[test]
    fn test_convergence_meta_reports_signed_error() {
        let meta = Reply::convergence(AnswerStatus::Timeout, 2980.0, 3000.0).to_meta();
        assert_eq!(meta["type"], "answer");
        assert_eq!(meta["answer_type"], "set_voltage_and_check");
        assert_eq!(meta["status"], "timeout");
        assert_eq!(meta["voltage"], 2980.0);
        assert_eq!(meta["error"], -20.0);
    }

    #[test]
    fn test_error_meta_shape() {
        let meta = Reply::busy().to_meta();
        assert_eq!(
            meta,
            json!({
                "type": "reply",
                "reply_type": "error",
                "error_code": 8,
                "error_text_code": "SERVER_BUSY_ERROR",
                "description": "HV server is busy"
            })
        );

        let meta = Reply::algorithm_error("boom").to_meta();
        assert_eq!(meta["error_code"], 5);
        assert_eq!(meta["error_text_code"], "ALGORITM_ERROR");
    }

    #[test]
    fn test_set_voltage_ack_has_no_voltage() {
        let wire = Reply::setpoint_applied().to_wire();
        assert_eq!(wire.status.as_deref(), Some("ok"));
        assert!(wire.voltage.is_none());
        assert!(wire.error.is_none());
    }

    #[test]
    fn test_command_kind_names() {
        for kind in CommandKind::all() {
            assert_eq!(CommandKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::parse("get_voltage"), None);
    }
}
