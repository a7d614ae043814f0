//! Custom error types for the application.
//!
//! This module defines the primary error type, `RackError`, for the whole server.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur, from configuration problems to instrument
//! link failures and malformed client messages.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: load failures from `figment` and semantic
//!   validation failures after loading.
//! - **`Io`**, **`Json`**, **`Csv`**: wrapped lower-level errors, usually from the
//!   persistence sink, the calibration loader or the transports.
//! - **`Instrument`** / **`InstrumentConnect`**: errors from the hardware backend.
//!   `InstrumentConnect` is the one fatal condition at startup.
//! - **`Validation`**: a malformed command. It is turned into an error reply for
//!   the sender and never terminates anything. Busy rejections are replies only
//!   (see [`crate::messages::Reply::busy`]) and have no error variant.
//! - **`FeatureNotEnabled`**: the requested functionality was not compiled in
//!   (e.g. real hardware without `--features instrument_visa`).
//!
//! By using `#[from]`, `RackError` can be created from underlying error types,
//! so `?` works throughout the crate.

use thiserror::Error;

use crate::validation::ValidationError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RackError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum RackError {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV/TSV read or write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Communication with an instrument failed.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// An instrument link could not be opened.
    #[error("Failed to connect to '{resource}': {reason}")]
    InstrumentConnect {
        /// Resource string of the instrument (e.g. "GPIB::20::INSTR").
        resource: String,
        /// Underlying failure.
        reason: String,
    },

    /// A binary envelope was malformed.
    #[error("Envelope framing error: {0}")]
    Envelope(String),

    /// WebSocket protocol failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// A command failed structural validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The operation was interrupted by shutdown.
    #[error("Operation cancelled")]
    Cancelled,

    /// `start` was called on a coordinator that already started.
    #[error("Coordinator already started")]
    AlreadyStarted,

    /// Calibration data could not be fitted.
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// A compile-time feature required for this operation is missing.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for RackError {
    fn from(err: figment::Error) -> Self {
        RackError::Config(Box::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RackError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RackError::WebSocket(Box::new(err))
    }
}
