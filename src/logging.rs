//! Tracing subscriber setup.
//!
//! Console output carries file and line numbers. When `application.log_file` is
//! set, the same events are appended to that file without ANSI colors.
//! `RUST_LOG` overrides the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::ApplicationConfig;
use crate::error::AppResult;

/// Installs the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed (tests call this
/// repeatedly), `Ok(true)` when this call installed it.
pub fn init(app: &ApplicationConfig) -> AppResult<bool> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hv_rack={}", app.log_level, app.log_level)));

    let console = fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_target(false);

    let file = match &app.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(Mutex::new(handle))
                    .boxed(),
            )
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .is_ok();
    Ok(installed)
}
