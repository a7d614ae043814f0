//! VISA transport for [`ScpiLink`] (GPIB/USB/LAN).
//!
//! VISA calls are blocking, so every operation runs on Tokio's blocking pool.
//! Without the `instrument_visa` feature, [`open_link`] fails with
//! [`RackError::FeatureNotEnabled`].

use super::real::ScpiLink;
use crate::error::{AppResult, RackError};

#[cfg(feature = "instrument_visa")]
pub use enabled::VisaLink;

/// Opens `resource` and returns it as a boxed link. Failure is fatal at startup.
#[cfg(feature = "instrument_visa")]
pub async fn open_link(resource: &str, io_timeout_ms: u64) -> AppResult<Box<dyn ScpiLink>> {
    let link = VisaLink::open(resource, std::time::Duration::from_millis(io_timeout_ms)).await?;
    Ok(Box::new(link))
}

/// Opens `resource` and returns it as a boxed link. Failure is fatal at startup.
#[cfg(not(feature = "instrument_visa"))]
pub async fn open_link(resource: &str, io_timeout_ms: u64) -> AppResult<Box<dyn ScpiLink>> {
    let _ = (resource, io_timeout_ms);
    Err(RackError::FeatureNotEnabled("instrument_visa".to_string()))
}

#[cfg(feature = "instrument_visa")]
mod enabled {
    use async_trait::async_trait;
    use std::ffi::CString;
    use std::io::{BufRead, BufReader, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::debug;
    use visa_rs::prelude::*;

    use super::ScpiLink;
    use crate::error::{AppResult, RackError};

    struct Session {
        // The resource manager owns every session it opened.
        _rm: DefaultRM,
        instrument: Instrument,
    }

    /// One opened VISA resource.
    pub struct VisaLink {
        resource: String,
        session: Arc<Mutex<Session>>,
    }

    impl VisaLink {
        /// Opens `resource` with the given I/O timeout.
        pub async fn open(resource: &str, timeout: Duration) -> AppResult<Self> {
            let name = resource.to_string();
            let session = tokio::task::spawn_blocking(move || {
                let connect_err = |reason: String| RackError::InstrumentConnect {
                    resource: name.clone(),
                    reason,
                };
                let rm = DefaultRM::new().map_err(|e| connect_err(e.to_string()))?;
                let expr = CString::new(name.as_str())
                    .map_err(|e| connect_err(e.to_string()))?
                    .into();
                let id = rm.find_res(&expr).map_err(|e| connect_err(e.to_string()))?;
                let instrument = rm
                    .open(&id, AccessMode::NO_LOCK, timeout)
                    .map_err(|e| connect_err(e.to_string()))?;
                Ok::<_, RackError>(Session { _rm: rm, instrument })
            })
            .await
            .map_err(|e| RackError::Instrument(format!("VISA open task failed: {e}")))??;

            debug!(resource, timeout_ms = timeout.as_millis() as u64, "VISA resource opened");
            Ok(Self {
                resource: resource.to_string(),
                session: Arc::new(Mutex::new(session)),
            })
        }

        async fn blocking<T, F>(&self, op: F) -> AppResult<T>
        where
            T: Send + 'static,
            F: FnOnce(&Instrument) -> std::io::Result<T> + Send + 'static,
        {
            let session = Arc::clone(&self.session);
            let resource = self.resource.clone();
            tokio::task::spawn_blocking(move || {
                let guard = session.lock().unwrap_or_else(|p| p.into_inner());
                op(&guard.instrument)
                    .map_err(|e| RackError::Instrument(format!("{resource}: {e}")))
            })
            .await
            .map_err(|e| RackError::Instrument(format!("VISA I/O task failed: {e}")))?
        }
    }

    #[async_trait]
    impl ScpiLink for VisaLink {
        async fn write(&mut self, command: &str) -> AppResult<()> {
            let line = format!("{command}\n");
            self.blocking(move |instrument| {
                let mut writer = instrument;
                writer.write_all(line.as_bytes())
            })
            .await
        }

        async fn read(&mut self) -> AppResult<String> {
            self.blocking(|instrument| {
                let mut line = String::new();
                BufReader::new(instrument).read_line(&mut line)?;
                Ok(line.trim_end().to_string())
            })
            .await
        }

        fn resource(&self) -> &str {
            &self.resource
        }
    }
}
