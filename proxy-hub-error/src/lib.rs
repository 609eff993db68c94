//! Error taxonomy shared across the workspace.

use anyhow::Error as AnyhowError;
use config::ConfigError;
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;
use thiserror::Error;
use tokio::task::JoinError;

pub type HubResult<T, E = HubError> = Result<T, E>;

/// Error taxonomy for the proxy hub core.
///
/// None of these is fatal to the process: device-facing variants are reported
/// to the caller, transmission variants are absorbed by the retry machinery,
/// and infrastructure variants are logged.
#[derive(Error, Debug)]
pub enum HubError {
    /// The operation referenced a proxy device id that is not in the expected
    /// collection (linked vs. not-linked).
    #[error("unknown proxy device: {0}")]
    UnknownDevice(String),
    /// Malformed request, e.g. a link request carrying neither an existing
    /// cloud device id nor a name for a new one.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A network-level send to the broker failed. Recovered automatically via
    /// the failed queue; never surfaced to telemetry producers.
    #[error("transmission failure: {0}")]
    Transmission(String),
    /// The cloud rejected the device credentials (401 / device not
    /// registered). Triggers automatic unlink.
    #[error("cloud rejected device {0}")]
    CloudRejected(String),
    /// Rate limited (429). The message is dropped, not retried.
    #[error("rate limited by the cloud")]
    RateLimited,
    /// Already registered (409). Benign, ignored.
    #[error("conflict: already registered")]
    Conflict,
    /// The cloud device API returned an error for a create/name/token call.
    #[error("cloud api error: {0}")]
    CloudApi(String),
    /// The connection actor is gone (command channel closed).
    #[error("cloud connection unavailable")]
    ConnectionClosed,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Io(#[from] IoError),
    #[error("{0}")]
    Json(#[from] SerdeJsonError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Join(#[from] JoinError),
    #[error("{0}")]
    Anyhow(#[from] AnyhowError),
}

impl From<String> for HubError {
    #[inline]
    fn from(e: String) -> Self {
        HubError::Msg(e)
    }
}

impl From<&str> for HubError {
    #[inline]
    fn from(e: &str) -> Self {
        HubError::Msg(e.to_string())
    }
}

impl HubError {
    /// True for errors that are reported to an API caller rather than being
    /// absorbed by the retry machinery.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, HubError::UnknownDevice(_) | HubError::BadRequest(_))
    }
}
