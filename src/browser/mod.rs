//! The shared browser process and the DevTools protocol used to reach it.
//!
//! One long-lived browser is launched at startup by [`BrowserManager`] with a
//! remote-debugging endpoint. Job subprocesses attach to that endpoint with
//! [`CdpSession`] and each create their own isolated browser context; the
//! manager never touches per-job contexts.
//!
//! # Components
//!
//! - [`BrowserManager`]: start/shutdown/liveness of the browser process
//! - [`CdpSession`]: minimal DevTools client (contexts and pages)
//! - [`SharedEngine`]: the seam the runner and HTTP layer depend on

pub mod cdp;
pub mod manager;

pub use cdp::CdpSession;
pub use manager::BrowserManager;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable carrying the endpoint into job subprocesses.
pub const ENDPOINT_ENV: &str = "BROWSER_ENDPOINT";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Failed to launch browser {executable}: {source}")]
    Launch {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Browser exited during startup: {0}")]
    ExitedDuringStartup(std::process::ExitStatus),

    #[error("Browser endpoint {endpoint} not ready after {waited:?}")]
    StartupTimeout { endpoint: String, waited: Duration },

    #[error("Endpoint probe failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("DevTools call {method} failed: {message}")]
    Protocol { method: String, message: String },

    #[error("DevTools connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something job subprocesses can attach to.
#[async_trait]
pub trait SharedEngine: Send + Sync {
    /// Endpoint to hand to subprocesses, or `None` if the engine is not running.
    fn endpoint(&self) -> Option<String>;

    /// Liveness probe.
    async fn is_connected(&self) -> bool;
}

/// Response of `GET /json/version`.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

/// Ask the DevTools HTTP endpoint which browser is listening and where its WebSocket is.
pub async fn fetch_version(
    client: &reqwest::Client,
    endpoint: &str,
) -> Result<VersionInfo, BrowserError> {
    let url = format!("{}/json/version", endpoint.trim_end_matches('/'));
    let info = client
        .get(url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json::<VersionInfo>()
        .await?;
    Ok(info)
}
