use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};

use crate::browser::{fetch_version, BrowserError, SharedEngine, VersionInfo};
use crate::config::BrowserConfig;
use crate::worker::process;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Owns the single long-lived browser process.
///
/// Created once at startup and shared as `Arc<BrowserManager>`.
pub struct BrowserManager {
    config: BrowserConfig,
    process: Mutex<Option<Child>>,
    endpoint: watch::Sender<Option<String>>,
    http: reqwest::Client,
}

impl BrowserManager {
    pub fn new(config: BrowserConfig) -> Self {
        let (endpoint, _) = watch::channel(None);
        Self {
            config,
            process: Mutex::new(None),
            endpoint,
            http: reqwest::Client::new(),
        }
    }

    /// Launch the browser and wait until its DevTools endpoint answers.
    ///
    /// Calling this while the browser is already running logs a warning and
    /// does nothing. Any error here means the server cannot operate.
    pub async fn start(&self) -> Result<(), BrowserError> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            tracing::warn!("Shared browser already started");
            return Ok(());
        }

        let endpoint = self.config.endpoint();
        tracing::info!(
            executable = %self.config.executable.display(),
            endpoint = %endpoint,
            headless = self.config.headless,
            "Launching shared browser"
        );

        let mut child = self
            .command()
            .spawn()
            .map_err(|source| BrowserError::Launch {
                executable: self.config.executable.display().to_string(),
                source,
            })?;

        let info = match self.wait_until_ready(&mut child, &endpoint).await {
            Ok(info) => info,
            Err(e) => {
                if let Err(kill_err) =
                    process::terminate(&mut child, self.config.shutdown_grace).await
                {
                    tracing::warn!(error = %kill_err, "Failed to stop browser after failed startup");
                }
                return Err(e);
            }
        };

        tracing::info!(browser = %info.browser, endpoint = %endpoint, "Shared browser ready");
        *process = Some(child);
        self.endpoint.send_replace(Some(endpoint));
        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg(format!("--remote-debugging-port={}", self.config.debugging_port))
            .arg("--remote-debugging-address=127.0.0.1")
            .arg(format!(
                "--user-data-dir={}",
                self.config.profile_dir().display()
            ))
            .args([
                "--no-sandbox",
                "--disable-setuid-sandbox",
                "--disable-dev-shm-usage",
                "--no-first-run",
                "--no-default-browser-check",
            ]);
        if self.config.headless {
            cmd.arg("--headless=new");
        }
        cmd.args(&self.config.extra_args)
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .process_group(0);
        cmd
    }

    async fn wait_until_ready(
        &self,
        child: &mut Child,
        endpoint: &str,
    ) -> Result<VersionInfo, BrowserError> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(BrowserError::ExitedDuringStartup(status));
            }
            match fetch_version(&self.http, endpoint).await {
                Ok(info) => return Ok(info),
                Err(e) => tracing::debug!(error = %e, "Browser endpoint not ready yet"),
            }
            if started.elapsed() >= self.config.startup_timeout {
                return Err(BrowserError::StartupTimeout {
                    endpoint: endpoint.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Stop the browser process and withdraw the endpoint.
    pub async fn shutdown(&self) {
        self.endpoint.send_replace(None);
        let Some(mut child) = self.process.lock().await.take() else {
            tracing::info!("Shared browser not running, nothing to shut down");
            return;
        };
        match process::terminate(&mut child, self.config.shutdown_grace).await {
            Ok(status) => tracing::info!(status = %status, "Shared browser stopped"),
            Err(e) => tracing::error!(error = %e, "Error stopping shared browser"),
        }
    }

    /// Whether the process is alive and its endpoint answers.
    pub async fn is_connected(&self) -> bool {
        let Some(endpoint) = self.endpoint() else {
            return false;
        };
        {
            let mut process = self.process.lock().await;
            match process.as_mut().map(|child| child.try_wait()) {
                Some(Ok(None)) => {}
                _ => return false,
            }
        }
        fetch_version(&self.http, &endpoint).await.is_ok()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.endpoint.borrow().clone()
    }
}

#[async_trait]
impl SharedEngine for BrowserManager {
    fn endpoint(&self) -> Option<String> {
        BrowserManager::endpoint(self)
    }

    async fn is_connected(&self) -> bool {
        BrowserManager::is_connected(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn start_fails_for_missing_executable() {
        let manager = BrowserManager::new(BrowserConfig {
            executable: PathBuf::from("/nonexistent/chromium-binary"),
            ..Default::default()
        });
        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, BrowserError::Launch { .. }));
        assert!(manager.endpoint().is_none());
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn start_fails_when_process_exits_before_ready() {
        let manager = BrowserManager::new(BrowserConfig {
            executable: PathBuf::from("false"),
            debugging_port: 1,
            startup_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        let err = manager.start().await.unwrap_err();
        assert!(
            matches!(err, BrowserError::ExitedDuringStartup(_)),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn start_times_out_when_endpoint_never_answers() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-browser");
        std::fs::write(&fake, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let manager = BrowserManager::new(BrowserConfig {
            executable: fake,
            debugging_port: 1,
            startup_timeout: Duration::from_millis(300),
            shutdown_grace: Duration::from_millis(200),
            user_data_dir: Some(dir.path().join("profile")),
            ..Default::default()
        });
        let err = manager.start().await.unwrap_err();
        assert!(
            matches!(err, BrowserError::StartupTimeout { .. }),
            "unexpected error: {err}"
        );
        assert!(manager.endpoint().is_none());
    }

    #[tokio::test]
    async fn shutdown_without_start_is_noop() {
        let manager = BrowserManager::new(BrowserConfig::default());
        manager.shutdown().await;
        assert!(manager.endpoint().is_none());
    }
}
