use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::browser::{BrowserManager, SharedEngine};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::retention::RetentionSweeper;
use crate::scheduler::{Dispatcher, JobQueue, StateManager};
use crate::worker::{JobRunner, WorkerPool};

/// The job server: shared browser, worker pool, retention sweeper and HTTP API.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Startup order:
    /// 1. Creates the job root
    /// 2. Starts the shared browser (fatal on failure)
    /// 3. Starts the worker pool and the retention sweeper
    /// 4. Serves HTTP
    ///
    /// Teardown runs in reverse once the HTTP server stops: the sweeper is
    /// cancelled, the pool drains within the configured timeout and the
    /// browser is shut down last.
    ///
    /// # Errors
    ///
    /// Returns an error if the job root cannot be created, the browser does
    /// not come up, or the HTTP listener fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config;
        tokio::fs::create_dir_all(&config.job_root).await?;

        let browser = Arc::new(BrowserManager::new(config.browser.clone()));
        if let Err(e) = browser.start().await {
            tracing::error!(error = %e, "Failed to start shared browser");
            return Err(e.into());
        }
        let engine: Arc<dyn SharedEngine> = browser.clone();

        let state = Arc::new(StateManager::new());
        let queue = Arc::new(JobQueue::new());
        let runner = Arc::new(JobRunner::new(
            config.runner.clone(),
            state.clone(),
            engine.clone(),
        ));
        let pool = WorkerPool::start(config.max_workers, queue.clone(), runner, state.clone());

        let sweeper_cancel = shutdown.child_token();
        let sweeper = RetentionSweeper::new(
            config.job_root.clone(),
            config.retention.clone(),
            state.clone(),
        );
        let sweeper_task = tokio::spawn(sweeper.run(sweeper_cancel.clone()));

        let app = api::router(ApiState {
            dispatcher: Dispatcher::new(state.clone(), queue),
            engine,
            job_root: config.job_root.clone(),
        });
        let served = serve(config.listen_addr, app, shutdown).await;
        if let Err(e) = &served {
            tracing::error!(error = %e, "HTTP server stopped with an error");
        }

        tracing::info!("Shutting down");
        sweeper_cancel.cancel();
        if let Err(e) = sweeper_task.await {
            tracing::warn!(error = %e, "Retention sweeper task failed");
        }
        if let Err(e) = pool.shutdown(config.drain_timeout).await {
            tracing::error!(error = %e, "Failed to stop worker pool cleanly");
        }
        browser.shutdown().await;
        let counts = state.count_by_status().await;
        tracing::info!(jobs = ?counts, "Shutdown complete");
        served
    }
}

async fn serve(addr: SocketAddr, app: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
