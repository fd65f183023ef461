use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use browser_jobs::bootstrap::{self, BootstrapArgs};
use browser_jobs::config::{BrowserConfig, RetentionConfig, RunnerConfig, ServerConfig};
use browser_jobs::server::Server;
use browser_jobs::shutdown::install_shutdown_handler;

const SECS_PER_HOUR: u64 = 3600;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

#[derive(Parser, Debug)]
#[command(name = "browser-jobs")]
#[command(version)]
#[command(about = "Runs uploaded browser automation scripts against a shared browser")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the job server
    Serve(ServeArgs),

    /// Run one job inside its subprocess (started by the server)
    Bootstrap {
        /// Job ID (UUID)
        job_id: String,
        /// Task script to execute
        script_path: PathBuf,
        /// Job working directory; result.json is written here
        job_path: PathBuf,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to bind the HTTP server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port for the HTTP server
    #[arg(long, env = "PORT", default_value = "5000")]
    port: u16,

    /// Directory holding one subdirectory per job
    #[arg(long, env = "JOB_FOLDER", default_value = "submitted_jobs")]
    job_folder: PathBuf,

    /// Number of jobs run concurrently
    #[arg(long, env = "MAX_CONCURRENT_TASKS", default_value = "3")]
    max_concurrent_tasks: usize,

    /// Per-job wall-clock timeout in seconds
    #[arg(long, env = "JOB_TIMEOUT_SECS", default_value = "600")]
    job_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when stopping a job
    #[arg(long, env = "KILL_GRACE_SECS", default_value = "5")]
    kill_grace_secs: u64,

    /// Seconds to wait for queued jobs on shutdown
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value = "30")]
    drain_timeout_secs: u64,

    /// Job directories older than this many days are deleted
    #[arg(long, env = "JOB_RETENTION_DAYS", default_value = "3")]
    job_retention_days: u64,

    /// Hours between cleanup sweeps
    #[arg(long, env = "CLEANUP_INTERVAL_HOURS", default_value = "24")]
    cleanup_interval_hours: u64,

    // === Browser Options ===
    /// Chromium-family executable
    #[arg(long, env = "BROWSER_EXECUTABLE", default_value = "chromium")]
    browser_executable: PathBuf,

    /// Remote debugging port of the shared browser
    #[arg(long, env = "BROWSER_DEBUG_PORT", default_value = "9222")]
    browser_debug_port: u16,

    /// Run the browser headless
    #[arg(long, env = "BROWSER_HEADLESS", default_value = "true", action = clap::ArgAction::Set)]
    browser_headless: bool,

    /// Browser profile directory
    #[arg(long, env = "BROWSER_USER_DATA_DIR")]
    browser_user_data_dir: Option<PathBuf>,

    /// Seconds to wait for the browser endpoint to answer at startup
    #[arg(long, env = "BROWSER_STARTUP_TIMEOUT_SECS", default_value = "30")]
    browser_startup_timeout_secs: u64,

    /// Program started per job (defaults to this binary's `bootstrap` subcommand)
    #[arg(long, env = "BOOTSTRAP_PROGRAM")]
    bootstrap_program: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl ServeArgs {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let listen_addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;

        let browser = BrowserConfig {
            executable: self.browser_executable,
            debugging_port: self.browser_debug_port,
            headless: self.browser_headless,
            user_data_dir: self.browser_user_data_dir,
            startup_timeout: Duration::from_secs(self.browser_startup_timeout_secs),
            ..Default::default()
        };

        let mut runner = RunnerConfig {
            timeout: Duration::from_secs(self.job_timeout_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            ..Default::default()
        };
        if let Some(program) = self.bootstrap_program {
            runner.bootstrap_program = program;
            runner.bootstrap_args = Vec::new();
        }

        let retention_secs = self
            .job_retention_days
            .checked_mul(SECS_PER_DAY)
            .ok_or("JOB_RETENTION_DAYS is too large")?;
        let interval_secs = self
            .cleanup_interval_hours
            .max(1)
            .checked_mul(SECS_PER_HOUR)
            .ok_or("CLEANUP_INTERVAL_HOURS is too large")?;
        let retention = RetentionConfig {
            retention: Duration::from_secs(retention_secs),
            interval: Duration::from_secs(interval_secs),
        };

        Ok(ServerConfig {
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            browser,
            runner,
            retention,
            ..ServerConfig::new(listen_addr, self.job_folder)
        }
        .with_workers(self.max_concurrent_tasks))
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_filter))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(&args.log_level.to_lowercase());

    let config = args.into_config()?;
    tracing::info!(
        addr = %config.listen_addr,
        job_root = %config.job_root.display(),
        workers = config.max_workers,
        "Starting browser-jobs server"
    );

    let shutdown = install_shutdown_handler();
    Server::new(config).run(shutdown).await?;
    Ok(())
}

async fn run_bootstrap(args: BootstrapArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let file = bootstrap::run_and_write(&args).await?;
    tracing::info!(job_id = %args.job_id, status = %file.status, "Result written");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {e}");
        }
    }
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await?,
        Commands::Bootstrap {
            job_id,
            script_path,
            job_path,
        } => {
            run_bootstrap(BootstrapArgs {
                job_id,
                script_path,
                job_path,
            })
            .await?
        }
    }

    Ok(())
}
