use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How the shared browser process is launched.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Chromium-family executable (name on PATH or absolute path)
    pub executable: PathBuf,
    /// Remote debugging port; the endpoint is always bound to 127.0.0.1
    pub debugging_port: u16,
    pub headless: bool,
    /// Profile directory. Defaults to a per-port directory under the system temp dir.
    pub user_data_dir: Option<PathBuf>,
    /// Extra command-line flags appended after the built-in ones
    pub extra_args: Vec<String>,
    /// How long `start()` waits for the DevTools endpoint to answer
    pub startup_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on shutdown
    pub shutdown_grace: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("chromium"),
            debugging_port: 9222,
            headless: true,
            user_data_dir: None,
            extra_args: Vec::new(),
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl BrowserConfig {
    /// Base URL handed to bootstrap subprocesses.
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.debugging_port)
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.user_data_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("browser-jobs-profile-{}", self.debugging_port))
        })
    }
}

/// How each job's bootstrap subprocess is spawned and supervised.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Program started once per job
    pub bootstrap_program: PathBuf,
    /// Arguments placed before the job id, script path and job path
    pub bootstrap_args: Vec<String>,
    /// Wall-clock budget for one job
    pub timeout: Duration,
    /// Time between the graceful and the forced termination signal
    pub kill_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            bootstrap_program: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from("browser-jobs")),
            bootstrap_args: vec!["bootstrap".to_string()],
            timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Job directories older than this are deleted
    pub retention: Duration,
    /// Time between sweeps
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3 * 24 * 3600),
            interval: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Root under which each job gets its own directory
    pub job_root: PathBuf,
    /// Number of concurrently running jobs
    pub max_workers: usize,
    /// Bounded wait for the queue to drain on shutdown
    pub drain_timeout: Duration,
    pub browser: BrowserConfig,
    pub runner: RunnerConfig,
    pub retention: RetentionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            job_root: PathBuf::from("submitted_jobs"),
            max_workers: 3,
            drain_timeout: Duration::from_secs(30),
            browser: BrowserConfig::default(),
            runner: RunnerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, job_root: PathBuf) -> Self {
        Self {
            listen_addr,
            job_root,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_config_default() {
        let cfg = BrowserConfig::default();
        assert_eq!(cfg.executable, PathBuf::from("chromium"));
        assert_eq!(cfg.debugging_port, 9222);
        assert!(cfg.headless);
        assert!(cfg.extra_args.is_empty());
        assert_eq!(cfg.endpoint(), "http://127.0.0.1:9222");
    }

    #[test]
    fn browser_profile_dir_prefers_explicit_path() {
        let mut cfg = BrowserConfig {
            debugging_port: 9333,
            ..Default::default()
        };
        assert!(cfg
            .profile_dir()
            .ends_with("browser-jobs-profile-9333"));

        cfg.user_data_dir = Some(PathBuf::from("/var/lib/browser"));
        assert_eq!(cfg.profile_dir(), PathBuf::from("/var/lib/browser"));
    }

    #[test]
    fn runner_config_default_uses_bootstrap_subcommand() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.bootstrap_args, vec!["bootstrap".to_string()]);
        assert_eq!(cfg.timeout, Duration::from_secs(600));
        assert_eq!(cfg.kill_grace, Duration::from_secs(5));
    }

    #[test]
    fn retention_config_default() {
        let cfg = RetentionConfig::default();
        assert_eq!(cfg.retention, Duration::from_secs(259_200));
        assert_eq!(cfg.interval, Duration::from_secs(86_400));
    }

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:5000");
        assert_eq!(cfg.job_root, PathBuf::from("submitted_jobs"));
        assert_eq!(cfg.max_workers, 3);
        assert_eq!(cfg.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn server_config_with_workers_never_zero() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = ServerConfig::new(addr, PathBuf::from("/tmp/jobs")).with_workers(0);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.max_workers, 1);
    }
}
