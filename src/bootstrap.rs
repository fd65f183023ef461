//! The per-job bootstrap program.
//!
//! Runs inside the subprocess the runner spawns for each job
//! (`browser-jobs bootstrap <job_id> <script_path> <job_path>`):
//!
//! 1. Attaches to the shared browser named by `BROWSER_ENDPOINT`
//! 2. Creates a fresh browser context and one page in it
//! 3. Invokes the task script's entry point with `(page, context, job_path)`
//! 4. Disposes the context
//! 5. Writes `result.json` atomically into the job directory
//!
//! # Task script entry point
//!
//! Task scripts are executed as their own process with the page target id,
//! browser context id and job directory as positional arguments. Exit code
//! 0 means the entry point returned: the last non-empty stdout line,
//! parsed as JSON, is the return value. Any other exit means it raised.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::{json, Value};
use tokio::process::Command;

use crate::browser::{BrowserError, CdpSession, ENDPOINT_ENV};
use crate::worker::result::{ResultFile, ResultFileError};

/// Coordinates the runner passes on the command line.
#[derive(Debug, Clone)]
pub struct BootstrapArgs {
    pub job_id: String,
    pub script_path: PathBuf,
    pub job_path: PathBuf,
}

/// Handles the task script receives for its browser context and page.
#[derive(Debug, Clone)]
pub struct SessionHandles {
    pub endpoint: String,
    pub ws_endpoint: String,
    pub context_id: String,
    pub page_id: String,
}

/// Run the job and write its `result.json`. Returns what was written.
pub async fn run_and_write(args: &BootstrapArgs) -> Result<ResultFile, ResultFileError> {
    let file = run(args).await;
    file.write_atomic(&args.job_path).await?;
    Ok(file)
}

/// Run the job end to end and describe the outcome. Never fails: every
/// error becomes a FAILED result.
pub async fn run(args: &BootstrapArgs) -> ResultFile {
    let Ok(endpoint) = std::env::var(ENDPOINT_ENV) else {
        return system_failure(format!("{ENDPOINT_ENV} is not set"));
    };

    let mut session = match CdpSession::connect(&endpoint).await {
        Ok(session) => session,
        Err(e) => return system_failure(format!("Failed to attach to shared browser: {e}")),
    };

    let file = match open_page(&mut session).await {
        Ok((context_id, page_id)) => {
            let handles = SessionHandles {
                endpoint,
                ws_endpoint: session.ws_url().to_string(),
                context_id: context_id.clone(),
                page_id,
            };
            let file = invoke_entry_point(args, &handles).await;
            if let Err(e) = session.dispose_context(&context_id).await {
                tracing::warn!(job_id = %args.job_id, error = %e, "Failed to dispose browser context");
            }
            file
        }
        Err(e) => system_failure(format!("Failed to create browser context: {e}")),
    };

    session.close().await;
    file
}

async fn open_page(session: &mut CdpSession) -> Result<(String, String), BrowserError> {
    let context_id = session.create_context().await?;
    let page_id = session.create_page(&context_id).await?;
    Ok((context_id, page_id))
}

/// Execute the task script and translate its exit into a result.
pub async fn invoke_entry_point(args: &BootstrapArgs, handles: &SessionHandles) -> ResultFile {
    let mut cmd = script_command(&args.script_path);
    cmd.arg(&handles.page_id)
        .arg(&handles.context_id)
        .arg(&args.job_path)
        .current_dir(&args.job_path)
        .env(ENDPOINT_ENV, &handles.endpoint)
        .env("BROWSER_WS_ENDPOINT", &handles.ws_endpoint)
        .env("BROWSER_CONTEXT_ID", &handles.context_id)
        .env("PAGE_TARGET_ID", &handles.page_id)
        .env("JOB_ID", &args.job_id)
        .env("JOB_PATH", &args.job_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match cmd.output().await {
        Ok(output) => output,
        Err(e) => {
            return ResultFile::failed(json!({
                "cause": "script",
                "error": format!("Failed to start task script {}: {e}", args.script_path.display()),
            }))
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !stderr.is_empty() {
        eprint!("{stderr}");
    }

    if output.status.success() {
        ResultFile::completed(return_value(&stdout))
    } else {
        ResultFile::failed(json!({
            "cause": "script",
            "error": format!("Task script exited with {}", output.status),
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

/// Pick an interpreter from the script's extension.
fn script_command(script_path: &Path) -> Command {
    let interpreter = match script_path.extension().and_then(|ext| ext.to_str()) {
        Some("py") => Some("python3"),
        Some("js" | "mjs" | "cjs") => Some("node"),
        Some("sh") => Some("sh"),
        _ => None,
    };
    match interpreter {
        Some(interpreter) => {
            let mut cmd = Command::new(interpreter);
            cmd.arg(script_path);
            cmd
        }
        None => Command::new(script_path),
    }
}

/// The last non-empty stdout line as JSON, else the trimmed stdout as a string.
fn return_value(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| serde_json::from_str(line).ok())
        .unwrap_or_else(|| Value::String(trimmed.to_string()))
}

fn system_failure(error: String) -> ResultFile {
    tracing::error!(error = %error, "Bootstrap failed before running the task script");
    ResultFile::failed(json!({ "cause": "system", "error": error }))
}
