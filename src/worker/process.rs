//! Two-phase process termination.
//!
//! Children supervised here are spawned as process-group leaders
//! (`Command::process_group(0)`), so signals go to the whole group and
//! reach anything the child started itself.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

/// Send `signal` to the process group led by `pid`.
///
/// A group that no longer exists is not an error.
pub fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg only reads its integer arguments.
    let ret = unsafe { libc::killpg(pgid, signal) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

/// Stop `child`: SIGTERM to its group, wait up to `grace`, then SIGKILL.
///
/// Always waits for the final exit so the child is reaped. Returns
/// immediately if the child has already exited.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    let Some(pid) = child.id() else {
        return child.wait().await;
    };

    if let Err(e) = signal_group(pid, libc::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, killing");
            if let Err(e) = signal_group(pid, libc::SIGKILL) {
                tracing::warn!(pid, error = %e, "Failed to send SIGKILL to process group");
            }
            // Covers a child that left its group.
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::process::Command;

    fn spawn_group(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn terminate_stops_cooperative_process() {
        let mut child = spawn_group("sleep 30");
        let started = Instant::now();
        let status = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn terminate_escalates_when_sigterm_is_ignored() {
        let mut child = spawn_group("trap '' TERM; while true; do sleep 1; done");
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        let status = terminate(&mut child, Duration::from_millis(300)).await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn terminate_returns_status_of_exited_child() {
        let mut child = spawn_group("exit 3");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = terminate(&mut child, Duration::from_secs(1)).await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn signal_to_missing_group_is_ok() {
        // PID_MAX_LIMIT itself is never handed out.
        assert!(signal_group(4_194_304, libc::SIGTERM).is_ok());
    }
}
