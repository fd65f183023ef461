
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use browser_jobs::browser::SharedEngine;
use browser_jobs::config::RunnerConfig;
use browser_jobs::scheduler::{JobStatus, StateManager};
use browser_jobs::worker::JobRunner;
use test_harness::{
    process_gone, read_pid, registered_job, sh_runner, wait_for, writes_result, StaticEngine,
    TEST_ENDPOINT,
};

const TIMEOUT: Duration = Duration::from_secs(10);
const GRACE: Duration = Duration::from_millis(500);

fn runner(config: RunnerConfig, state: &Arc<StateManager>) -> JobRunner {
    let engine: Arc<dyn SharedEngine> = StaticEngine::available();
    JobRunner::new(config, state.clone(), engine)
}

#[tokio::test]
async fn test_completed_result_file() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "crawl-a").await;

    let config = sh_runner(
        &writes_result(r#"{"status":"COMPLETED","result":{"k":"v"}}"#),
        TIMEOUT,
        GRACE,
    );
    let outcome = runner(config, &state).run(&job).await;

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.result, json!({"k": "v"}));

    let info = state.get_info(job.job_id).await.unwrap();
    assert_eq!(info.status, JobStatus::Completed);
    assert_eq!(info.result, Some(json!({"k": "v"})));
    assert!(info.duration.unwrap() >= 0.0);
    assert!(!state.is_name_in_flight("crawl-a").await);
}

#[tokio::test]
async fn test_bootstrap_receives_job_coordinates_and_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "coords").await;

    let script = r#"printf '{"status":"COMPLETED","result":{"id":"%s","script":"%s","endpoint":"%s"}}' "$1" "$2" "$BROWSER_ENDPOINT" > "$3/result.json""#;
    let outcome = runner(sh_runner(script, TIMEOUT, GRACE), &state)
        .run(&job)
        .await;

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.result["id"], job.job_id.to_string());
    assert_eq!(
        outcome.result["script"],
        job.script_path.display().to_string()
    );
    assert_eq!(outcome.result["endpoint"], TEST_ENDPOINT);
}

#[tokio::test]
async fn test_script_failure_reported_by_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "raises").await;

    let config = sh_runner(
        &writes_result(r#"{"status":"FAILED","error":{"cause":"script","error":"selector not found"}}"#),
        TIMEOUT,
        GRACE,
    );
    let outcome = runner(config, &state).run(&job).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "script");
    assert_eq!(outcome.result["error"], "selector not found");
    assert_eq!(
        state.get_status(job.job_id).await,
        Some(JobStatus::Failed)
    );
}

#[tokio::test]
async fn test_missing_result_file_is_protocol_failure() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "silent").await;

    let config = sh_runner("echo 'some output'; echo 'crashed' >&2; exit 3", TIMEOUT, GRACE);
    let outcome = runner(config, &state).run(&job).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "protocol");
    assert_eq!(outcome.result["exit_code"], 3);
    assert!(outcome.result["stdout"]
        .as_str()
        .unwrap()
        .contains("some output"));
    assert!(outcome.result["stderr"].as_str().unwrap().contains("crashed"));
    assert!(!state.is_name_in_flight("silent").await);
}

#[tokio::test]
async fn test_malformed_result_file_is_protocol_failure() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "garbled").await;

    let config = sh_runner(&writes_result("not json at all"), TIMEOUT, GRACE);
    let outcome = runner(config, &state).run(&job).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "protocol");
    assert_eq!(outcome.result["exit_code"], 0);
}

#[tokio::test]
async fn test_non_terminal_result_file_is_protocol_failure() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "half-done").await;

    let config = sh_runner(&writes_result(r#"{"status":"RUNNING"}"#), TIMEOUT, GRACE);
    let outcome = runner(config, &state).run(&job).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "protocol");
}

#[tokio::test]
async fn test_timeout_kills_bootstrap_and_its_children() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "hangs").await;

    let script = r#"echo $$ > "$3/bootstrap.pid"; sleep 30 & echo $! > "$3/child.pid"; wait"#;
    let config = sh_runner(script, Duration::from_millis(500), Duration::from_millis(300));

    let started = Instant::now();
    let outcome = runner(config, &state).run(&job).await;
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "timeout took {:?}",
        started.elapsed()
    );

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "timeout");
    assert_eq!(outcome.result["timeout_secs"], 0.5);
    assert!(outcome.result["partial_result"].is_null());
    assert!(!state.is_name_in_flight("hangs").await);

    let bootstrap_pid = read_pid(&job.job_path.join("bootstrap.pid"));
    let child_pid = read_pid(&job.job_path.join("child.pid"));
    assert!(
        wait_for(
            || async move { process_gone(bootstrap_pid) && process_gone(child_pid) },
            Duration::from_secs(2),
            Duration::from_millis(50),
        )
        .await,
        "bootstrap {bootstrap_pid} or child {child_pid} survived the timeout"
    );
}

#[tokio::test]
async fn test_timeout_keeps_partial_result() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "late").await;

    let script = format!(
        "{}; sleep 30",
        writes_result(r#"{"status":"COMPLETED","result":[1,2]}"#)
    );
    let config = sh_runner(&script, Duration::from_millis(500), Duration::from_millis(300));
    let outcome = runner(config, &state).run(&job).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "timeout");
    assert_eq!(outcome.result["partial_result"]["result"], json!([1, 2]));
}

#[tokio::test]
async fn test_timeout_escalates_when_term_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "stubborn").await;

    let script = "trap '' TERM; while true; do sleep 0.1; done";
    let config = sh_runner(script, Duration::from_millis(300), Duration::from_millis(300));

    let started = Instant::now();
    let outcome = runner(config, &state).run(&job).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.result["cause"], "timeout");
}

#[tokio::test]
async fn test_spawn_failure_is_system_failure() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "nobody-home").await;

    let config = RunnerConfig {
        bootstrap_program: "/nonexistent/bootstrap-program".into(),
        bootstrap_args: Vec::new(),
        timeout: TIMEOUT,
        kill_grace: GRACE,
    };
    let outcome = runner(config, &state).run(&job).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "system");
    assert!(!state.is_name_in_flight("nobody-home").await);
}

#[tokio::test]
async fn test_unavailable_engine_fails_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "no-browser").await;

    let config = sh_runner(r#"touch "$3/spawned""#, TIMEOUT, GRACE);
    let engine: Arc<dyn SharedEngine> = StaticEngine::unavailable();
    let outcome = JobRunner::new(config, state.clone(), engine).run(&job).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "system");
    assert!(!job.job_path.join("spawned").exists());
    assert!(!state.is_name_in_flight("no-browser").await);
}

#[tokio::test]
async fn test_large_output_does_not_block() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "chatty").await;

    let script = format!(
        "head -c 2000000 /dev/zero | tr '\\0' 'x'; {}",
        writes_result(r#"{"status":"COMPLETED","result":"ok"}"#)
    );
    let outcome = runner(sh_runner(&script, TIMEOUT, GRACE), &state)
        .run(&job)
        .await;

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.result, json!("ok"));
}

#[tokio::test]
async fn test_stale_result_file_is_not_trusted() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "stale").await;
    std::fs::write(
        job.job_path.join("result.json"),
        r#"{"status":"COMPLETED","result":{"forged":true}}"#,
    )
    .unwrap();
    std::fs::write(job.job_path.join("result.json.tmp"), "{").unwrap();

    // The bootstrap dies before writing anything.
    let outcome = runner(sh_runner("kill -9 $$", TIMEOUT, GRACE), &state)
        .run(&job)
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "protocol");
    assert!(!job.job_path.join("result.json").exists());
    assert!(!job.job_path.join("result.json.tmp").exists());
}

#[tokio::test]
async fn test_stopped_runner_fails_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "late").await;
    let marker = job.job_path.join("spawned");

    let config = sh_runner("touch \"$3/spawned\"", TIMEOUT, GRACE);
    let runner = runner(config, &state);
    runner.stop();
    assert!(runner.is_stopped());
    let outcome = runner.run(&job).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "system");
    assert!(!marker.exists());
    assert!(!state.is_name_in_flight("late").await);
}

#[tokio::test]
async fn test_stop_terminates_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new());
    let job = registered_job(&state, dir.path(), "interrupted").await;

    let config = sh_runner("sleep 30", Duration::from_secs(60), GRACE);
    let runner = Arc::new(runner(config, &state));
    let task = {
        let runner = runner.clone();
        let job = job.clone();
        tokio::spawn(async move { runner.run(&job).await })
    };

    let watched = state.clone();
    let job_id = job.job_id;
    assert!(
        wait_for(
            || {
                let state = watched.clone();
                async move { state.get_status(job_id).await == Some(JobStatus::Running) }
            },
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await
    );

    let started = Instant::now();
    runner.stop();
    let outcome = task.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result["cause"], "system");
    assert!(!state.is_name_in_flight("interrupted").await);
}
