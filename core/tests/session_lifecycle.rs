//! End-to-end session scenarios: a recording executor stands in for the
//! cluster and a `sh -c` script stands in for the tunnel subprocess.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hpcserve_core::remote::{CommandOutput, Credentials, MockExecutor, Secret};
use hpcserve_core::scheduler::{JobKind, JobState};
use hpcserve_core::tunnel::{TunnelManager, TunnelOptions, TunnelProgram, TunnelState};
use hpcserve_core::{
    HpcError, JobOrchestrator, OrchestratorConfig, ResourceLeases, SessionRequest, SessionState,
};

const MARKER_SCRIPT: &str = "echo \"Tunnel listening on 127.0.0.1:$5 -> $3:$4\"";

fn creds() -> Credentials {
    Credentials::new("login.hpc", "alice", Secret::Password("pw".into()))
}

fn llm_request() -> SessionRequest {
    SessionRequest::new(creds(), JobKind::llm())
}

fn tunnel(script: &str) -> TunnelManager {
    TunnelManager::new(
        TunnelProgram::new("sh").with_args(vec!["-c".into(), script.into()]),
        TunnelOptions {
            ready_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
        },
    )
}

fn serving_tunnel() -> TunnelManager {
    tunnel(&format!("{}; exec sleep 30", MARKER_SCRIPT))
}

fn orchestrator(mock: &Arc<MockExecutor>, tunnels: TunnelManager) -> JobOrchestrator {
    JobOrchestrator::new(
        mock.clone(),
        tunnels,
        Arc::new(ResourceLeases::new()),
        OrchestratorConfig {
            poll_interval: Duration::from_millis(20),
            ..OrchestratorConfig::default()
        },
    )
}

fn submission(id: &str) -> Vec<hpcserve_core::Result<CommandOutput>> {
    vec![
        Ok(CommandOutput::ok("")),
        Ok(CommandOutput::ok(&format!("Submitted batch job {}\n", id))),
    ]
}

fn alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn spawn_count(counter: &Path) -> usize {
    std::fs::read_to_string(counter)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Submit, see the job running on node42, and reach Ready.
async fn ready_session(mock: &Arc<MockExecutor>, orch: &JobOrchestrator) {
    let job = orch.start(llm_request()).await.unwrap();
    assert_eq!(job.id, "123456");
    mock.push(Ok(CommandOutput::ok("RUNNING node42\n")));
    let snapshot = orch.poll_once().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
}

#[tokio::test]
async fn submit_poll_tunnel_ready_then_cancel() {
    let mock = Arc::new(MockExecutor::with_responses(submission("123456")));
    let orch = orchestrator(&mock, serving_tunnel());

    let job = orch.start(llm_request()).await.unwrap();
    assert_eq!(job.id, "123456");
    let commands = mock.executed_commands();
    let script = &commands[1];
    assert!(script.contains("#SBATCH --job-name=notebook_llm"));
    assert!(script.contains("#SBATCH --nodes=1"));
    assert!(script.contains("#SBATCH --gres=gpu:1"));

    mock.push(Ok(CommandOutput::ok("RUNNING node42\n")));
    let snapshot = orch.poll_once().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    let job = snapshot.job.unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.node.as_deref(), Some("node42"));
    let tunnel = snapshot.tunnel.unwrap();
    assert_eq!(tunnel.target_host, "node42");
    assert_eq!(tunnel.target_port, 5001);
    assert_eq!(tunnel.local_port, 5001);
    assert_eq!(tunnel.state, TunnelState::Listening);
    let pid = tunnel.pid.unwrap();
    assert!(alive(pid));

    let named_before = mock.count_matching("scancel --name=notebook_llm --user=alice");
    let snapshot = orch.cancel().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Stopped);
    assert!(snapshot.tunnel.is_none());
    assert!(!alive(pid));
    assert_eq!(
        mock.count_matching("scancel --name=notebook_llm --user=alice"),
        named_before + 1
    );
}

#[tokio::test]
async fn run_until_settled_waits_through_pending() {
    let mock = Arc::new(MockExecutor::with_responses(submission("123456")));
    let orch = orchestrator(&mock, serving_tunnel());
    orch.start(llm_request()).await.unwrap();

    mock.push(Ok(CommandOutput::ok("PENDING (null)\n")));
    mock.push(Ok(CommandOutput::ok("CONFIGURING gpu[12-13]\n")));
    mock.push(Ok(CommandOutput::ok("RUNNING gpu[12-13]\n")));
    let snapshot = orch
        .run_until_settled(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(snapshot.state, SessionState::Ready);
    assert_eq!(snapshot.tunnel.unwrap().target_host, "gpu12");

    orch.stop().await.unwrap();
}

#[tokio::test]
async fn back_to_back_starts_submit_once() {
    let mock = Arc::new(
        MockExecutor::with_responses(submission("123456")).with_delay(Duration::from_millis(50)),
    );
    let orch = orchestrator(&mock, serving_tunnel());

    let (first, second) = tokio::join!(orch.start(llm_request()), orch.start(llm_request()));
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(HpcError::InvalidState(_)))));
    assert_eq!(mock.count_matching("sbatch"), 1);
    assert_eq!(orch.state().state, SessionState::Queued);
}

#[tokio::test]
async fn missing_job_is_not_found_never_completed() {
    let mock = Arc::new(MockExecutor::with_responses(submission("123456")));
    let orch = orchestrator(&mock, serving_tunnel());
    orch.start(llm_request()).await.unwrap();

    mock.push(Ok(CommandOutput::ok("")));
    mock.push(Ok(CommandOutput::ok("")));
    let err = orch.poll_once().await.unwrap_err();
    assert!(matches!(err, HpcError::NotFound(_)));
    let snapshot = orch.state();
    assert_eq!(snapshot.state, SessionState::Queued);
    assert_ne!(snapshot.job.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn cancel_from_idle_does_nothing() {
    let mock = Arc::new(MockExecutor::new());
    let orch = orchestrator(&mock, serving_tunnel());
    assert_eq!(orch.cancel().await.unwrap().state, SessionState::Idle);
    assert_eq!(orch.stop().await.unwrap().state, SessionState::Idle);
    assert!(mock.executed_commands().is_empty());
}

#[tokio::test]
async fn submission_landing_after_cancel_is_cancelled_by_id() {
    let mock = Arc::new(
        MockExecutor::with_responses(submission("77")).with_delay(Duration::from_millis(150)),
    );
    let orch = orchestrator(&mock, serving_tunnel());

    let (started, cancelled) = tokio::join!(orch.start(llm_request()), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.cancel().await
    });
    assert!(matches!(started, Err(HpcError::Cancelled(_))));
    assert_eq!(cancelled.unwrap().state, SessionState::Stopped);

    let commands = mock.executed_commands();
    assert!(commands.iter().any(|c| c == "scancel 77"));
    let by_id = commands.iter().position(|c| c == "scancel 77").unwrap();
    let named_last = commands
        .iter()
        .rposition(|c| c.starts_with("scancel --name=notebook_llm"))
        .unwrap();
    assert!(by_id < named_last);
    assert_eq!(orch.state().state, SessionState::Stopped);
}

#[tokio::test]
async fn second_tunnel_start_spawns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("spawns");
    let manager = tunnel(&format!(
        "echo spawned >> '{}'; {}; exec sleep 30",
        counter.display(),
        MARKER_SCRIPT
    ));
    let token = CancellationToken::new();

    let a = manager
        .start_tunnel(&creds(), "node42", 5001, 5001, &token)
        .await
        .unwrap();
    let b = manager
        .start_tunnel(&creds(), "node42", 5001, 5001, &token)
        .await
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(spawn_count(&counter), 1);

    manager.stop_tunnel().await.unwrap();
    manager.stop_tunnel().await.unwrap();
    assert_eq!(manager.status(), TunnelState::Stopped);
}

#[tokio::test]
async fn cancel_while_tunnel_is_starting() {
    let mock = Arc::new(MockExecutor::with_responses(submission("123456")));
    let orch = orchestrator(&mock, tunnel(&format!("sleep 1; {}; exec sleep 30", MARKER_SCRIPT)));
    orch.start(llm_request()).await.unwrap();
    let named_before = mock.count_matching("scancel --name=notebook_llm");

    mock.push(Ok(CommandOutput::ok("RUNNING node42\n")));
    let (polled, (pid, cancelled)) = tokio::join!(orch.poll_once(), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let starting = orch.state();
        assert_eq!(starting.state, SessionState::StartingTunnel);
        let pid = starting.tunnel.unwrap().pid.unwrap();
        (pid, orch.cancel().await)
    });

    assert_ne!(polled.unwrap().state, SessionState::Ready);
    assert_eq!(cancelled.unwrap().state, SessionState::Stopped);
    let snapshot = orch.state();
    assert_eq!(snapshot.state, SessionState::Stopped);
    assert!(snapshot.tunnel.is_none());
    assert!(!alive(pid));
    assert_eq!(mock.count_matching("scancel --name=notebook_llm"), named_before + 1);

    // A later tick does not revive the session.
    assert_eq!(orch.poll_once().await.unwrap().state, SessionState::Stopped);
}

#[tokio::test]
async fn tunnel_failure_leaves_job_for_stop() {
    let mock = Arc::new(MockExecutor::with_responses(submission("123456")));
    let orch = orchestrator(&mock, tunnel("echo 'channel 0: open failed' >&2; exit 1"));
    orch.start(llm_request()).await.unwrap();

    mock.push(Ok(CommandOutput::ok("RUNNING node42\n")));
    let err = orch.poll_once().await.unwrap_err();
    assert!(matches!(err, HpcError::Tunnel(_)));
    match orch.state().state {
        SessionState::Error { reason } => assert!(reason.contains("open failed")),
        other => panic!("unexpected state: {:?}", other),
    }

    let named_before = mock.count_matching("scancel --name=notebook_llm");
    assert_eq!(orch.stop().await.unwrap().state, SessionState::Stopped);
    assert_eq!(mock.count_matching("scancel --name=notebook_llm"), named_before + 1);
}

#[tokio::test]
async fn tunnel_crash_after_ready_moves_to_error() {
    let mock = Arc::new(MockExecutor::with_responses(submission("123456")));
    let orch = orchestrator(&mock, tunnel(&format!("{}; sleep 0.2; exit 3", MARKER_SCRIPT)));
    ready_session(&mock, &orch).await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    let snapshot = orch.poll_once().await.unwrap();
    match snapshot.state {
        SessionState::Error { reason } => assert!(reason.contains("tunnel exited")),
        other => panic!("unexpected state: {:?}", other),
    }

    let named_before = mock.count_matching("scancel --name=notebook_llm");
    orch.stop().await.unwrap();
    assert_eq!(mock.count_matching("scancel --name=notebook_llm"), named_before + 1);
}

#[tokio::test]
async fn job_completing_while_ready_finishes_and_closes_tunnel() {
    let mock = Arc::new(MockExecutor::with_responses(submission("123456")));
    let orch = orchestrator(&mock, serving_tunnel());
    ready_session(&mock, &orch).await;
    let pid = orch.state().tunnel.unwrap().pid.unwrap();

    mock.push(Ok(CommandOutput::ok("")));
    mock.push(Ok(CommandOutput::ok("COMPLETED\n")));
    let snapshot = orch.poll_once().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Finished);
    assert!(snapshot.tunnel.is_none());
    assert!(!alive(pid));

    // Finished is restartable.
    mock.push(Ok(CommandOutput::ok("")));
    mock.push(Ok(CommandOutput::ok("Submitted batch job 123457\n")));
    assert_eq!(orch.start(llm_request()).await.unwrap().id, "123457");
    orch.stop().await.unwrap();
}
