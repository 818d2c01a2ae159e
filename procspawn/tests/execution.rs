use std::time::Duration;

use futures_util::StreamExt;
use procspawn::{Execution, OutputConsumptionState, Signal, SpawnRequest, StdioSlots, TerminationStatus};

const WAIT_LIMIT: Duration = Duration::from_secs(20);

fn spawn_sh(script: &str) -> Execution {
    let stdio = StdioSlots::new()
        .piped_stdout()
        .unwrap()
        .piped_stderr()
        .unwrap();
    procspawn::spawn(SpawnRequest::new("/bin/sh").arg("-c").arg(script).stdio(stdio)).unwrap()
}

async fn wait(exec: &Execution) -> TerminationStatus {
    tokio::time::timeout(WAIT_LIMIT, exec.wait())
        .await
        .expect("child did not exit in time")
        .unwrap()
}

// =========================================================================
// Group 1: joint capture
// =========================================================================

#[tokio::test]
async fn capture_separates_stdout_and_stderr() {
    let exec = spawn_sh("printf out; printf err >&2");
    let captured = exec.capture_ios().await.unwrap();
    assert_eq!(captured.stdout, b"out");
    assert_eq!(captured.stderr, b"err");
    assert!(wait(&exec).await.is_success());
}

#[tokio::test]
async fn capture_drains_a_full_stderr_before_stdout_is_written() {
    // Far more than a pipe buffer on stderr first: sequential draining of
    // stdout would deadlock here.
    let exec = spawn_sh("head -c 200000 /dev/zero >&2; head -c 200000 /dev/zero");
    let captured = tokio::time::timeout(WAIT_LIMIT, exec.capture_ios())
        .await
        .expect("capture deadlocked")
        .unwrap();
    assert_eq!(captured.stdout.len(), 200_000);
    assert_eq!(captured.stderr.len(), 200_000);
    assert!(wait(&exec).await.is_success());
}

#[tokio::test]
async fn capture_marks_both_streams_consumed() {
    let exec = spawn_sh("true");
    assert_eq!(exec.consumption_state(), OutputConsumptionState::default());
    exec.capture_ios().await.unwrap();
    assert_eq!(
        exec.consumption_state(),
        OutputConsumptionState {
            stdout_consumed: true,
            stderr_consumed: true,
        }
    );
    wait(&exec).await;
}

// =========================================================================
// Group 2: single consumption
// =========================================================================

#[tokio::test]
async fn streams_can_be_read_independently() {
    let exec = spawn_sh("printf a; printf b >&2");
    let mut stderr = exec.stderr().unwrap();
    let mut stdout = exec.stdout().unwrap();

    let mut err = Vec::new();
    while let Some(chunk) = stderr.next().await {
        err.extend_from_slice(&chunk.unwrap());
    }
    let mut out = Vec::new();
    while let Some(chunk) = stdout.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(out, b"a");
    assert_eq!(err, b"b");
    wait(&exec).await;
}

#[tokio::test]
#[should_panic(expected = "already consumed")]
async fn second_stdout_read_panics_even_if_first_was_abandoned() {
    let exec = spawn_sh("printf partial");
    let mut first = exec.stdout().unwrap();
    let _ = first.next().await;
    drop(first);
    let _ = exec.stdout();
}

#[tokio::test]
#[should_panic(expected = "already consumed")]
async fn capture_after_stdout_stream_panics() {
    let exec = spawn_sh("true");
    let _stdout = exec.stdout().unwrap();
    let _ = exec.capture_ios().await;
}

#[tokio::test]
#[should_panic(expected = "not redirected to a pipe")]
async fn reading_an_unpiped_stream_panics() {
    let exec = procspawn::spawn(SpawnRequest::new("/bin/sh").arg("-c").arg("true")).unwrap();
    let _ = exec.stderr();
}

#[tokio::test]
#[should_panic(expected = "standard error of this execution was not redirected to a pipe")]
async fn capture_requires_both_pipes() {
    let stdio = StdioSlots::new().piped_stdout().unwrap();
    let exec =
        procspawn::spawn(SpawnRequest::new("/bin/sh").arg("-c").arg("true").stdio(stdio)).unwrap();
    let _ = exec.capture_ios().await;
}

// =========================================================================
// Group 3: signals and waiting
// =========================================================================

#[tokio::test]
async fn sigterm_terminates_the_child() {
    let exec = procspawn::spawn(SpawnRequest::new("/bin/sleep").arg("30")).unwrap();
    assert_eq!(exec.try_wait().unwrap(), None);

    exec.send_signal(Signal::SIGTERM).unwrap();
    let status = wait(&exec).await;
    assert_eq!(status, TerminationStatus::Signaled(libc::SIGTERM));
    assert_eq!(status.signal(), Some(libc::SIGTERM));
    assert!(!status.is_success());
}

#[tokio::test]
async fn group_signal_reaches_grandchildren() {
    let stdio = StdioSlots::new().piped_stdout().unwrap();
    // The grandchild inherits the write end; stdout only hits EOF once it dies too.
    let request = SpawnRequest::new("/bin/sh")
        .arg("-c")
        .arg("/bin/sleep 30 & wait")
        .stdio(stdio)
        .create_session(true);
    let exec = procspawn::spawn(request).unwrap();
    let mut stdout = exec.stdout().unwrap();

    exec.send_signal_to_group(Signal::SIGKILL).unwrap();
    assert_eq!(wait(&exec).await, TerminationStatus::Signaled(libc::SIGKILL));

    let eof = tokio::time::timeout(WAIT_LIMIT, stdout.next())
        .await
        .expect("grandchild survived the group signal");
    assert!(eof.is_none());
}

#[tokio::test]
async fn try_wait_reaps_an_exited_child() {
    let exec = procspawn::spawn(SpawnRequest::new("/bin/sh").arg("-c").arg("exit 3")).unwrap();
    let status = tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            if let Some(status) = exec.try_wait().unwrap() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(status, TerminationStatus::Exited(3));
    assert_eq!(status.code(), Some(3));
}
