mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use gordon::logs::{LogService, LogSource};
use gordon::runtime::ContainerRuntime;
use utils::MockRuntime;

fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[tokio::test]
async fn process_logs_replays_only_the_tail() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("gordon.log");
    std::fs::write(&path, "one\ntwo\nthree\nfour\n")?;

    let runtime: Arc<dyn ContainerRuntime> = MockRuntime::new();
    let service = LogService::new(Some(path), runtime);

    let mut rx = service.process_logs(2, false, CancellationToken::new());
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }
    assert_eq!(lines, vec!["three", "four"]);
    Ok(())
}

#[tokio::test]
async fn process_log_follower_picks_up_appends_and_stops_on_cancel() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("gordon.log");
    std::fs::write(&path, "start\n")?;

    let runtime: Arc<dyn ContainerRuntime> = MockRuntime::new();
    let service = LogService::new(Some(path.clone()), runtime);
    let cancel = CancellationToken::new();

    let mut rx = service.process_logs(10, true, cancel.clone());
    assert_eq!(rx.recv().await.as_deref(), Some("start"));

    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        writeln!(file, "appended")?;
    }
    let line = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?;
    assert_eq!(line.as_deref(), Some("appended"));

    cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?;
    assert_eq!(closed, None);
    Ok(())
}

#[tokio::test]
async fn container_logs_are_demultiplexed_per_source() -> Result<()> {
    let runtime = MockRuntime::new();
    let mut framed = frame(1, b"request handled\n");
    framed.extend(frame(2, b"something failed\n"));
    runtime.set_container_logs("c1", framed);

    let runtime_dyn: Arc<dyn ContainerRuntime> = runtime;
    let service = LogService::new(None, runtime_dyn);

    let mut rx = service
        .container_logs("c1", None, false, CancellationToken::new())
        .await?;
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!((first.source, first.line.as_str()), (LogSource::Stdout, "request handled"));
    assert_eq!(
        (second.source, second.line.as_str()),
        (LogSource::Stderr, "something failed")
    );
    assert!(rx.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn capture_writes_lines_to_the_target_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runtime = MockRuntime::new();
    runtime.set_container_logs("c1", frame(1, b"booting\nready\n"));

    let runtime_dyn: Arc<dyn ContainerRuntime> = runtime;
    let service = LogService::new(None, runtime_dyn);

    let path = dir.path().join("app_example_com.log");
    service.capture_container_logs("c1".to_string(), path.clone(), CancellationToken::new());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if contents.contains("ready") {
                assert!(contents.contains("stdout booting"));
                assert!(contents.contains("stdout ready"));
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "capture never flushed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
