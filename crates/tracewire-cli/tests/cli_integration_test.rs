//! CLI Integration Tests
//!
//! These run the built `tracewire` binary. Commands that need a server talk
//! to one started in-process on an ephemeral loopback port.

use std::process::{Command, Output};

use tracewire_server::{ServerConfig, ServerPipeline};

// ============================================================================
// Test Helpers
// ============================================================================

fn tracewire(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tracewire"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

/// Runs the binary off the async runtime so the in-process server keeps serving.
async fn tracewire_async(args: Vec<String>) -> Output {
    tokio::task::spawn_blocking(move || {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        tracewire(&args)
    })
    .await
    .unwrap()
}

async fn start_server() -> String {
    let config = ServerConfig::default().with_bind_addr("127.0.0.1:0");
    let pipeline = ServerPipeline::bind(&config, Vec::new()).await.unwrap();
    let addr = pipeline.server.local_addr().unwrap().to_string();
    tokio::spawn(pipeline.serve_until(std::future::pending()));
    addr
}

fn closed_port() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

// ============================================================================
// Argument Validation Tests
// ============================================================================

#[test]
fn test_ping_requires_server_argument() {
    let output = tracewire(&["ping"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Required") || stderr.contains("server"));
}

#[test]
fn test_send_rejects_unknown_metric_type() {
    let output = tracewire(&["send", "127.0.0.1:9", "load", "1", "-t", "gauge"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("gauge"));
}

#[test]
fn test_server_with_invalid_bind_address() {
    let output = tracewire(&["server", "-b", "invalid-address"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid-address"));
}

// ============================================================================
// Command Tests
// ============================================================================

#[test]
fn test_ping_without_server_fails() {
    let output = tracewire(&["ping", &closed_port()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to connect"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_reports_session_and_round_trips() {
    let addr = start_server().await;
    let output = tracewire_async(vec!["ping".into(), addr, "-c".into(), "2".into()]).await;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().filter(|l| l.starts_with("PING")).count(), 2);
    assert!(stdout.contains("session=tracewire:1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_is_acknowledged() {
    let addr = start_server().await;
    let output = tracewire_async(vec![
        "send".into(),
        addr,
        "threads".into(),
        "42".into(),
        "--host".into(),
        "h1".into(),
        "--agent-id".into(),
        "a1".into(),
    ])
    .await;

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("h1/a1:threads acknowledged=1"));
}
