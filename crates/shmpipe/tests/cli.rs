#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "shmpipe-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            panic!("socket did not appear at {}", path.display());
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn spawn_serve(path: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_shmpipe"))
        .args(["--log-level", "error", "serve"])
        .arg(path)
        .args(["--frame-size", "4096", "--fps", "100"])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("serve command should start")
}

fn stop(mut child: Child, dir: &Path) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_shmpipe"))
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn info_reports_producer_caps() {
    let dir = unique_temp_dir("info");
    let sock_path = dir.join("attach.sock");
    let child = spawn_serve(&sock_path);
    wait_for_socket(&sock_path, Duration::from_secs(5));

    let output = Command::new(env!("CARGO_BIN_EXE_shmpipe"))
        .args(["--log-level", "error", "--format", "json", "info"])
        .arg(&sock_path)
        .output()
        .expect("info should run");

    stop(child, &dir);
    assert!(output.status.success(), "info failed: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("video/x-raw,format=BGR,width=1280,height=720"));
    assert!(stdout.contains("\"handle\":0"));
}

#[test]
fn watch_prints_requested_number_of_frames() {
    let dir = unique_temp_dir("watch");
    let sock_path = dir.join("attach.sock");
    let child = spawn_serve(&sock_path);
    wait_for_socket(&sock_path, Duration::from_secs(5));

    let output = Command::new(env!("CARGO_BIN_EXE_shmpipe"))
        .args(["--log-level", "error", "--format", "json", "watch"])
        .arg(&sock_path)
        .args(["--count", "3"])
        .output()
        .expect("watch should run");

    stop(child, &dir);
    assert!(output.status.success(), "watch failed: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        assert!(line.contains("\"size\":4096"), "unexpected record: {line}");
        assert!(line.contains("\"zero_copy\":true"), "unexpected record: {line}");
    }
}

#[test]
fn info_against_missing_endpoint_times_out_with_124() {
    let dir = unique_temp_dir("missing");
    let output = Command::new(env!("CARGO_BIN_EXE_shmpipe"))
        .args(["--log-level", "error", "info"])
        .arg(dir.join("absent.sock"))
        .args(["--timeout", "300ms"])
        .output()
        .expect("info should run");
    let _ = std::fs::remove_dir_all(&dir);

    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn serve_with_count_exits_cleanly() {
    let dir = unique_temp_dir("count");
    let sock_path = dir.join("attach.sock");
    let output = Command::new(env!("CARGO_BIN_EXE_shmpipe"))
        .args(["--log-level", "error", "--format", "json", "serve"])
        .arg(&sock_path)
        .args(["--frame-size", "128", "--fps", "200", "--count", "5"])
        .output()
        .expect("serve should run");
    let _ = std::fs::remove_dir_all(&dir);

    assert!(output.status.success(), "serve failed: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"frames_rendered\":5"));
    assert!(stdout.contains("\"clients\":0"));
}
