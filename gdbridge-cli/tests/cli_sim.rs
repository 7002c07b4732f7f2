use std::process::Command;

fn sim() -> Command {
    Command::new(env!("CARGO_BIN_EXE_gdbridge-sim"))
}

#[test]
fn test_cli_help() {
    let output = sim().arg("--help").output().expect("Failed to run gdbridge-sim");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: gdbridge-sim"));
    assert!(stdout.contains("pass-count"));
}

#[test]
fn test_cli_equal_pass_count() {
    let output = sim()
        .args(["pass-count", "--policy", "equal:3", "--crossings", "4"])
        .output()
        .expect("Failed to run gdbridge-sim");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("crossing 1: skipped by GDB"));
    assert!(stdout.contains("crossing 3: stopped, hit count 3"));
    assert!(stdout.contains("crossing 4: resumed by engine"));
    assert!(stdout.contains("hit count: 4"));
}

#[test]
fn test_cli_rejects_bad_policy() {
    let output = sim()
        .args(["pass-count", "--policy", "sometimes:2"])
        .output()
        .expect("Failed to run gdbridge-sim");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown policy"));
}

#[test]
fn test_cli_config_file() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("gdbridge.json");
    std::fs::write(&path, r#"{"interrupt_timeout_ms": 20, "max_interrupt_attempts": 1}"#).unwrap();

    let output = sim()
        .args(["--config", path.to_str().unwrap(), "break-all", "--dropped", "3"])
        .output()
        .expect("Failed to run gdbridge-sim");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("timed out waiting for interrupt acknowledgement"));
}
