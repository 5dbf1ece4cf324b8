//! CLI tests: spawn the `patchloop` binary and check exit codes and side effects.

use std::fs;
use std::process::Command;

use patchloop::exit_codes;

fn patchloop(dir: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_patchloop"));
    cmd.env_clear()
        .env("PATH", std::env::var_os("PATH").unwrap_or_default())
        .arg("-C")
        .arg(dir);
    cmd
}

#[test]
fn missing_api_keys_exit_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = patchloop(temp.path())
        .arg("add a health endpoint")
        .output()
        .expect("run patchloop");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no API key found"), "stderr: {stderr}");
}

#[test]
fn blank_instruction_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let status = patchloop(temp.path())
        .env("MISTRAL_API_KEY", "unused")
        .arg("   ")
        .status()
        .expect("run patchloop");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

/// `rewrite` replays saved file writes without contacting a provider.
#[test]
fn rewrite_replays_saved_response() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state_dir = temp.path().join(".patchloop");
    fs::create_dir_all(&state_dir).expect("state dir");
    let body = serde_json::json!({
        "choices": [{"message": {"role": "assistant",
            "content": "<file path=\"src/health.js\">ok\n</file><cli>touch nope</cli>"}}]
    });
    fs::write(state_dir.join("lastresponse.json"), body.to_string()).expect("write response");

    for _ in 0..2 {
        let output = patchloop(temp.path())
            .arg("rewrite")
            .output()
            .expect("run patchloop");
        assert_eq!(output.status.code(), Some(exit_codes::OK));
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "src/health.js");
    }
    assert_eq!(
        fs::read_to_string(temp.path().join("src/health.js")).expect("read"),
        "ok\n"
    );
    assert!(!temp.path().join("nope").exists());
}

#[test]
fn rewrite_without_saved_response_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");

    let status = patchloop(temp.path())
        .arg("rewrite")
        .status()
        .expect("run patchloop");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
    assert!(
        fs::read_to_string(temp.path().join("NOTES.txt"))
            .expect("notes")
            .contains("Error in patchloop (fatal)")
    );
}
