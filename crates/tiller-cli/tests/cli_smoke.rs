use assert_cmd::Command;
use std::path::Path;
use tempfile::TempDir;

/// Binary invocation isolated from the developer's real settings: HOME is
/// the workspace and the settings override points at a file that does not
/// exist, so only built-in defaults apply.
fn tiller(workspace: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tiller"));
    cmd.current_dir(workspace)
        .env_remove("TILLER_API_KEY")
        .env("HOME", workspace)
        .env("TILLER_SETTINGS_FILE", workspace.join("absent-settings.json"));
    cmd
}

#[test]
fn help_names_the_chat_subcommand_and_global_flags() {
    let workspace = TempDir::new().expect("workspace");
    let assert = tiller(workspace.path()).arg("--help").assert().success();
    let out = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(out.contains("chat"));
    assert!(out.contains("--print"));
    assert!(out.contains("--auto-approve"));
    assert!(out.contains("--max-iterations"));
}

#[test]
fn print_mode_with_empty_stdin_fails() {
    let workspace = TempDir::new().expect("workspace");
    let assert = tiller(workspace.path())
        .arg("-p")
        .write_stdin("")
        .assert()
        .failure();
    let err = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(err.contains("empty prompt"));
}

#[test]
fn print_mode_without_an_api_key_names_the_missing_variable() {
    let workspace = TempDir::new().expect("workspace");
    let assert = tiller(workspace.path())
        .args(["-p", "--no-plan", "hello"])
        .assert()
        .failure();
    let err = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(err.contains("TILLER_API_KEY"), "stderr was: {err}");
}

#[test]
fn chat_exits_cleanly_on_exit_and_prints_the_banner() {
    let workspace = TempDir::new().expect("workspace");
    let assert = tiller(workspace.path())
        .arg("chat")
        .write_stdin("exit\n")
        .assert()
        .success();
    let out = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(out.contains("tiller chat"));
    assert!(out.contains("model:"));
}

#[test]
fn repl_help_command_lists_the_local_commands() {
    let workspace = TempDir::new().expect("workspace");
    let assert = tiller(workspace.path())
        .arg("chat")
        .write_stdin("/help\nexit\n")
        .assert()
        .success();
    let out = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(out.contains("/compact"));
    assert!(out.contains("/todos"));
}

#[test]
fn explicit_workspace_must_exist() {
    let workspace = TempDir::new().expect("workspace");
    let missing = workspace.path().join("no-such-dir");
    let assert = tiller(workspace.path())
        .args(["--workspace", missing.to_string_lossy().as_ref(), "chat"])
        .write_stdin("exit\n")
        .assert()
        .failure();
    let err = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(err.contains("no-such-dir"));
}
