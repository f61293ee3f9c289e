//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, std::path::Path, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("mmcflash")
}

/// Command isolated from the caller's environment and config files.
fn isolated_cmd(home: &Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.current_dir(home)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("NO_COLOR", "1")
        .env_remove("MMCFLASH_PORT")
        .env_remove("MMCFLASH_BAUD")
        .env_remove("MMCFLASH_SPI")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("mmcflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mmcflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn help_lists_all_commands() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("flash"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("activate"))
        .stdout(predicate::str::contains("list-ports"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let value: serde_json::Value =
        serde_json::from_str(&stdout).expect("stdout should be valid JSON");
    assert_eq!(value["ok"], true);
    assert!(value["data"]["ports"].is_array());
}

#[test]
fn exit_code_two_for_usage_error_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("erase")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_usage_error_missing_required_arg() {
    let mut cmd = cli_cmd();
    cmd.arg("flash")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("FILE"));
}

#[test]
fn exit_code_two_for_invalid_fill_byte() {
    let mut cmd = cli_cmd();
    cmd.args(["flash", "top.bin", "--fill", "0x1FF"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid byte"));
}

#[test]
fn exit_code_two_when_no_port_selected() {
    let dir = tempdir().unwrap();
    let image = dir
        .path()
        .join("top.bin");
    fs::write(&image, [0xA5u8; 300]).unwrap();

    let mut cmd = isolated_cmd(dir.path());
    cmd.arg("flash")
        .arg(&image)
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Available serial ports"))
        .stderr(predicate::str::contains("No serial port selected"));
}

#[test]
fn no_port_is_reported_before_image_errors() {
    let dir = tempdir().unwrap();
    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["verify", "missing.bin"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No serial port selected"))
        .stderr(predicate::str::contains("Failed to read image").not());
}

#[test]
fn verify_accepts_activate_flag() {
    let dir = tempdir().unwrap();
    let image = dir
        .path()
        .join("top.bin");
    fs::write(&image, [0u8; 256]).unwrap();

    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["-p", "/dev/mmcflash-does-not-exist", "verify", "--activate"])
        .arg(&image)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to open"));
}

#[test]
fn exit_code_two_when_activate_has_no_port() {
    let dir = tempdir().unwrap();
    let mut cmd = isolated_cmd(dir.path());
    cmd.arg("activate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("No serial port selected"));
}

#[test]
fn exit_code_one_for_missing_image() {
    let dir = tempdir().unwrap();
    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["-p", "/dev/mmcflash-does-not-exist", "flash", "missing.bin"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to read image"));
}

#[test]
fn exit_code_one_for_empty_image() {
    let dir = tempdir().unwrap();
    let image = dir
        .path()
        .join("empty.bin");
    fs::write(&image, b"").unwrap();

    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["-p", "/dev/mmcflash-does-not-exist", "flash"])
        .arg(&image)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("empty"));
}

#[test]
fn exit_code_one_when_port_cannot_be_opened() {
    let dir = tempdir().unwrap();
    let image = dir
        .path()
        .join("top.bin");
    fs::write(&image, [0u8; 256]).unwrap();

    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["-p", "/dev/mmcflash-does-not-exist", "flash"])
        .arg(&image)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to open"));
}

#[test]
fn local_config_supplies_port() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path()
            .join("mmcflash.toml"),
        "[connection]\nserial = \"/dev/mmcflash-from-config\"\n",
    )
    .unwrap();

    let mut cmd = isolated_cmd(dir.path());
    cmd.arg("activate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("/dev/mmcflash-from-config"));
}

#[test]
fn explicit_config_path_supplies_port() {
    let dir = tempdir().unwrap();
    let config = dir
        .path()
        .join("board.toml");
    fs::write(&config, "[connection]\nserial = \"/dev/mmcflash-board\"\n").unwrap();

    let mut cmd = isolated_cmd(dir.path());
    cmd.arg("--config")
        .arg(&config)
        .arg("activate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("/dev/mmcflash-board"));
}

#[test]
fn flash_command_writes_to_stderr_only() {
    let dir = tempdir().unwrap();
    let image = dir
        .path()
        .join("top.bin");
    fs::write(&image, [0u8; 16]).unwrap();

    let mut cmd = isolated_cmd(dir.path());
    cmd.args(["-p", "/dev/mmcflash-does-not-exist", "flash"])
        .arg(&image)
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}
