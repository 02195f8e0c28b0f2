use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn validate_config_exits_zero_without_binding() {
    Command::cargo_bin("proxyd")
        .unwrap()
        .args(["--validate-config", "--port", "0"])
        .assert()
        .success()
        .stdout(contains("configuration OK"));
}

#[test]
fn validate_config_rejects_bad_engine() {
    Command::cargo_bin("proxyd")
        .unwrap()
        .args(["--validate-config", "--engine", "not-a-real-engine"])
        .assert()
        .failure();
}

#[test]
fn missing_config_file_exits_with_code_two() {
    Command::cargo_bin("proxyd")
        .unwrap()
        .args(["--config", "/nonexistent/path/does-not-exist.toml"])
        .assert()
        .code(2);
}
