//! Integration tests for settings resolution (`nodelink config show`).

mod common;

use common::TestEnv;
use predicates::prelude::*;

fn show_json(env: &TestEnv) -> serde_json::Value {
    let output = env.nodelink().args(["config", "show"]).output().unwrap();
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_config_show_defaults() {
    let env = TestEnv::new();
    let json = show_json(&env);

    assert_eq!(json["cluster"]["value"], "cluster");
    assert_eq!(json["cluster"]["source"], "default");
    assert_eq!(json["partition"]["value"], "cpu");
    assert_eq!(json["time"]["value"], "01:00:00");
    assert_eq!(json["cpus"]["value"], 1);
    assert_eq!(json["memory"]["value"], "4G");
    assert_eq!(json["identity_file"]["value"], "~/.ssh/id_ed25519");
    assert!(json["config_file"].is_null());
}

#[test]
fn test_config_show_reads_settings_file() {
    let env = TestEnv::new();
    env.write_config(
        r#"
        // cluster defaults
        cluster "spider"
        partition "gpu"
        cpus 8
        memory "32G"
        "#,
    );
    let json = show_json(&env);

    assert_eq!(json["cluster"]["value"], "spider");
    assert_eq!(json["cluster"]["source"], "file");
    assert_eq!(json["head_host"]["value"], "spider");
    assert_eq!(json["cpus"]["value"], 8);
    assert_eq!(json["time"]["source"], "default");
    assert_eq!(
        json["config_file"].as_str().unwrap(),
        env.config_path().to_str().unwrap()
    );
}

#[test]
fn test_config_show_human() {
    let env = TestEnv::new();
    env.write_config("user \"alice\"\n");

    env.nodelink()
        .args(["-H", "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Settings file:"))
        .stdout(predicate::str::contains("alice"))
        .stdout(predicate::str::contains("(file)"));
}

#[test]
fn test_invalid_settings_file_fails() {
    let env = TestEnv::new();
    env.write_config("cpus 0\n");

    env.nodelink()
        .args(["config", "show"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cpus must be at least 1"));
}

#[test]
fn test_unknown_settings_key_human_error() {
    let env = TestEnv::new();
    env.write_config("partiton \"gpu\"\n");

    env.nodelink()
        .args(["-H", "config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nodelink: error: settings: invalid settings file"))
        .stderr(predicate::str::contains("unknown key 'partiton'"));
}

#[test]
fn test_config_flag_overrides_env() {
    let env = TestEnv::new();
    let other = env.path().join("other.kdl");
    std::fs::write(&other, "cluster \"from-flag\"\n").unwrap();
    env.write_config("cluster \"from-env\"\n");

    let output = env
        .nodelink()
        .arg("--config")
        .arg(&other)
        .args(["config", "show"])
        .output()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["cluster"]["value"], "from-flag");
}
