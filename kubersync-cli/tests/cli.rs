use std::fs;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn kubersync_cmd(home: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("kubersync"));
    cmd.env("HOME", home.path())
        .env_remove("KUBECONFIG")
        .env_remove("KUBERNETES_SERVICE_HOST")
        .env_remove("KUBERNETES_SERVICE_PORT");
    cmd
}

#[test]
fn missing_secret_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    kubersync_cmd(&home)
        .args(["--path", "somewhere"])
        .assert()
        .code(2)
        .stderr(contains("--secret"));
}

#[test]
fn missing_path_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    kubersync_cmd(&home)
        .args(["--secret", "app"])
        .assert()
        .code(2)
        .stderr(contains("--path"));
}

#[test]
fn unreadable_kubeconfig_is_a_startup_error() {
    let home = TempDir::new().unwrap();
    let mirror = home.path().join("mirror");
    kubersync_cmd(&home)
        .args(["--secret", "app", "--path"])
        .arg(&mirror)
        .arg("--kubeconfig")
        .arg(home.path().join("no-such-kubeconfig"))
        .assert()
        .code(1)
        .stderr(contains("mirroring secret default/app failed"))
        .stderr(contains("no-such-kubeconfig"));
    assert!(mirror.is_dir(), "root is created before connecting");
}

#[test]
fn no_cluster_configuration_is_a_startup_error() {
    let home = TempDir::new().unwrap();
    let mirror = home.path().join("mirror");
    fs::create_dir_all(&mirror).unwrap();
    kubersync_cmd(&home)
        .args(["--secret", "app", "--namespace", "prod", "--path"])
        .arg(&mirror)
        .assert()
        .code(1)
        .stderr(contains("prod/app"));
}
