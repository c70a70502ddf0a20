// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! End-to-end tests for the helper binaries that need no SQL Server: flag
//! validation, the stop short-circuit, and the connect-retry failure path.

use std::io::Write;
use std::net::TcpListener;
use std::process::{Command, Output};

/// Conventional OCF exit-code environment, as the cluster manager exports
/// it.
const OCF_ENVIRONMENT: [(&str, &str); 9] = [
    ("OCF_SUCCESS", "0"),
    ("OCF_ERR_GENERIC", "1"),
    ("OCF_ERR_ARGS", "2"),
    ("OCF_ERR_UNIMPLEMENTED", "3"),
    ("OCF_ERR_PERM", "4"),
    ("OCF_ERR_CONFIGURED", "6"),
    ("OCF_NOT_RUNNING", "7"),
    ("OCF_RUNNING_MASTER", "8"),
    ("OCF_FAILED_MASTER", "9"),
];

fn ag_helper(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ag-helper"))
        .args(args)
        .envs(OCF_ENVIRONMENT)
        .output()
        .expect("ag-helper must run")
}

fn fci_helper(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fci-helper"))
        .args(args)
        .envs(OCF_ENVIRONMENT)
        .output()
        .expect("fci-helper must run")
}

fn credentials_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"sa\ns3cret\n").unwrap();
    file
}

/// A loopback port that refuses connections: bind a listener to reserve a
/// free port, then drop it.
fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[test]
fn stop_succeeds_without_touching_the_instance() {
    // The credentials file does not exist and the port refuses, neither of
    // which stop may notice.
    let output = ag_helper(&[
        "--hostname",
        "localhost",
        "--port",
        "1433",
        "--ag-name",
        "ag1",
        "--credentials-file",
        "/nonexistent/credentials",
        "--application-name",
        "stop-test",
        "--action",
        "stop",
    ]);

    // OCF_SUCCESS (0) offset by 10.
    assert_eq!(output.status.code(), Some(10));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ag-helper invoked with"));
    assert!(!stdout.contains("Attempt 1 to connect"));
}

#[test]
fn missing_action_is_an_unexpected_error() {
    let output = ag_helper(&[
        "--hostname",
        "localhost",
        "--port",
        "1433",
        "--ag-name",
        "ag1",
        "--credentials-file",
        "/nonexistent/credentials",
        "--application-name",
        "args-test",
    ]);

    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: "));
    assert!(stderr.contains("a valid action must be specified using --action"));
}

#[test]
fn promote_requires_a_new_master() {
    let output = ag_helper(&[
        "--hostname",
        "localhost",
        "--port",
        "1433",
        "--ag-name",
        "ag1",
        "--credentials-file",
        "/nonexistent/credentials",
        "--application-name",
        "promote-test",
        "--action",
        "promote",
    ]);

    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("a valid hostname must be specified using --new-master"));
}

#[test]
fn out_of_range_rsstc_override_is_a_configuration_error() {
    let output = ag_helper(&[
        "--hostname",
        "localhost",
        "--port",
        "1433",
        "--ag-name",
        "ag1",
        "--credentials-file",
        "/nonexistent/credentials",
        "--application-name",
        "rsstc-test",
        "--action",
        "monitor",
        "--required-synchronized-secondaries-to-commit",
        "-2",
    ]);

    // OCF_ERR_CONFIGURED (6) offset by 10, reported before any connection
    // attempt.
    assert_eq!(output.status.code(), Some(16));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("Attempt 1 to connect"));
}

#[test]
fn unreadable_credentials_fail_with_err_args() {
    let output = ag_helper(&[
        "--hostname",
        "localhost",
        "--port",
        "1433",
        "--ag-name",
        "ag1",
        "--credentials-file",
        "/nonexistent/credentials",
        "--application-name",
        "credentials-test",
        "--action",
        "monitor",
    ]);

    // OCF_ERR_ARGS (2) offset by 10.
    assert_eq!(output.status.code(), Some(12));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Could not read credentials file"));
}

#[test]
fn unreachable_instance_fails_the_health_threshold() {
    let credentials = credentials_file();
    let port = refused_port().to_string();

    let output = ag_helper(&[
        "--hostname",
        "127.0.0.1",
        "--port",
        &port,
        "--ag-name",
        "ag1",
        "--credentials-file",
        credentials.path().to_str().unwrap(),
        "--application-name",
        "timeout-test",
        "--connection-timeout",
        "2",
        "--action",
        "monitor",
    ]);

    // Down-or-unresponsive (1) is at or below the default threshold (3),
    // so the action fails with OCF_ERR_GENERIC (1) offset by 10.
    assert_eq!(output.status.code(), Some(11));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Attempt 1 to connect to the instance"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Instance health status 1 is at or below the threshold value of 3"));
}

#[test]
fn fci_requires_a_virtual_server_name() {
    let output = fci_helper(&[
        "--hostname",
        "localhost",
        "--port",
        "1433",
        "--credentials-file",
        "/nonexistent/credentials",
        "--application-name",
        "fci-test",
        "--action",
        "monitor",
    ]);

    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("a valid virtual server name must be specified using --virtual-server-name"));
}

#[test]
fn fci_unreachable_instance_fails_the_health_threshold() {
    let credentials = credentials_file();
    let port = refused_port().to_string();

    let output = fci_helper(&[
        "--hostname",
        "127.0.0.1",
        "--port",
        &port,
        "--credentials-file",
        credentials.path().to_str().unwrap(),
        "--application-name",
        "fci-timeout-test",
        "--connection-timeout",
        "2",
        "--action",
        "monitor",
        "--virtual-server-name",
        "vsql",
    ]);

    assert_eq!(output.status.code(), Some(11));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Instance health status 1 is at or below the threshold value of 3"));
}
