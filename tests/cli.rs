//! Runs the compiled binary for the commands that need no running fleet.

use std::process::Command;

fn hydra() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_hydra"));
    cmd.env_remove("HYDRA_HOST_PREFIX").env_remove("HYDRA_BACKENDS_PER_KIND");
    cmd
}

#[test]
fn print_hosts_lists_every_backend_name() {
    let output = hydra()
        .args(["print-hosts", "-n", "2", "--host-prefix", "lab", "--ip", "10.0.0.7"])
        .output()
        .expect("run hydra");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            "10.0.0.7 lab-edge-0",
            "10.0.0.7 lab-edge-1",
            "10.0.0.7 lab-http-0",
            "10.0.0.7 lab-http-1",
            "10.0.0.7 lab-passthrough-0",
            "10.0.0.7 lab-passthrough-1",
            "10.0.0.7 lab-reencrypt-0",
            "10.0.0.7 lab-reencrypt-1",
        ]
    );
}

#[test]
fn invalid_backend_count_fails() {
    let output = hydra().args(["print-hosts", "-n", "0", "--ip", "10.0.0.7"]).output().expect("run hydra");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error"));
}

#[test]
fn backends_against_missing_service_fails() {
    let port = reserve_port::ReservedPort::random().unwrap();
    let url = format!("http://127.0.0.1:{}", port.port());
    drop(port);

    let output = hydra().args(["backends", "--metadata-url", &url]).output().expect("run hydra");
    assert!(!output.status.success());
}
