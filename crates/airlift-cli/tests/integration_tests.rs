//! Integration tests for CLI commands
//!
//! Cluster-facing commands are exercised up to the point where a cluster
//! would be contacted; everything before that (argument handling, archive
//! verification, descriptor output) runs for real against generated
//! bundles.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Helper to run the airlift binary
fn airlift(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_airlift"))
        .args(args)
        .output()
        .expect("failed to execute airlift")
}

/// Build a minimal valid bundle archive in `dir`.
fn write_bundle(dir: &Path) -> PathBuf {
    let descriptor = "kind: AppConfig\nmetadata:\n  name: demo\ncomponents:\n  - name: web\n    required: true\n";
    let checksums = format!(
        "{}  airlift.yaml\n",
        airlift_core::sha256_bytes(descriptor.as_bytes())
    );

    let tar_path = dir.join("demo.tar");
    let file = std::fs::File::create(&tar_path).unwrap();
    let mut builder = tar::Builder::new(file);
    for (name, data) in [
        ("airlift.yaml", descriptor.as_bytes()),
        ("checksums.txt", checksums.as_bytes()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }
    builder.into_inner().unwrap();
    tar_path
}

mod inspect_command {
    use super::*;

    #[test]
    fn prints_descriptor_of_valid_bundle() {
        let temp = tempfile::TempDir::new().unwrap();
        let archive = write_bundle(temp.path());

        let output = airlift(&["inspect", archive.to_str().unwrap()]);
        assert!(output.status.success(), "inspect should succeed");

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("kind: AppConfig"));
        assert!(stdout.contains("name: demo"));
    }

    #[test]
    fn rejects_tampered_bundle() {
        let temp = tempfile::TempDir::new().unwrap();
        let descriptor = "kind: AppConfig\nmetadata:\n  name: demo\n";
        // Checksums that do not match the descriptor.
        let checksums = format!("{}  airlift.yaml\n", airlift_core::sha256_bytes(b"other"));

        let tar_path = temp.path().join("bad.tar");
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in [
            ("airlift.yaml", descriptor.as_bytes()),
            ("checksums.txt", checksums.as_bytes()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.into_inner().unwrap();

        let output = airlift(&["inspect", tar_path.to_str().unwrap()]);
        assert!(!output.status.success(), "tampered bundle must fail");

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("checksum"), "error should name the checksum: {stderr}");
    }

    #[test]
    fn missing_source_fails_with_path() {
        let output = airlift(&["inspect", "/no/such/bundle.tar"]);
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("/no/such/bundle.tar"));
    }
}

mod deploy_command {
    use super::*;

    #[test]
    fn refuses_without_confirmation_when_not_interactive() {
        let temp = tempfile::TempDir::new().unwrap();
        let archive = write_bundle(temp.path());

        let output = airlift(&["deploy", archive.to_str().unwrap()]);
        assert!(!output.status.success());

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("--confirm"));
    }

    #[test]
    fn rejects_malformed_set_flag() {
        let temp = tempfile::TempDir::new().unwrap();
        let archive = write_bundle(temp.path());

        let output = airlift(&[
            "deploy",
            archive.to_str().unwrap(),
            "--confirm",
            "--set",
            "NO_EQUALS_SIGN",
        ]);
        assert!(!output.status.success());

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("KEY=VALUE"));
    }
}

mod remove_command {
    use super::*;

    #[test]
    fn refuses_without_confirmation_when_not_interactive() {
        let output = airlift(&["remove", "demo"]);
        assert!(!output.status.success());

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("--confirm"));
    }
}
