//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// 32-byte key in hex form.
pub const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git should run");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Bare repository at `<root>/origin.git` with one commit on `main` and a
/// `develop` branch one commit ahead.
pub fn seed_remote(root: &Path) -> PathBuf {
    let work = root.join("seed");
    std::fs::create_dir_all(&work).unwrap();
    git(&work, &["init", "-q"]);
    git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(work.join("README.md"), "# widgets\n").unwrap();
    git(&work, &["add", "."]);
    git(&work, &["commit", "-q", "-m", "initial"]);
    git(&work, &["checkout", "-q", "-b", "develop"]);
    std::fs::write(work.join("CHANGELOG.md"), "unreleased\n").unwrap();
    git(&work, &["add", "."]);
    git(&work, &["commit", "-q", "-m", "changelog"]);
    git(&work, &["checkout", "-q", "main"]);

    let bare = root.join("origin.git");
    git(
        root,
        &["clone", "-q", "--bare", work.to_str().unwrap(), bare.to_str().unwrap()],
    );
    bare
}

pub fn envelope(job_id: &str, user_id: &str, repo_url: &str, prompt: &str) -> HashMap<String, String> {
    [
        ("job_id", job_id),
        ("user_id", user_id),
        ("repo_url", repo_url),
        ("prompt", prompt),
        ("environment", "staging"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// `job-*` entries left under `dir`.
pub fn job_dirs(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("job-"))
                        .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default()
}
