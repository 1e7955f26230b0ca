use std::process::Command;

/// Commit reported by `GET /health`.
///
/// Packagers building from a source tarball set `TASKCRON_GIT_SHA`
/// themselves; otherwise ask git, and fall back to "unknown".
fn commit() -> String {
    if let Ok(sha) = std::env::var("TASKCRON_GIT_SHA") {
        if !sha.trim().is_empty() {
            return sha.trim().to_string();
        }
    }
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|sha| !sha.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=TASKCRON_GIT_SHA={}", commit());
    println!("cargo:rerun-if-env-changed=TASKCRON_GIT_SHA");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
}
