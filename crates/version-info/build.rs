fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LOOPDNS_VERSION");
    if std::path::Path::new("../../.git/HEAD").exists() {
        println!("cargo:rerun-if-changed=../../.git/HEAD");
    }

    // Release builds set LOOPDNS_VERSION in the environment. Everything
    // else is a dev build, stamped from git where a checkout is
    // available and from the package version otherwise.
    let version = std::env::var("LOOPDNS_VERSION")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(git_describe)
        .unwrap_or_else(|| {
            format!(
                "{}-dev",
                std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string())
            )
        });

    println!("cargo:rustc-env=LOOPDNS_VERSION={version}");
}

fn git_describe() -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let described = String::from_utf8(output.stdout).ok()?;
    let described = described.trim();
    if described.is_empty() {
        None
    } else {
        Some(described.to_string())
    }
}
