// build.rs

use std::env;

/// Release builds may override the reported version via `PXYPOOL_VERSION`.
fn main() {
    println!("cargo:rerun-if-env-changed=PXYPOOL_VERSION");

    let version = env::var("PXYPOOL_VERSION")
        .or_else(|_| env::var("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| "dev".into());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".into());

    println!("cargo:rustc-env=PXYPOOL_BUILD_VERSION={version} ({profile})");
}
