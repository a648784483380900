//! Build script for lanportal
//!
//! Keeps a build counter in the BUILD file and exposes it to the crate as
//! `LANPORTAL_BUILD_NUMBER`.

use std::fs;
use std::path::Path;

fn main() {
    let build_file = Path::new("BUILD");
    let current_build = fs::read_to_string(build_file)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(0);

    let new_build = current_build + 1;

    if let Err(e) = fs::write(build_file, new_build.to_string()) {
        eprintln!("Warning: Failed to update BUILD file: {}", e);
    }

    println!("cargo:rustc-env=LANPORTAL_BUILD_NUMBER={}", new_build);
    println!("cargo:rerun-if-changed=BUILD");
    println!("cargo:rerun-if-changed=src");
}
