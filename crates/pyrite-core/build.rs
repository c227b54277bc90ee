//! Build script for pyrite-core
//!
//! This script checks system requirements before compilation:
//! - Minimum Rust version (let-else and `is_some_and` need Rust 1.70.0+)
//! - Target platform (the process-control backend is Linux x86-64 only)
//!
//! ## Requirements
//!
//! - **Rust**: 1.70.0 or newer
//! - **Linux x86-64**: for a working backend; other targets build without one

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 70, 0);

        if rustc_version < min_rust_version {
            panic!("pyrite-core requires Rust {min_rust_version} or newer, found {rustc_version}");
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    check_target();
}

fn check_target()
{
    // Cargo describes the target, not the host, through these
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    if os != "linux" || arch != "x86_64" {
        println!("cargo:warning=pyrite-core has no process-control backend for {os}-{arch}; attaching will fail at runtime");
    }
}
