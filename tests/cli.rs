//! CLI test cases.
//!
//! The server cannot be exercised meaningfully without an OCR engine binary,
//! so these stick to the argument surface; the pool and HTTP behavior is
//! covered by `pool.rs` and `server.rs` against scripted engines.

use std::process::Command;

use assert_cmd::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("ocr-pool").unwrap();
    // Disable color so any RUST_LOG output is readable.
    cmd.env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}
