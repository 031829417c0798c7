//! Shared helpers for the integration tests.

#![allow(dead_code)]

#[path = "../../src/test/builder.rs"]
mod builder;

pub use builder::{pattern, PeBuilder};

use std::{fs, path::PathBuf};

use tempfile::TempDir;

/// Write `data` into a fresh temporary directory and return both.
pub fn write_temp(name: &str, data: &[u8]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    (dir, path)
}
