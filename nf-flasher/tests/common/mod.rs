//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Create a firmware file with specific size and a simple repeating pattern.
pub fn create_test_image(name: &str, size: usize) -> std::io::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("{}_{name}", uuid::Uuid::new_v4()));

    let mut file = File::create(&path)?;

    let pattern: Vec<u8> = (0..256).map(|x| x as u8).collect();
    let chunks = size / pattern.len();
    let remainder = size % pattern.len();

    for _ in 0..chunks {
        file.write_all(&pattern)?;
    }
    if remainder > 0 {
        file.write_all(&pattern[..remainder])?;
    }

    file.flush()?;
    Ok(path)
}

/// Cleanup test files, ignoring non-existent paths.
pub fn cleanup_test_file(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// A serial port name no other test uses, so device locks never collide.
pub fn unique_port() -> String {
    format!("test-{}", uuid::Uuid::new_v4())
}
