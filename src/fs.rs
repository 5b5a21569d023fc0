use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Read a whole file into memory.
pub fn read_file_as_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read file {:?}", path))
}
