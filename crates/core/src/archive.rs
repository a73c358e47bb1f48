//! Binary profile archive.
//!
//! Counting tools can save their final report next to the text output so it
//! can be reloaded and rendered again (`mempin --show`). The archive uses
//! bincode serialization with deflate compression.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "MPZA"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Tool id          |  u8
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode ProfileReport
//! +------------------+
//! ```

use std::path::Path;

use crate::error::{ProfileError, Result};
use crate::report::ProfileReport;
use crate::tools::ToolKind;

const MAGIC: &[u8; 4] = b"MPZA";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 9;

/// Save `report`, produced by `tool`, to `path`.
pub fn save_archive(report: &ProfileReport, tool: ToolKind, path: &Path) -> Result<()> {
    check_tool(report, tool)?;
    let payload = bincode::serialize(report)?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(tool.id() as u8);
    out.extend_from_slice(&compressed);

    std::fs::write(path, &out)?;
    Ok(())
}

/// Load an archive, verifying magic, version and that the tool id matches the report.
pub fn load_archive(path: &Path) -> Result<(ToolKind, ProfileReport)> {
    let data = std::fs::read(path)?;

    if data.len() < HEADER_LEN {
        return Err(ProfileError::Archive("file too small".into()));
    }
    if &data[0..4] != MAGIC {
        return Err(ProfileError::Archive("bad magic".into()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(ProfileError::Archive(format!(
            "unsupported version {} (expected {})", version, FORMAT_VERSION)));
    }
    let tool = ToolKind::from_id(data[8] as i32)
        .ok_or_else(|| ProfileError::Archive(format!("unknown tool id {}", data[8])))?;

    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[HEADER_LEN..])
        .map_err(|e| ProfileError::Archive(format!("decompress error: {:?}", e)))?;
    let report: ProfileReport = bincode::deserialize(&decompressed)?;
    check_tool(&report, tool)?;
    Ok((tool, report))
}

fn check_tool(report: &ProfileReport, tool: ToolKind) -> Result<()> {
    if report.tool() != tool {
        return Err(ProfileError::Archive(format!(
            "{} report tagged as {}", report.tool().name(), tool.name())));
    }
    Ok(())
}
