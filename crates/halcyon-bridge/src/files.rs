//! Temp-file convention for payloads too large for a ring.
//!
//! Chunks and oversized custom-data values never travel through the rings;
//! the sender writes a file in the OS temp directory named after the
//! audio-pool suffix and sends the path instead. The receiver deletes the
//! file after reading. Chunks are base64 text, custom-data values plain
//! UTF-8.

use crate::error::{BridgeError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::path::{Path, PathBuf};

pub fn chunk_file_path(pool_suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!(".HalcyonChunk_{pool_suffix}"))
}

pub fn custom_data_file_path(pool_suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!(".HalcyonCustomData_{pool_suffix}"))
}

/// Write chunk bytes as base64. Returns the path to send over the wire.
pub fn write_chunk_file(pool_suffix: &str, data: &[u8]) -> Result<PathBuf> {
    let path = chunk_file_path(pool_suffix);
    std::fs::write(&path, BASE64.encode(data))?;
    Ok(path)
}

/// Read a chunk file and delete it. The file is gone even when decoding
/// fails; a half-read state file is worse than none.
pub fn read_and_delete_chunk_file(path: &Path) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path)?;
    let _ = std::fs::remove_file(path);
    BASE64
        .decode(text.trim())
        .map_err(|e| BridgeError::ProtocolDesync(format!("chunk file is not valid base64: {e}")))
}

/// Write an oversized custom-data value. Returns the path to send.
pub fn write_custom_data_file(pool_suffix: &str, value: &str) -> Result<PathBuf> {
    let path = custom_data_file_path(pool_suffix);
    std::fs::write(&path, value)?;
    Ok(path)
}

/// Read an oversized custom-data value and delete its file.
pub fn read_and_delete_custom_data_file(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)?;
    let _ = std::fs::remove_file(path);
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_suffix(tag: &str) -> String {
        format!("{tag}{:06}", std::process::id() % 1_000_000)
    }

    #[test]
    fn test_chunk_round_trip_and_cleanup() {
        let suffix = unique_suffix("ck");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let path = write_chunk_file(&suffix, &payload).unwrap();
        assert!(path.exists());
        let back = read_and_delete_chunk_file(&path).unwrap();
        assert_eq!(back, payload);
        assert!(!path.exists());
    }

    #[test]
    fn test_chunk_file_is_base64_text() {
        let suffix = unique_suffix("b6");
        let path = write_chunk_file(&suffix, &[0xFF, 0x00, 0x10]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric() || "+/=".contains(c)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_custom_data_round_trip_and_cleanup() {
        let suffix = unique_suffix("cd");
        let value = "x".repeat(20_000);
        let path = write_custom_data_file(&suffix, &value).unwrap();
        let back = read_and_delete_custom_data_file(&path).unwrap();
        assert_eq!(back, value);
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_chunk_reports_error_and_still_deletes() {
        let suffix = unique_suffix("bad");
        let path = chunk_file_path(&suffix);
        std::fs::write(&path, "this is !!! not base64").unwrap();
        assert!(read_and_delete_chunk_file(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let path = chunk_file_path(&unique_suffix("missing"));
        assert!(matches!(
            read_and_delete_chunk_file(&path).unwrap_err(),
            BridgeError::Io(_)
        ));
    }
}
