// src/util.rs

//! Filesystem and environment helpers shared by the import pipeline.

use crate::error::{Error, Result};
use base64::Engine;
use nix::sys::statvfs::statvfs;
use std::path::Path;

/// Fixed temporary filename used for scratch-space transfers.
pub const TMP_IMPORT_FILE: &str = "disk.img";

/// Available bytes on the filesystem backing `path`.
///
/// Returns -1 when the path cannot be examined, so corrupt or inaccessible
/// scratch directories hit the same gate as full filesystems.
pub fn available_space(path: &Path) -> i64 {
    match statvfs(path) {
        Ok(stat) => {
            let bytes = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
            i64::try_from(bytes).unwrap_or(i64::MAX)
        }
        Err(_) => -1,
    }
}

/// Read an environment variable, optionally base64-decoding the value.
///
/// Credential material is commonly injected base64-encoded. A missing
/// variable is not an error and yields an empty string.
pub fn parse_env_var(name: &str, decode: bool) -> Result<String> {
    let value = std::env::var(name).unwrap_or_default();
    if !decode {
        return Ok(value);
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&value)
        .map_err(|_| Error::EnvVar(name.to_string()))?;
    String::from_utf8(bytes).map_err(|_| Error::EnvVar(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_space_on_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(available_space(dir.path()) > 0);
    }

    #[test]
    fn test_available_space_on_missing_path() {
        assert_eq!(available_space(Path::new("/no/such/scratch/dir")), -1);
    }

    #[test]
    fn test_parse_env_var_plain() {
        // SAFETY: test-local variable, no other thread reads it
        unsafe { std::env::set_var("DISKIMPORT_TEST_PLAIN", "owner-123") };
        assert_eq!(
            parse_env_var("DISKIMPORT_TEST_PLAIN", false).unwrap(),
            "owner-123"
        );
    }

    #[test]
    fn test_parse_env_var_missing_is_empty() {
        assert_eq!(parse_env_var("DISKIMPORT_TEST_UNSET", false).unwrap(), "");
    }

    #[test]
    fn test_parse_env_var_base64() {
        unsafe { std::env::set_var("DISKIMPORT_TEST_B64", "c2VjcmV0") };
        assert_eq!(parse_env_var("DISKIMPORT_TEST_B64", true).unwrap(), "secret");
    }

    #[test]
    fn test_parse_env_var_bad_base64() {
        unsafe { std::env::set_var("DISKIMPORT_TEST_BAD", "not base64!!") };
        assert!(matches!(
            parse_env_var("DISKIMPORT_TEST_BAD", true),
            Err(Error::EnvVar(_))
        ));
    }
}
