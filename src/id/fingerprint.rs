//! Stable content+parameter fingerprints.
//!
//! An instance fingerprint equates two image instances: same source file
//! (path, mtime, size), same final cell box and same format parameters.
//! A source fingerprint covers only the file identity and keys transcode
//! cache entries.

use crate::utils::time::mtime_ns;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// 128-bit fingerprint, rendered as 32 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    fn from_hasher(hasher: Sha256) -> Fingerprint {
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Fingerprint(bytes)
    }

    pub fn hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Format parameters that are part of an instance's identity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FormatParams {
    pub format: Option<String>,
    pub quality: Option<u8>,
}

impl FormatParams {
    fn describe(&self) -> String {
        format!(
            "{}:{}",
            self.format.as_deref().unwrap_or("-"),
            self.quality.map(|q| q.to_string()).unwrap_or_default()
        )
    }
}

/// Normalise a path to an absolute form without touching symlinks; a
/// vanished file still has to fingerprint the same way it did before.
pub fn normalize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Fingerprint of one image instance: one source at one cell box.
pub fn instance_fingerprint(
    path: &Path,
    mtime_nanos: i64,
    byte_size: u64,
    cols: u32,
    rows: u32,
    params: &FormatParams,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(b"ikup:file\0");
    hasher.update(normalize_path(path).to_string_lossy().as_bytes());
    hasher.update([0]);
    hasher.update(mtime_nanos.to_le_bytes());
    hasher.update(byte_size.to_le_bytes());
    hasher.update(cols.to_le_bytes());
    hasher.update(rows.to_le_bytes());
    hasher.update(params.describe().as_bytes());
    Fingerprint::from_hasher(hasher)
}

/// Fingerprint of the source file alone, independent of any cell box.
/// mtime+size change means a different source.
pub fn source_fingerprint(path: &Path) -> Fingerprint {
    let normalized = normalize_path(path);
    let size = std::fs::metadata(&normalized).map(|m| m.len()).unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(b"ikup:src\0");
    hasher.update(normalized.to_string_lossy().as_bytes());
    hasher.update([0]);
    hasher.update(mtime_ns(&normalized).to_le_bytes());
    hasher.update(size.to_le_bytes());
    Fingerprint::from_hasher(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let params = FormatParams::default();
        let a = instance_fingerprint(Path::new("/tmp/a.png"), 100, 5, 10, 4, &params);
        let b = instance_fingerprint(Path::new("/tmp/a.png"), 100, 5, 10, 4, &params);
        assert_eq!(a, b);
        assert_eq!(a.hex().len(), 32);

        // Any identity component changing produces a new fingerprint.
        assert_ne!(
            a,
            instance_fingerprint(Path::new("/tmp/b.png"), 100, 5, 10, 4, &params)
        );
        assert_ne!(
            a,
            instance_fingerprint(Path::new("/tmp/a.png"), 101, 5, 10, 4, &params)
        );
        assert_ne!(
            a,
            instance_fingerprint(Path::new("/tmp/a.png"), 100, 6, 10, 4, &params)
        );
        assert_ne!(
            a,
            instance_fingerprint(Path::new("/tmp/a.png"), 100, 5, 11, 4, &params)
        );
        let jpeg = FormatParams {
            format: Some("jpeg".into()),
            quality: Some(80),
        };
        assert_ne!(
            a,
            instance_fingerprint(Path::new("/tmp/a.png"), 100, 5, 10, 4, &jpeg)
        );
    }

    #[test]
    fn test_source_fingerprint_tracks_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        std::fs::write(&path, b"one").unwrap();
        let first = source_fingerprint(&path);
        assert_eq!(first, source_fingerprint(&path));
        std::fs::write(&path, b"four").unwrap();
        // Size changed, so the fingerprint must change.
        assert_ne!(first, source_fingerprint(&path));
    }
}
