//! Hashing - SHA-256 Keys for Compiled Artifacts
//!
//! Cache file names are derived from the source path only, never from its
//! contents, so a path always maps to the same artifact.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Normalized textual form of a source path: forward slashes, no trailing
/// separator.
pub fn normalized_path_key(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() { raw } else { trimmed.to_string() }
}

/// Hash identifying the compiled artifact of a source path.
pub fn artifact_key(source_path: &Path) -> String {
    sha256_hex(normalized_path_key(source_path).as_bytes())
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"test data";
        let h1 = sha256_hex(data);
        let h2 = sha256_hex(data);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_artifact_key_ignores_separator_style() {
        let a = artifact_key(Path::new("views/layouts/app.html"));
        let b = artifact_key(Path::new("views\\layouts\\app.html"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_paths_distinct_keys() {
        let a = artifact_key(Path::new("/srv/views/a.html"));
        let b = artifact_key(Path::new("/srv/views/b.html"));
        assert_ne!(a, b);
    }
}
