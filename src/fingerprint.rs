//! Content fingerprinting.
//!
//! Files are identified by the SHA-256 of their contents, streamed in
//! 8 KiB chunks so large files never sit in memory just to be hashed.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

const CHUNK_SIZE: usize = 8192;

/// SHA-256 hex digest of a file's contents.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 hex digest of an in-memory buffer.
pub fn hash_content(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_content_known_value() {
        // SHA-256 of "hello" is well-known
        assert_eq!(
            hash_content(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hash_file_matches_content_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.txt");
        std::fs::write(&path, "some file content").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            hash_content(b"some file content")
        );
    }

    #[test]
    fn test_hash_file_streams_past_chunk_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("big.txt");
        let data = vec![0x41u8; CHUNK_SIZE * 3 + 17];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_content(&data));
    }

    #[test]
    fn test_hash_file_missing_errors() {
        assert!(hash_file(Path::new("/nonexistent/file")).is_err());
    }

    #[test]
    fn test_digest_is_lowercase_hex() {
        let digest = hash_content(b"x");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
