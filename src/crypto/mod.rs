use ring::digest;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Hex SHA-256 of a whole file's bytes
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, data);
    hex::encode(hash.as_ref())
}

/// Hex SHA-256 of one chunk's bytes
pub fn chunk_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare a chunk against its declared checksum (case-insensitive hex)
pub fn verify_chunk(data: &[u8], expected: &str) -> bool {
    chunk_checksum(data).eq_ignore_ascii_case(expected)
}

/// Compute SHA-256 hash for a file on disk
pub async fn compute_file_hash<P: AsRef<Path>>(path: P) -> Result<String, std::io::Error> {
    let mut file = File::open(path).await?;
    let mut context = digest::Context::new(&digest::SHA256);
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let count = file.read(&mut buffer).await?;
        if count == 0 {
            break;
        }
        context.update(&buffer[..count]);
    }

    Ok(hex::encode(context.finish().as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_both_digests_agree() {
        assert_eq!(sha256_hex(b"hello"), HELLO_SHA256);
        assert_eq!(chunk_checksum(b"hello"), HELLO_SHA256);
    }

    #[test]
    fn test_verify_chunk() {
        assert!(verify_chunk(b"hello", &HELLO_SHA256.to_uppercase()));
        assert!(!verify_chunk(b"hellO", HELLO_SHA256));
    }

    #[tokio::test]
    async fn test_compute_file_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        assert_eq!(compute_file_hash(file.path()).await.unwrap(), HELLO_SHA256);
    }
}
