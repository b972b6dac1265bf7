use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::config::FilesError;

/// Chunk size used when streaming a file through the hasher. Mirrors the
/// buffered reader the store crate this was grounded on uses for the same
/// purpose, just with a content-addressed hash suited to the new wire type.
const CHUNK_SIZE: usize = 8192;

/// Computes the BLAKE3 digest of a file's contents, streaming it in fixed
/// size chunks rather than reading the whole file into memory. Used only to
/// short-circuit redundant copies between tiers -- never as a security
/// boundary.
pub fn digest_file(path: &Path) -> Result<String, FilesError> {
    let file = File::open(path).map_err(|e| FilesError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).map_err(|e| FilesError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn matches_a_direct_blake3_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello world")
            .unwrap();
        let digest = digest_file(&path).unwrap();
        assert_eq!(digest, blake3::hash(b"hello world").to_hex().to_string());
    }

    #[test]
    fn spans_more_than_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let content = vec![7u8; CHUNK_SIZE * 3 + 17];
        std::fs::write(&path, &content).unwrap();
        let digest = digest_file(&path).unwrap();
        assert_eq!(digest, blake3::hash(&content).to_hex().to_string());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = digest_file(Path::new("/nonexistent/quickdist-digest-test")).unwrap_err();
        assert!(matches!(err, FilesError::Io { .. }));
    }
}
