//! Streaming MD5 digests.
//!
//! The drive uses MD5 both as the dedup key for instant transfers and as the
//! integrity check at upload commit; it is a content fingerprint here, not a
//! security boundary.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::{Digest, Md5};

const READ_CHUNK: usize = 1024 * 1024;

/// Computes the lowercase hex MD5 digest of a file's current contents.
pub fn file_md5(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes the lowercase hex MD5 digest of a byte slice.
pub fn bytes_md5(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_digest() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            file_md5(tmp.path()).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn known_vector() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("abc.txt");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            file_md5(&path).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn file_and_bytes_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        let data: Vec<u8> = (0..=255).cycle().take(3 * READ_CHUNK + 17).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(file_md5(&path).unwrap(), bytes_md5(&data));
    }

    #[test]
    fn missing_file_errors() {
        assert!(file_md5(Path::new("/definitely/not/here")).is_err());
    }
}
