//! MD5 checksums used to verify uploads
use std::{fmt, path::Path};

use tokio::{fs::File, io::AsyncReadExt};

use crate::error::Result;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// The MD5 digest of a blob's content.
///
/// A checksum reported by the storage service may be empty if the service did
/// not send one.  An empty checksum never equals a computed one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Checksum(Vec<u8>);

impl Checksum {
    pub fn compute(data: &[u8]) -> Self {
        Self(md5::compute(data).0.to_vec())
    }

    /// Reads the file at `path` to the end and returns the MD5 of its content
    pub async fn of_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path).await?;
        let mut context = md5::Context::new();
        let mut buffer = vec![0_u8; READ_BUFFER_SIZE];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            context.consume(&buffer[..read]);
        }
        Ok(Self(context.compute().0.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Checksum {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&hex::encode(&self.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn file_checksum_matches_in_memory_checksum() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // Larger than one read buffer so the streaming path is exercised
        let content = vec![7_u8; READ_BUFFER_SIZE * 2 + 13];
        file.write_all(&content).unwrap();

        let checksum = Checksum::of_file(file.path()).await.unwrap();
        assert_eq!(checksum, Checksum::compute(&content));
    }

    #[tokio::test]
    async fn empty_file_has_well_known_digest() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let checksum = Checksum::of_file(file.path()).await.unwrap();
        assert_eq!(checksum.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = Checksum::of_file("the/path/does/not/exist").await.unwrap_err();
        assert!(matches!(err, crate::error::BlobstoreError::Io(_)));
    }

    #[test]
    fn empty_checksum_never_matches() {
        assert_ne!(Checksum::default(), Checksum::compute(b""));
        assert_eq!(Checksum::default().to_string(), "<none>");
    }
}
