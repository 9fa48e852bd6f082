//! The operations a storage service must provide to back a blobstore
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::File;
use url::Url;

use crate::{checksum::Checksum, error::Result};

/// Raw object storage operations.
///
/// Implementations report a missing blob as [`BlobstoreError::BlobNotFound`] so
/// that callers can tell it apart from every other failure without looking at
/// error text.  They make no attempt to hide it; that is the job of
/// [`BlobstoreClient`].
///
/// [`BlobstoreError::BlobNotFound`]: crate::error::BlobstoreError::BlobNotFound
/// [`BlobstoreClient`]: crate::blobstore::BlobstoreClient
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Uploads the content of `source` to `key`, replacing any existing blob
    ///
    /// # Returns
    ///
    /// The MD5 checksum the service computed over the blob it wrote
    async fn upload(&self, key: &str, source: File) -> Result<Checksum>;

    /// Streams the blob at `key` into `destination`
    ///
    /// # Returns
    ///
    /// The size of the blob as reported by the service
    async fn download(&self, key: &str, destination: &mut File) -> Result<u64>;

    /// Deletes the blob at `key`
    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetches the properties of the blob at `key` without its content
    async fn get_properties(&self, key: &str) -> Result<BlobProperties>;

    /// Creates a URL granting `permissions` on `key` until `expiry`
    async fn signed_url(
        &self,
        key: &str,
        permissions: SasPermissions,
        expiry: DateTime<Utc>,
    ) -> Result<Url>;

    /// Lists one page of blob names, optionally restricted to a prefix
    ///
    /// # Arguments
    ///
    /// * `prefix` - Only blobs whose name starts with this prefix are returned
    /// * `marker` - The `next_marker` of the previous page, `None` for the first page
    async fn list_page(&self, prefix: Option<&str>, marker: Option<&str>) -> Result<ListPage>;

    /// Copies `source` to `destination` within the container
    async fn copy(&self, source: &str, destination: &str) -> Result<()>;
}

/// Properties of a stored blob
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobProperties {
    /// The size of the blob in bytes
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// The MD5 stored with the blob, if the service has one
    pub content_md5: Option<Checksum>,
    /// The status of the last copy operation that targeted this blob
    pub copy_status: Option<CopyStatus>,
}

/// Status of a server side copy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Aborted,
    Failed,
}

impl CopyStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CopyStatus::Pending),
            "success" => Some(CopyStatus::Success),
            "aborted" => Some(CopyStatus::Aborted),
            "failed" => Some(CopyStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Pending => "pending",
            CopyStatus::Success => "success",
            CopyStatus::Aborted => "aborted",
            CopyStatus::Failed => "failed",
        }
    }
}

/// One page of a listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Blob names in the order the service returned them
    pub names: Vec<String>,
    /// Continuation marker, `None` on the last page
    pub next_marker: Option<String>,
}

/// The capabilities granted by a signed URL
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SasPermissions {
    pub read: bool,
    pub create: bool,
    pub write: bool,
}

impl SasPermissions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Read plus everything needed to write a blob that may not exist yet
    pub fn read_write() -> Self {
        Self {
            read: true,
            create: true,
            write: true,
        }
    }
}

/// Renders the permissions in the order the service requires
impl fmt::Display for SasPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.create {
            f.write_str("c")?;
        }
        if self.write {
            f.write_str("w")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_render_in_canonical_order() {
        assert_eq!(SasPermissions::read_only().to_string(), "r");
        assert_eq!(SasPermissions::read_write().to_string(), "rcw");
        let create_write = SasPermissions {
            write: true,
            create: true,
            read: false,
        };
        assert_eq!(create_write.to_string(), "cw");
    }

    #[test]
    fn copy_status_round_trips_service_values() {
        for status in [
            CopyStatus::Pending,
            CopyStatus::Success,
            CopyStatus::Aborted,
            CopyStatus::Failed,
        ] {
            assert_eq!(CopyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CopyStatus::parse("unknown"), None);
    }
}
