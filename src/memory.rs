//! An in-memory backend for tests
//!
//! Blobs live in a sorted map, so listings come back in name order like they do
//! from the real service.  Every call is recorded and individual operations can
//! be made to fail, which lets tests check exactly what a client asked the
//! backend to do.
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};
use url::Url;

use crate::{
    backend::{BlobProperties, ListPage, SasPermissions, StorageBackend},
    checksum::Checksum,
    error::{BlobstoreError, Result},
};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// The backend operations, used to record calls and to target faults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Download,
    Delete,
    GetProperties,
    SignedUrl,
    ListPage,
    Copy,
}

/// A recorded backend call.  `key` is the blob name, the prefix for listings and
/// the source for copies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    pub key: String,
}

struct Fault {
    operation: Operation,
    key: Option<String>,
    error: fn(&str) -> BlobstoreError,
}

#[derive(Default)]
struct State {
    blobs: BTreeMap<String, Bytes>,
    calls: Vec<Call>,
    faults: Vec<Fault>,
}

pub struct MemoryBackend {
    container: String,
    page_size: usize,
    corrupt_uploads: bool,
    short_downloads: bool,
    state: Mutex<State>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            container: "memory".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            corrupt_uploads: false,
            short_downloads: false,
            state: Mutex::new(State::default()),
        }
    }

    /// Limits how many names a single listing page returns
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Makes uploads report a checksum that does not match the stored content
    pub fn with_corrupt_uploads(mut self) -> Self {
        self.corrupt_uploads = true;
        self
    }

    /// Makes downloads stop one byte short while still reporting the full size
    pub fn with_short_downloads(mut self) -> Self {
        self.short_downloads = true;
        self
    }

    /// Makes every `operation` on `key` (or on any key if `None`) fail with
    /// the error built by `error`
    pub fn fail_on(
        self,
        operation: Operation,
        key: Option<&str>,
        error: fn(&str) -> BlobstoreError,
    ) -> Self {
        self.lock().faults.push(Fault {
            operation,
            key: key.map(str::to_string),
            error,
        });
        self
    }

    /// Stores a blob directly, without recording a call
    pub fn insert(&self, key: &str, content: impl Into<Bytes>) {
        self.lock().blobs.insert(key.to_string(), content.into());
    }

    pub fn contents(&self, key: &str) -> Option<Bytes> {
        self.lock().blobs.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().blobs.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// The keys of every recorded call to `operation`, in call order
    pub fn calls_to(&self, operation: Operation) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .map(|call| call.key.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the recorded calls
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, operation: Operation, key: &str) -> Result<()> {
        self.enter(operation, key).map(|_| ())
    }

    /// Records the call and returns the injected failure, if any
    fn enter(&self, operation: Operation, key: &str) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(Call {
            operation,
            key: key.to_string(),
        });
        let injected = state
            .faults
            .iter()
            .find(|fault| {
                fault.operation == operation && fault.key.as_deref().map_or(true, |k| k == key)
            })
            .map(|fault| (fault.error)(key));
        match injected {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn upload(&self, key: &str, mut source: File) -> Result<Checksum> {
        self.record(Operation::Upload, key)?;
        let mut content = Vec::new();
        source.read_to_end(&mut content).await?;

        let checksum = if self.corrupt_uploads {
            let mut reversed = content.clone();
            reversed.reverse();
            reversed.push(0);
            Checksum::compute(&reversed)
        } else {
            Checksum::compute(&content)
        };
        self.lock().blobs.insert(key.to_string(), Bytes::from(content));
        Ok(checksum)
    }

    async fn download(&self, key: &str, destination: &mut File) -> Result<u64> {
        let content = self
            .enter(Operation::Download, key)?
            .blobs
            .get(key)
            .cloned()
            .ok_or_else(|| BlobstoreError::BlobNotFound(key.to_string()))?;
        let written = if self.short_downloads {
            &content[..content.len().saturating_sub(1)]
        } else {
            &content[..]
        };
        destination.write_all(written).await?;
        destination.flush().await?;
        Ok(content.len() as u64)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.enter(Operation::Delete, key)?
            .blobs
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BlobstoreError::BlobNotFound(key.to_string()))
    }

    async fn get_properties(&self, key: &str) -> Result<BlobProperties> {
        let state = self.enter(Operation::GetProperties, key)?;
        let content = state
            .blobs
            .get(key)
            .ok_or_else(|| BlobstoreError::BlobNotFound(key.to_string()))?;
        Ok(BlobProperties {
            size: content.len() as u64,
            content_md5: Some(Checksum::compute(content)),
            ..Default::default()
        })
    }

    async fn signed_url(
        &self,
        key: &str,
        permissions: SasPermissions,
        expiry: DateTime<Utc>,
    ) -> Result<Url> {
        self.record(Operation::SignedUrl, key)?;
        let mut url = Url::parse(&format!("memory://{}/", self.container))?;
        url.path_segments_mut()
            .map_err(|_| BlobstoreError::InvalidInput("memory URL is not a base URL".to_string()))?
            .pop_if_empty()
            .extend(key.split('/'));
        url.query_pairs_mut()
            .append_pair("sp", &permissions.to_string())
            .append_pair("se", &expiry.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        Ok(url)
    }

    async fn list_page(&self, prefix: Option<&str>, marker: Option<&str>) -> Result<ListPage> {
        let state = self.enter(Operation::ListPage, prefix.unwrap_or(""))?;
        let prefix = prefix.unwrap_or("");
        let start = match marker {
            Some(marker) => marker
                .parse::<usize>()
                .map_err(|_| BlobstoreError::BadRequest(format!("invalid marker {marker}")))?,
            None => 0,
        };

        let matching: Vec<&String> = state
            .blobs
            .keys()
            .filter(|key| key.starts_with(prefix))
            .collect();
        let end = (start + self.page_size).min(matching.len());
        let names = matching
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|key| key.to_string())
            .collect();
        let next_marker = (end < matching.len()).then(|| end.to_string());

        Ok(ListPage { names, next_marker })
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        let mut state = self.enter(Operation::Copy, source)?;
        let content = state
            .blobs
            .get(source)
            .cloned()
            .ok_or_else(|| BlobstoreError::BlobNotFound(source.to_string()))?;
        state.blobs.insert(destination.to_string(), content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use all_asserts::assert_true;

    use super::*;

    #[tokio::test]
    async fn pages_follow_name_order() {
        let backend = MemoryBackend::new().with_page_size(2);
        for key in ["c", "a", "b"] {
            backend.insert(key, key.as_bytes().to_vec());
        }

        let first = backend.list_page(None, None).await.unwrap();
        assert_eq!(first.names, vec!["a".to_string(), "b".to_string()]);
        let second = backend
            .list_page(None, first.next_marker.as_deref())
            .await
            .unwrap();
        assert_eq!(second.names, vec!["c".to_string()]);
        assert_eq!(second.next_marker, None);
    }

    #[tokio::test]
    async fn missing_blobs_are_not_found() {
        let backend = MemoryBackend::new();
        assert_true!(backend.delete("nope").await.unwrap_err().is_not_found());
        assert_true!(backend.get_properties("nope").await.unwrap_err().is_not_found());
        assert_true!(backend.copy("nope", "dst").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn faults_target_operation_and_key() {
        let backend = MemoryBackend::new().fail_on(Operation::Delete, Some("bad"), |_| {
            BlobstoreError::Forbidden("denied".to_string())
        });
        backend.insert("bad", "x");
        backend.insert("good", "y");

        assert!(matches!(
            backend.delete("bad").await,
            Err(BlobstoreError::Forbidden(_))
        ));
        backend.delete("good").await.unwrap();
        assert_eq!(backend.keys(), vec!["bad".to_string()]);
        assert_eq!(
            backend.calls_to(Operation::Delete),
            vec!["bad".to_string(), "good".to_string()]
        );
    }
}
