//! The blobstore client and the guarantees it adds on top of a [`StorageBackend`]
//!
//! The backend only moves bytes.  The client makes uploads verified (a blob
//! whose checksum does not match the local file is removed again), makes
//! deletes idempotent, turns "not found" into a plain answer for existence
//! checks, scopes signed URLs to an action and hides listing pagination.
use std::{path::Path, str::FromStr, time::Duration};

use chrono::Utc;
use tokio::fs::File;
use tracing::{error, info, warn};

use crate::{
    backend::{SasPermissions, StorageBackend},
    checksum::Checksum,
    config::SignPolicy,
    error::{BlobstoreError, Result},
};

/// Query parameter carrying the server side timeout of a signed URL
const SERVER_TIMEOUT_PARAM: &str = "timeout";

/// The answer to "does this blob exist?"
///
/// `Unknown` always carries the error that prevented a definite answer.
#[derive(Debug)]
pub enum ExistenceState {
    Exists,
    DoesNotExist,
    Unknown(BlobstoreError),
}

impl ExistenceState {
    pub fn into_result(self) -> Result<bool> {
        match self {
            ExistenceState::Exists => Ok(true),
            ExistenceState::DoesNotExist => Ok(false),
            ExistenceState::Unknown(err) => Err(err),
        }
    }
}

/// What the holder of a signed URL intends to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignAction {
    Get,
    Put,
}

impl SignAction {
    fn permissions(&self) -> SasPermissions {
        match self {
            SignAction::Get => SasPermissions::read_only(),
            // Create is needed so the first write to an absent blob succeeds
            SignAction::Put => SasPermissions::read_write(),
        }
    }

    fn server_timeout(&self, policy: &SignPolicy) -> Duration {
        match self {
            SignAction::Get => policy.read_timeout(),
            SignAction::Put => policy.write_timeout(),
        }
    }
}

impl FromStr for SignAction {
    type Err = BlobstoreError;

    fn from_str(action: &str) -> Result<Self> {
        match action.to_ascii_lowercase().as_str() {
            "get" => Ok(SignAction::Get),
            "put" => Ok(SignAction::Put),
            _ => Err(BlobstoreError::ActionNotSupported(action.to_string())),
        }
    }
}

/// A blobstore backed by a single container
pub struct BlobstoreClient<B> {
    backend: B,
    sign_policy: SignPolicy,
}

impl<B: StorageBackend> BlobstoreClient<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            sign_policy: SignPolicy::default(),
        }
    }

    pub fn with_sign_policy(mut self, sign_policy: SignPolicy) -> Self {
        self.sign_policy = sign_policy;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Uploads a local file and verifies what the service stored
    ///
    /// The file's MD5 is computed before anything is sent.  If the checksum the
    /// service reports for the written blob differs, the blob is deleted again
    /// (failures of that delete are only logged) and
    /// [`BlobstoreError::ChecksumMismatch`] is returned.
    pub async fn put(&self, source: impl AsRef<Path>, dest: &str) -> Result<()> {
        let source = source.as_ref();
        let local = Checksum::of_file(source).await?;
        let file = File::open(source).await?;

        let remote = self.backend.upload(dest, file).await?;

        if local != remote {
            warn!(
                key = %dest,
                local = %local,
                remote = %remote,
                "The upload failed because of an MD5 inconsistency. Triggering blob deletion ..."
            );
            if let Err(err) = self.backend.delete(dest).await {
                error!(key = %dest, error = %err, "blob deletion failed");
            }
            return Err(BlobstoreError::ChecksumMismatch { local, remote });
        }

        info!(key = %dest, md5 = %local, "Successfully uploaded file");
        Ok(())
    }

    /// Downloads a blob into `destination`
    ///
    /// Content is not verified.  If the file does not end up with the size the
    /// service reported it is truncated or extended to that size.
    pub async fn get(&self, source: &str, destination: &mut File) -> Result<()> {
        let reported = self.backend.download(source, destination).await?;
        let written = destination.metadata().await?.len();
        if written != reported {
            warn!(
                key = %source,
                written,
                reported,
                "Truncating file according to the blob size"
            );
            destination.set_len(reported).await?;
        }
        Ok(())
    }

    /// Deletes a blob.  Deleting a blob that does not exist succeeds.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.backend.delete(key).await {
            Err(err) if err.is_not_found() => {
                info!(key = %key, "Blob already absent");
                Ok(())
            }
            other => other,
        }
    }

    /// Deletes every blob under `prefix`
    ///
    /// Every listed blob is attempted even if some deletes fail; the failures
    /// are returned together as [`BlobstoreError::RecursiveDeleteFailed`].  A
    /// failed listing aborts before anything is deleted.
    pub async fn delete_recursive(&self, prefix: &str) -> Result<()> {
        let keys = self.list(prefix).await?;
        info!(prefix = %prefix, count = keys.len(), "Deleting blobs");

        let mut failures = Vec::new();
        for key in keys {
            if let Err(err) = self.delete(&key).await {
                warn!(key = %key, error = %err, "Failed to delete blob");
                failures.push((key, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BlobstoreError::RecursiveDeleteFailed {
                prefix: prefix.to_string(),
                failures,
            })
        }
    }

    pub async fn exists(&self, key: &str) -> ExistenceState {
        match self.backend.get_properties(key).await {
            Ok(_) => {
                info!(key = %key, "Blob exists");
                ExistenceState::Exists
            }
            Err(err) if err.is_not_found() => {
                info!(key = %key, "Blob does not exist");
                ExistenceState::DoesNotExist
            }
            Err(err) => ExistenceState::Unknown(err),
        }
    }

    /// Creates a signed URL for `action` (`get` or `put`, any case) valid for
    /// `validity` from now
    ///
    /// The URL carries a server side timeout, longer for `put` than for `get`.
    pub async fn sign(&self, key: &str, action: &str, validity: Duration) -> Result<String> {
        let action = action.parse::<SignAction>()?;
        let validity = chrono::Duration::from_std(validity)
            .map_err(|_| BlobstoreError::InvalidInput(format!("validity {validity:?} is too long")))?;
        let expiry = Utc::now()
            .checked_add_signed(validity)
            .ok_or_else(|| BlobstoreError::InvalidInput("validity is too long".to_string()))?;

        let mut url = self
            .backend
            .signed_url(key, action.permissions(), expiry)
            .await?;
        url.query_pairs_mut().append_pair(
            SERVER_TIMEOUT_PARAM,
            &action.server_timeout(&self.sign_policy).as_secs().to_string(),
        );
        Ok(url.into())
    }

    /// Lists every blob name under `prefix`, or the whole container if it is empty
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = (!prefix.is_empty()).then_some(prefix);
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.backend.list_page(prefix, marker.as_deref()).await?;
            names.extend(page.names);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        info!(prefix = ?prefix, count = names.len(), "Listed blobs");
        Ok(names)
    }

    /// Copies a blob on the server.  A missing source is an error.
    pub async fn copy(&self, source: &str, dest: &str) -> Result<()> {
        self.backend.copy(source, dest).await?;
        info!(source = %source, dest = %dest, "Copied blob");
        Ok(())
    }
}
