//! Error handling utilities for the crate
use thiserror::Error;

use reqwest::Error as ReqwestError;

use crate::checksum::Checksum;

/// All errors raised by this crate will be instances of BlobstoreError
#[derive(Error, Debug)]
pub enum BlobstoreError {
    #[error("Invalid storage account credentials: {0}")]
    InvalidCredentials(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Access denied, please check the storage account key: {0}")]
    Forbidden(String),
    #[error("The container '{0}' does not exist")]
    ContainerNotFound(String),
    #[error("The blob '{0}' does not exist")]
    BlobNotFound(String),
    #[error("Conflicting operation on the blob: {0}")]
    Conflict(String),
    #[error("Internal HTTP error: {0}")]
    HttpError(#[from] ReqwestError),
    #[error("Unknown error from the storage service ({0}): {1}")]
    UnknownError(u16, String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Malformed response from the storage service: {0}")]
    MalformedResponse(String),
    #[error("the upload responded an MD5 {remote} does not match the source file MD5 {local}")]
    ChecksumMismatch { local: Checksum, remote: Checksum },
    #[error("action not implemented: {0}. Available actions are 'get' and 'put'")]
    ActionNotSupported(String),
    #[error("copy to '{0}' finished with status '{1}'")]
    CopyFailed(String, String),
    #[error(
        "failed to delete {} blob(s) under prefix '{prefix}', first failure: {}",
        .failures.len(),
        .failures.first().map(|(key, err)| format!("{key}: {err}")).unwrap_or_default()
    )]
    RecursiveDeleteFailed {
        prefix: String,
        failures: Vec<(String, BlobstoreError)>,
    },
}

impl BlobstoreError {
    pub fn unknown_error(status_code: reqwest::StatusCode) -> Self {
        BlobstoreError::UnknownError(
            status_code.as_u16(),
            status_code
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
        )
    }

    pub fn required(field_name: &str) -> Self {
        BlobstoreError::InvalidInput(format!("{} is required", field_name))
    }

    /// True for the "blob does not exist" class only.  A missing container is
    /// a configuration problem and does not count.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobstoreError::BlobNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BlobstoreError>;
