//! A blobstore on top of [Azure Blob Storage](https://learn.microsoft.com/azure/storage/blobs/).
//!
//! Release tooling that only knows how to put, get, delete, list, copy and sign
//! blobs can use this crate (or the `azure-storage-cli` binary built from it)
//! to keep its artifacts in an Azure storage container.
//!
//! The entry point is [`BlobstoreClient`], which wraps a [`StorageBackend`] and
//! adds what the raw service does not give for free:
//!
//! * uploads are verified against the local file's MD5 and removed again on a
//!   mismatch
//! * deleting a blob that does not exist succeeds
//! * existence checks tell "absent" apart from "could not find out"
//! * signed URLs are scoped to `get` or `put` and carry a server side timeout
//! * listings hide pagination
//!
//! [`BlobstoreClient`]: crate::blobstore::BlobstoreClient
//! [`StorageBackend`]: crate::backend::StorageBackend
//!
//! ```ignore
//! let config = AzureStorageConfig::from_path("config.json")?;
//! let client = BlobstoreClient::new(AzureBlobBackend::new(&config)?)
//!     .with_sign_policy(config.sign_policy()?);
//!
//! client.put("release.tgz", "releases/1.0/release.tgz").await?;
//! match client.exists("releases/1.0/release.tgz").await {
//!     ExistenceState::Exists => println!("uploaded"),
//!     ExistenceState::DoesNotExist => println!("missing"),
//!     ExistenceState::Unknown(err) => return Err(err),
//! }
//! let url = client
//!     .sign("releases/1.0/release.tgz", "get", Duration::from_secs(3600))
//!     .await?;
//! ```
//!
//! The configuration file is JSON:
//!
//! ```json
//! {
//!   "account_name": "myaccount",
//!   "account_key": "<base64 account key>",
//!   "container_name": "releases"
//! }
//! ```
//!
//! For tests, [`MemoryBackend`] keeps blobs in memory and records every call.
//!
//! [`MemoryBackend`]: crate::memory::MemoryBackend

pub mod auth;
pub mod azure;
pub mod backend;
pub mod blobstore;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod memory;
