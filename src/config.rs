//! Configuration of the storage account and container
use std::{fs::File, io::Read, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::{BlobstoreError, Result};

/// Server side timeout hint attached to read URLs
pub const DEFAULT_SIGNED_URL_GET_TIMEOUT: u64 = 30 * 60;
/// Server side timeout hint attached to write URLs
pub const DEFAULT_SIGNED_URL_PUT_TIMEOUT: u64 = 45 * 60;

/// The Azure cloud hosting the storage account
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum AzureEnvironment {
    #[default]
    AzureCloud,
    AzureChinaCloud,
    AzureUSGovernment,
    AzureGermanCloud,
}

impl AzureEnvironment {
    pub fn storage_endpoint(&self) -> &'static str {
        match self {
            AzureEnvironment::AzureCloud => "blob.core.windows.net",
            AzureEnvironment::AzureChinaCloud => "blob.core.chinacloudapi.cn",
            AzureEnvironment::AzureUSGovernment => "blob.core.usgovcloudapi.net",
            AzureEnvironment::AzureGermanCloud => "blob.core.cloudapi.de",
        }
    }
}

/// Contents of the JSON configuration file
#[derive(Clone, Deserialize)]
pub struct AzureStorageConfig {
    pub account_name: String,
    pub account_key: String,
    pub container_name: String,
    #[serde(default)]
    pub environment: AzureEnvironment,
    /// Seconds, see [`SignPolicy`]
    #[serde(default = "default_get_timeout")]
    pub signed_url_get_timeout: u64,
    /// Seconds, see [`SignPolicy`]
    #[serde(default = "default_put_timeout")]
    pub signed_url_put_timeout: u64,
}

fn default_get_timeout() -> u64 {
    DEFAULT_SIGNED_URL_GET_TIMEOUT
}

fn default_put_timeout() -> u64 {
    DEFAULT_SIGNED_URL_PUT_TIMEOUT
}

// Custom implementation of Debug to avoid printing the account key
impl std::fmt::Debug for AzureStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureStorageConfig")
            .field("account_name", &self.account_name)
            .field("account_key", &"**********")
            .field("container_name", &self.container_name)
            .field("environment", &self.environment)
            .field("signed_url_get_timeout", &self.signed_url_get_timeout)
            .field("signed_url_put_timeout", &self.signed_url_put_timeout)
            .finish()
    }
}

impl AzureStorageConfig {
    /// Parses and validates a configuration from JSON
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let config: Self = serde_json::from_reader(reader)
            .map_err(|err| BlobstoreError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    fn validate(&self) -> Result<()> {
        if self.account_name.is_empty() {
            return Err(BlobstoreError::required("account_name"));
        }
        if self.account_key.is_empty() {
            return Err(BlobstoreError::required("account_key"));
        }
        if self.container_name.is_empty() {
            return Err(BlobstoreError::required("container_name"));
        }
        self.sign_policy().map(|_| ())
    }

    pub fn storage_endpoint(&self) -> &'static str {
        self.environment.storage_endpoint()
    }

    pub fn sign_policy(&self) -> Result<SignPolicy> {
        SignPolicy::new(
            Duration::from_secs(self.signed_url_get_timeout),
            Duration::from_secs(self.signed_url_put_timeout),
        )
    }
}

/// Server side timeouts attached to signed URLs.
///
/// Uploads through a signed URL are slower than downloads and more likely to
/// run into connections the service stops answering, so write URLs always get
/// the longer window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignPolicy {
    read_timeout: Duration,
    write_timeout: Duration,
}

impl SignPolicy {
    pub fn new(read_timeout: Duration, write_timeout: Duration) -> Result<Self> {
        if read_timeout.is_zero() {
            return Err(BlobstoreError::InvalidConfig(
                "signed_url_get_timeout must be greater than zero".to_string(),
            ));
        }
        if write_timeout <= read_timeout {
            return Err(BlobstoreError::InvalidConfig(format!(
                "signed_url_put_timeout ({}s) must be longer than signed_url_get_timeout ({}s)",
                write_timeout.as_secs(),
                read_timeout.as_secs()
            )));
        }
        Ok(Self {
            read_timeout,
            write_timeout,
        })
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }
}

impl Default for SignPolicy {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(DEFAULT_SIGNED_URL_GET_TIMEOUT),
            write_timeout: Duration::from_secs(DEFAULT_SIGNED_URL_PUT_TIMEOUT),
        }
    }
}
