//! A backend that talks to the Azure Blob Storage REST API
use std::{env, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use once_cell::sync::Lazy;
use reqwest::{
    header::{HeaderMap, CONTENT_LENGTH, ETAG, LAST_MODIFIED},
    Body, Client, RequestBuilder, Response, StatusCode,
};
use serde::Deserialize;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    auth::{SharedKeyCredential, AZURE_STORAGE_API_VERSION},
    backend::{BlobProperties, CopyStatus, ListPage, SasPermissions, StorageBackend},
    checksum::Checksum,
    config::AzureStorageConfig,
    error::{BlobstoreError, Result},
};

/// Overrides the service URL, e.g. `http://127.0.0.1:10000/devstoreaccount1`
/// for a local emulator
pub const SERVICE_URL_ENV: &str = "AZURE_STORAGE_SERVICE_URL";

static GLOBAL_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// Signed URLs become valid slightly in the past to tolerate clock skew
const SAS_CLOCK_SKEW_SECS: i64 = 10;
const COPY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RFC1123_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub struct AzureBlobBackend {
    credential: SharedKeyCredential,
    /// The account's blob service endpoint without a trailing slash
    service_url: String,
    container: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AzureErrorBody {
    code: String,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    blob: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
}

impl AzureBlobBackend {
    pub fn new(config: &AzureStorageConfig) -> Result<Self> {
        let credential = SharedKeyCredential::try_new(&config.account_name, &config.account_key)?;
        let service_url = Self::get_service_url(config);
        // Fail on a bad override now rather than on the first request
        Url::parse(&service_url)?;
        debug!(
            service_url = %service_url,
            container = %config.container_name,
            "Created Azure blob backend"
        );
        Ok(Self {
            credential,
            service_url,
            container: config.container_name.clone(),
        })
    }

    fn get_service_url(config: &AzureStorageConfig) -> String {
        env::var(SERVICE_URL_ENV)
            .unwrap_or_else(|_| {
                format!(
                    "https://{}.{}",
                    config.account_name,
                    config.storage_endpoint()
                )
            })
            .trim_end_matches('/')
            .to_string()
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    fn container_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.service_url)?;
        url.path_segments_mut()
            .map_err(|_| BlobstoreError::InvalidInput(format!("{} is not a base URL", self.service_url)))?
            .pop_if_empty()
            .push(&self.container);
        Ok(url)
    }

    /// Each `/` separated segment of the key is percent-encoded on its own
    fn blob_url(&self, key: &str) -> Result<Url> {
        if key.is_empty() {
            return Err(BlobstoreError::required("blob name"));
        }
        // URL normalization would resolve these to a different blob
        if key.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(BlobstoreError::InvalidInput(format!(
                "blob name '{key}' must not contain '.' or '..' segments"
            )));
        }
        let mut url = self.container_url()?;
        url.path_segments_mut()
            .map_err(|_| BlobstoreError::InvalidInput(format!("{} is not a base URL", self.service_url)))?
            .extend(key.split('/'));
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let mut request = request
            .header("x-ms-date", Utc::now().format(RFC1123_FORMAT).to_string())
            .header("x-ms-version", AZURE_STORAGE_API_VERSION)
            .build()?;
        self.credential.authorize(&mut request)?;
        debug!(method = %request.method(), url = %request.url(), "Sending storage request");
        Ok(GLOBAL_CLIENT.execute(request).await?)
    }

    async fn handle_error(&self, response: Response, key: &str) -> BlobstoreError {
        let status = response.status();
        let header_code = header_str(response.headers(), "x-ms-error-code").map(str::to_string);
        // HEAD responses have no body, everything else carries an XML error document
        let body = response.text().await.unwrap_or_default();
        let detail = quick_xml::de::from_str::<AzureErrorBody>(body.trim_start_matches('\u{feff}')).ok();

        let code = header_code
            .or_else(|| detail.as_ref().map(|detail| detail.code.clone()))
            .unwrap_or_default();
        let message = detail
            .and_then(|detail| detail.message)
            .and_then(|message| message.lines().next().map(str::to_string))
            .unwrap_or_else(|| {
                if code.is_empty() {
                    status.canonical_reason().unwrap_or("unknown details").to_string()
                } else {
                    code.clone()
                }
            });
        debug!(status = status.as_u16(), code = %code, key = %key, "Storage request failed");

        match status {
            StatusCode::NOT_FOUND if code == "ContainerNotFound" => {
                BlobstoreError::ContainerNotFound(self.container.clone())
            }
            StatusCode::NOT_FOUND => BlobstoreError::BlobNotFound(key.to_string()),
            StatusCode::BAD_REQUEST => BlobstoreError::BadRequest(message),
            StatusCode::FORBIDDEN => BlobstoreError::Forbidden(message),
            StatusCode::CONFLICT => BlobstoreError::Conflict(message),
            _ => BlobstoreError::unknown_error(status),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>> {
    header_str(headers, name)
        .map(|value| {
            value.parse::<u64>().map_err(|_| {
                BlobstoreError::MalformedResponse(format!("{name} is not a number: {value}"))
            })
        })
        .transpose()
}

fn header_md5(headers: &HeaderMap) -> Result<Option<Checksum>> {
    header_str(headers, "content-md5")
        .map(|value| {
            STANDARD
                .decode(value)
                .map(Checksum::from)
                .map_err(|err| BlobstoreError::MalformedResponse(format!("content-md5: {err}")))
        })
        .transpose()
}

fn parse_list_page(xml: &str) -> Result<ListPage> {
    let results: EnumerationResults = quick_xml::de::from_str(xml.trim_start_matches('\u{feff}'))
        .map_err(|err| BlobstoreError::MalformedResponse(format!("blob listing: {err}")))?;
    Ok(ListPage {
        names: results.blobs.blob.into_iter().map(|blob| blob.name).collect(),
        next_marker: results.next_marker.filter(|marker| !marker.is_empty()),
    })
}

#[async_trait]
impl StorageBackend for AzureBlobBackend {
    async fn upload(&self, key: &str, source: File) -> Result<Checksum> {
        let url = self.blob_url(key)?;
        let length = source.metadata().await?.len();
        info!(blob = %url, size = length, "Uploading");

        let request = GLOBAL_CLIENT
            .put(url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_LENGTH, length)
            .body(Body::from(source));
        let response = self.send(request).await?;

        if response.status() != StatusCode::CREATED {
            return Err(self.handle_error(response, key).await);
        }
        match header_md5(response.headers())? {
            Some(md5) => Ok(md5),
            None => {
                warn!(key = %key, "Upload response carried no content-md5");
                Ok(Checksum::default())
            }
        }
    }

    async fn download(&self, key: &str, destination: &mut File) -> Result<u64> {
        let url = self.blob_url(key)?;
        info!(blob = %url, "Downloading");

        let response = self.send(GLOBAL_CLIENT.get(url)).await?;
        if response.status() != StatusCode::OK {
            return Err(self.handle_error(response, key).await);
        }

        let reported = header_u64(response.headers(), CONTENT_LENGTH.as_str())?;
        let mut written = 0_u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            destination.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        destination.flush().await?;

        Ok(reported.unwrap_or(written))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = self.blob_url(key)?;
        info!(blob = %url, "Deleting");

        let request = GLOBAL_CLIENT
            .delete(url)
            .header("x-ms-delete-snapshots", "include");
        let response = self.send(request).await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.handle_error(response, key).await)
        }
    }

    async fn get_properties(&self, key: &str) -> Result<BlobProperties> {
        let url = self.blob_url(key)?;
        debug!(blob = %url, "Fetching blob properties");

        let response = self.send(GLOBAL_CLIENT.head(url)).await?;
        if response.status() != StatusCode::OK {
            return Err(self.handle_error(response, key).await);
        }

        let headers = response.headers();
        Ok(BlobProperties {
            size: header_u64(headers, CONTENT_LENGTH.as_str())?.unwrap_or(0),
            etag: header_str(headers, ETAG.as_str()).map(str::to_string),
            last_modified: header_str(headers, LAST_MODIFIED.as_str())
                .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
                .map(|value| value.with_timezone(&Utc)),
            content_md5: header_md5(headers)?,
            copy_status: header_str(headers, "x-ms-copy-status").and_then(CopyStatus::parse),
        })
    }

    async fn signed_url(
        &self,
        key: &str,
        permissions: SasPermissions,
        expiry: DateTime<Utc>,
    ) -> Result<Url> {
        let mut url = self.blob_url(key)?;
        info!(blob = %url, permissions = %permissions, expiry = %expiry, "Getting signed url");

        let start = Utc::now() - chrono::Duration::seconds(SAS_CLOCK_SKEW_SECS);
        let https_only = url.scheme() == "https";
        let query = self.credential.blob_sas_query(
            &self.container,
            key,
            &permissions.to_string(),
            start,
            expiry,
            https_only,
        )?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    async fn list_page(&self, prefix: Option<&str>, marker: Option<&str>) -> Result<ListPage> {
        let mut url = self.container_url()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("restype", "container").append_pair("comp", "list");
            if let Some(prefix) = prefix.filter(|prefix| !prefix.is_empty()) {
                query.append_pair("prefix", prefix);
            }
            if let Some(marker) = marker {
                query.append_pair("marker", marker);
            }
        }
        debug!(container = %self.container, prefix = ?prefix, marker = ?marker, "Listing blobs");

        let response = self.send(GLOBAL_CLIENT.get(url)).await?;
        if response.status() != StatusCode::OK {
            return Err(self.handle_error(response, prefix.unwrap_or("")).await);
        }
        parse_list_page(&response.text().await?)
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<()> {
        let source_url = self.blob_url(source)?;
        let destination_url = self.blob_url(destination)?;
        info!(source = %source_url, destination = %destination_url, "Copying");

        let request = GLOBAL_CLIENT
            .put(destination_url)
            .header("x-ms-copy-source", source_url.as_str())
            .header(CONTENT_LENGTH, 0);
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response, source).await);
        }

        let mut status = header_str(response.headers(), "x-ms-copy-status").and_then(CopyStatus::parse);
        while status == Some(CopyStatus::Pending) {
            debug!(destination = %destination, "Copy pending");
            tokio::time::sleep(COPY_POLL_INTERVAL).await;
            status = self.get_properties(destination).await?.copy_status;
        }

        match status {
            Some(status @ (CopyStatus::Aborted | CopyStatus::Failed)) => Err(
                BlobstoreError::CopyFailed(destination.to_string(), status.as_str().to_string()),
            ),
            _ => Ok(()),
        }
    }
}
