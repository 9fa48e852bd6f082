//! Authentication utilities for working with the Azure Blob Storage API
//!
//! Requests are authorized with the storage account's shared key: the client
//! builds a canonical "string to sign" from the request and attaches its
//! HMAC-SHA256 signature in the `Authorization` header.  Signed URLs are service
//! SAS tokens signed with the same key.
use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Request,
};
use sha2::Sha256;
use url::Url;

use crate::error::{BlobstoreError, Result};

/// The storage service REST API version used for requests and signed URLs
pub const AZURE_STORAGE_API_VERSION: &str = "2021-08-06";

const SAS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Standard headers that take part in the shared key signature, in order
const SIGNED_HEADERS: [&str; 11] = [
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// A storage account name together with its (decoded) access key.
pub struct SharedKeyCredential {
    account_name: String,
    account_key: Vec<u8>,
}

// Custom implementation of Debug to avoid printing the key
impl std::fmt::Debug for SharedKeyCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeyCredential")
            .field("account_name", &self.account_name)
            .field("account_key", &"**********")
            .finish()
    }
}

impl SharedKeyCredential {
    /// Creates a credential from the account name and the base64 encoded key
    /// shown in the Azure portal.
    pub fn try_new(account_name: &str, account_key: &str) -> Result<Self> {
        if account_name.is_empty() {
            return Err(BlobstoreError::required("account_name"));
        }
        let account_key = STANDARD.decode(account_key.trim()).map_err(|err| {
            BlobstoreError::InvalidCredentials(format!("account_key is not valid base64: {err}"))
        })?;
        Ok(Self {
            account_name: account_name.to_string(),
            account_key,
        })
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Returns the base64 encoded HMAC-SHA256 of `string_to_sign`
    pub fn sign(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.account_key)
            .map_err(|err| BlobstoreError::InvalidCredentials(err.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Adds the shared key `Authorization` header to a fully built request.
    ///
    /// Every header that takes part in the signature (`x-ms-date`,
    /// `x-ms-version`, `content-length`, ...) must already be set.
    pub(crate) fn authorize(&self, request: &mut Request) -> Result<()> {
        let string_to_sign = string_to_sign(
            &self.account_name,
            request.method().as_str(),
            request.headers(),
            request.url(),
        );
        let signature = self.sign(&string_to_sign)?;
        let value = HeaderValue::from_str(&format!(
            "SharedKey {}:{}",
            self.account_name, signature
        ))
        .map_err(|err| BlobstoreError::InvalidCredentials(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }

    /// Builds the query parameters of a blob service SAS.
    ///
    /// `permissions` must already be in canonical order (e.g. `rcw`).
    pub(crate) fn blob_sas_query(
        &self,
        container: &str,
        blob: &str,
        permissions: &str,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
        https_only: bool,
    ) -> Result<Vec<(&'static str, String)>> {
        let start = start.format(SAS_TIME_FORMAT).to_string();
        let expiry = expiry.format(SAS_TIME_FORMAT).to_string();
        let protocol = if https_only { "https" } else { "https,http" };
        let string_to_sign = sas_string_to_sign(
            &self.account_name,
            container,
            blob,
            permissions,
            &start,
            &expiry,
            protocol,
        );
        let signature = self.sign(&string_to_sign)?;

        Ok(vec![
            ("sv", AZURE_STORAGE_API_VERSION.to_string()),
            ("st", start),
            ("se", expiry),
            ("sr", "b".to_string()),
            ("sp", permissions.to_string()),
            ("spr", protocol.to_string()),
            ("sig", signature),
        ])
    }
}

/// Builds the service SAS string to sign for a blob
fn sas_string_to_sign(
    account: &str,
    container: &str,
    blob: &str,
    permissions: &str,
    start: &str,
    expiry: &str,
    protocol: &str,
) -> String {
    let canonical_resource = format!("/blob/{account}/{container}/{blob}");
    [
        permissions,
        start,
        expiry,
        &canonical_resource,
        "", // signed identifier
        "", // signed IP
        protocol,
        AZURE_STORAGE_API_VERSION,
        "b", // signed resource
        "", // snapshot time
        "", // encryption scope
        "", // rscc
        "", // rscd
        "", // rsce
        "", // rscl
        "", // rsct
    ]
    .join("\n")
}

/// Builds the shared key string to sign for a request
pub(crate) fn string_to_sign(account: &str, method: &str, headers: &HeaderMap, url: &Url) -> String {
    let mut result = String::with_capacity(256);
    result.push_str(method);
    result.push('\n');
    for name in SIGNED_HEADERS {
        let value = headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        // A zero length is signed as an empty string
        if name == "content-length" && value == "0" {
            result.push('\n');
            continue;
        }
        result.push_str(value);
        result.push('\n');
    }
    result.push_str(&canonicalized_headers(headers));
    result.push_str(&canonicalized_resource(account, url));
    result
}

fn canonicalized_headers(headers: &HeaderMap) -> String {
    let ms_headers: BTreeMap<&str, &str> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-ms-"))
        .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or("").trim()))
        .collect();
    ms_headers
        .into_iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect()
}

fn canonicalized_resource(account: &str, url: &Url) -> String {
    let path = if url.path().is_empty() { "/" } else { url.path() };
    let mut resource = format!("/{account}{path}");

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        resource.push('\n');
        resource.push_str(&name);
        resource.push(':');
        resource.push_str(&values.join(","));
    }
    resource
}

#[cfg(test)]
mod tests {
    use all_asserts::assert_true;
    use chrono::TimeZone;
    use reqwest::header::HeaderName;

    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn sign_is_hmac_sha256() {
        // RFC 4231 test case 2, key "Jefe"
        let credential = SharedKeyCredential::try_new("account", "SmVmZQ==").unwrap();
        assert_eq!(
            credential.sign("what do ya want for nothing?").unwrap(),
            "W9zBRr9gdU5qBCQmCJV1x1oAPwidJzmDnexYuWTsOEM="
        );
    }

    #[test]
    fn rejects_key_that_is_not_base64() {
        let err = SharedKeyCredential::try_new("account", "not base64!").unwrap_err();
        assert!(matches!(err, BlobstoreError::InvalidCredentials(_)));
    }

    #[test]
    fn debug_hides_key() {
        let credential = SharedKeyCredential::try_new("account", "a2V5").unwrap();
        let printed = format!("{:?}", credential);
        assert_true!(printed.contains("account"));
        assert_true!(!printed.contains("a2V5"));
        assert_true!(printed.contains("**********"));
    }

    #[test]
    fn string_to_sign_for_put() {
        let url = Url::parse("https://account.blob.core.windows.net/container/dir/my%20blob").unwrap();
        let headers = headers(&[
            ("content-length", "5"),
            ("x-ms-version", AZURE_STORAGE_API_VERSION),
            ("x-ms-date", "Mon, 01 Jan 2024 00:00:00 GMT"),
            ("x-ms-blob-type", "BlockBlob"),
        ]);

        let expected = format!(
            "PUT\n\n\n5\n\n\n\n\n\n\n\n\n\
             x-ms-blob-type:BlockBlob\n\
             x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
             x-ms-version:{}\n\
             /account/container/dir/my%20blob",
            AZURE_STORAGE_API_VERSION
        );
        assert_eq!(string_to_sign("account", "PUT", &headers, &url), expected);
    }

    #[test]
    fn string_to_sign_includes_sorted_query() {
        let url = Url::parse(
            "https://account.blob.core.windows.net/container?restype=container&comp=list&prefix=a%2Fb",
        )
        .unwrap();
        let headers = headers(&[("content-length", "0")]);

        let signed = string_to_sign("account", "GET", &headers, &url);
        assert_true!(signed.starts_with("GET\n\n\n\n"));
        assert_true!(signed.ends_with("/account/container\ncomp:list\nprefix:a/b\nrestype:container"));
    }

    #[test]
    fn sas_query_carries_permissions_and_expiry() {
        let credential = SharedKeyCredential::try_new("account", "a2V5").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap();

        let query = credential
            .blob_sas_query("container", "a/b.txt", "rcw", start, expiry, true)
            .unwrap();
        let query: BTreeMap<_, _> = query.into_iter().collect();

        assert_eq!(query["sp"], "rcw");
        assert_eq!(query["st"], "2024-01-15T12:00:00Z");
        assert_eq!(query["se"], "2024-01-15T13:00:00Z");
        assert_eq!(query["sr"], "b");
        assert_eq!(query["spr"], "https");
        assert_eq!(query["sv"], AZURE_STORAGE_API_VERSION);
        assert_true!(!query["sig"].is_empty());
    }

    #[test]
    fn sas_signature_depends_on_permissions() {
        let credential = SharedKeyCredential::try_new("account", "a2V5").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap();

        let sig = |permissions: &str| {
            credential
                .blob_sas_query("container", "a", permissions, start, expiry, true)
                .unwrap()
                .into_iter()
                .find(|(name, _)| *name == "sig")
                .unwrap()
                .1
        };
        assert_ne!(sig("r"), sig("rcw"));
        assert_eq!(sig("r"), sig("r"));
    }

    #[test]
    fn sas_string_to_sign_field_order() {
        let expected = format!(
            "rcw\n\
             2024-01-15T12:00:00Z\n\
             2024-01-15T13:00:00Z\n\
             /blob/account/container/a/b.txt\n\
             \n\
             \n\
             https\n\
             {}\n\
             b\n\
             \n\n\n\n\n\n",
            AZURE_STORAGE_API_VERSION
        );
        assert_eq!(
            sas_string_to_sign(
                "account",
                "container",
                "a/b.txt",
                "rcw",
                "2024-01-15T12:00:00Z",
                "2024-01-15T13:00:00Z",
                "https",
            ),
            expected
        );

        let credential = SharedKeyCredential::try_new("account", "a2V5").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap();
        let query = credential
            .blob_sas_query("container", "a/b.txt", "rcw", start, expiry, true)
            .unwrap();
        let query: BTreeMap<_, _> = query.into_iter().collect();
        assert_eq!(query["sig"], credential.sign(&expected).unwrap());
    }
}
