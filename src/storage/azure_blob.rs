//! Azure Blob Storage upload over the REST API (Put Blob).
//!
//! Authorization is either SharedKey, signed from the account key in the
//! connection string, or a SAS token when the connection string carries one.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use url::Url;

use super::BlobStore;
use crate::signing::{parse_key_value_pairs, SharedKey};

pub const DEFAULT_CONTAINER: &str = "images-container";
const DEFAULT_PROTOCOL: &str = "https";
const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";
const STORAGE_API_VERSION: &str = "2021-08-06";
const MAX_ERROR_BODY: usize = 256;

#[derive(Clone, Debug)]
enum StorageAuth {
    SharedKey { account: String, key: SharedKey },
    Sas(String),
}

/// Parsed Azure Storage connection string.
#[derive(Clone, Debug)]
pub struct StorageConnectionString {
    blob_endpoint: String,
    auth: StorageAuth,
}

impl StorageConnectionString {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut protocol = DEFAULT_PROTOCOL.to_string();
        let mut suffix = DEFAULT_ENDPOINT_SUFFIX.to_string();
        let mut account_name = None;
        let mut account_key = None;
        let mut blob_endpoint = None;
        let mut sas = None;

        for (key, value) in parse_key_value_pairs(raw)? {
            match key.as_str() {
                "DefaultEndpointsProtocol" => protocol = value,
                "EndpointSuffix" => suffix = value,
                "AccountName" => account_name = Some(value),
                "AccountKey" => account_key = Some(value),
                "BlobEndpoint" => blob_endpoint = Some(value),
                "SharedAccessSignature" => sas = Some(value),
                "UseDevelopmentStorage" => {
                    return Err(anyhow!("development storage connection strings are not supported"))
                }
                other => log::debug!("ignoring storage connection string key {}", other),
            }
        }

        let blob_endpoint = match (blob_endpoint, account_name.as_deref()) {
            (Some(endpoint), _) => endpoint.trim_end_matches('/').to_string(),
            (None, Some(account)) => format!("{}://{}.blob.{}", protocol, account, suffix),
            (None, None) => {
                return Err(anyhow!(
                    "storage connection string needs AccountName or BlobEndpoint"
                ))
            }
        };

        let auth = match (sas, account_name, account_key) {
            (Some(token), _, _) => StorageAuth::Sas(token.trim_start_matches('?').to_string()),
            (None, Some(account), Some(key)) => StorageAuth::SharedKey {
                account,
                key: SharedKey::from_base64(&key).context("invalid AccountKey")?,
            },
            _ => {
                return Err(anyhow!(
                    "storage connection string needs AccountKey or SharedAccessSignature"
                ))
            }
        };

        Ok(Self {
            blob_endpoint,
            auth,
        })
    }

    pub fn blob_endpoint(&self) -> &str {
        &self.blob_endpoint
    }

    pub fn uses_sas(&self) -> bool {
        matches!(self.auth, StorageAuth::Sas(_))
    }
}

/// Uploads images into one container.
pub struct AzureBlobStore {
    agent: ureq::Agent,
    connection: StorageConnectionString,
    container: String,
}

impl AzureBlobStore {
    pub fn new(connection: StorageConnectionString, container: &str, timeout: Duration) -> Result<Self> {
        validate_container_name(container)?;
        let store = Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            connection,
            container: container.to_string(),
        };
        // Fail at startup on an endpoint that cannot form blob URLs.
        store.blob_url("probe")?;
        log::info!(
            "blob storage {} container={} (auth: {})",
            store.connection.blob_endpoint,
            store.container,
            if store.connection.uses_sas() { "sas" } else { "shared key" }
        );
        Ok(store)
    }

    fn blob_url(&self, blob_name: &str) -> Result<Url> {
        let mut url = Url::parse(&self.connection.blob_endpoint).with_context(|| {
            format!("invalid blob endpoint {}", self.connection.blob_endpoint)
        })?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("blob endpoint cannot carry a path"))?
            .pop_if_empty()
            .push(&self.container)
            .push(blob_name);
        if let StorageAuth::Sas(token) = &self.connection.auth {
            url.set_query(Some(token));
        }
        Ok(url)
    }
}

impl BlobStore for AzureBlobStore {
    fn upload(
        &mut self,
        path: &Path,
        blob_name: &str,
        content_type: &str,
        overwrite: bool,
    ) -> Result<()> {
        if blob_name.is_empty() {
            return Err(anyhow!("blob name is empty"));
        }
        let body =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let url = self.blob_url(blob_name)?;
        let date = rfc1123_now();

        let mut request = self
            .agent
            .put(url.as_str())
            .set("x-ms-blob-type", "BlockBlob")
            .set("x-ms-date", &date)
            .set("x-ms-version", STORAGE_API_VERSION)
            .set("Content-Type", content_type);
        if !overwrite {
            request = request.set("If-None-Match", "*");
        }
        if let StorageAuth::SharedKey { account, key } = &self.connection.auth {
            let to_sign = PutBlobSignature {
                content_length: body.len(),
                content_type,
                if_none_match: if overwrite { "" } else { "*" },
                date: &date,
                resource: &format!("/{}{}", account, url.path()),
            }
            .string_to_sign();
            let signature = key.sign(&to_sign)?;
            request = request.set("Authorization", &format!("SharedKey {}:{}", account, signature));
        }

        match request.send_bytes(&body) {
            Ok(_) => {
                log::info!(
                    "image '{}' uploaded to '{}' ({} bytes)",
                    blob_name,
                    self.container,
                    body.len()
                );
                Ok(())
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
                Err(anyhow!("blob upload returned status {}: {}", code, snippet))
            }
            Err(e) => Err(anyhow!("blob upload failed: {}", e)),
        }
    }
}

/// Inputs to the SharedKey string-to-sign for a Put Blob request.
struct PutBlobSignature<'a> {
    content_length: usize,
    content_type: &'a str,
    if_none_match: &'a str,
    date: &'a str,
    resource: &'a str,
}

impl PutBlobSignature<'_> {
    fn string_to_sign(&self) -> String {
        // Zero length is signed as an empty field since API version 2015-02-21.
        let length = if self.content_length == 0 {
            String::new()
        } else {
            self.content_length.to_string()
        };
        let canonical = format!(
            "x-ms-blob-type:BlockBlob\nx-ms-date:{}\nx-ms-version:{}\n{}",
            self.date, STORAGE_API_VERSION, self.resource
        );
        let fields: [&str; 13] = [
            "PUT",
            "", // Content-Encoding
            "", // Content-Language
            length.as_str(),
            "", // Content-MD5
            self.content_type,
            "", // Date (x-ms-date is used)
            "", // If-Modified-Since
            "", // If-Match
            self.if_none_match,
            "", // If-Unmodified-Since
            "", // Range
            canonical.as_str(),
        ];
        fields.join("\n")
    }
}

fn rfc1123_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn validate_container_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !(3..=63).contains(&name.len())
        || !valid_chars
        || name.starts_with('-')
        || name.ends_with('-')
        || name.contains("--")
    {
        return Err(anyhow!("invalid blob container name '{}'", name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn shared_key_conn() -> String {
        format!(
            "DefaultEndpointsProtocol=https;AccountName=feederacct;AccountKey={};EndpointSuffix=core.windows.net",
            KEY
        )
    }

    #[test]
    fn parses_account_key_connection_string() {
        let conn = StorageConnectionString::parse(&shared_key_conn()).expect("parse");
        assert_eq!(conn.blob_endpoint(), "https://feederacct.blob.core.windows.net");
        assert!(!conn.uses_sas());
    }

    #[test]
    fn parses_sas_connection_string() {
        let conn = StorageConnectionString::parse(
            "BlobEndpoint=https://feederacct.blob.core.windows.net/;SharedAccessSignature=sv=2022-11-02&ss=b&sig=abc%3D",
        )
        .expect("parse");
        assert_eq!(conn.blob_endpoint(), "https://feederacct.blob.core.windows.net");
        assert!(conn.uses_sas());
    }

    #[test]
    fn rejects_connection_string_without_credentials() {
        assert!(StorageConnectionString::parse("AccountName=feederacct").is_err());
        assert!(StorageConnectionString::parse("AccountKey=abc=").is_err());
        assert!(StorageConnectionString::parse("UseDevelopmentStorage=true").is_err());
    }

    #[test]
    fn blob_url_contains_container_and_name() {
        let conn = StorageConnectionString::parse(&shared_key_conn()).expect("parse");
        let store =
            AzureBlobStore::new(conn, DEFAULT_CONTAINER, Duration::from_secs(1)).expect("store");
        let url = store.blob_url("bird_2024-05-04_07-08-09.jpg").expect("url");
        assert_eq!(
            url.as_str(),
            "https://feederacct.blob.core.windows.net/images-container/bird_2024-05-04_07-08-09.jpg"
        );
    }

    #[test]
    fn sas_token_is_appended_as_query() {
        let conn = StorageConnectionString::parse(
            "BlobEndpoint=https://acct.blob.core.windows.net;SharedAccessSignature=?sv=1&sig=x",
        )
        .expect("parse");
        let store =
            AzureBlobStore::new(conn, DEFAULT_CONTAINER, Duration::from_secs(1)).expect("store");
        assert_eq!(
            store.blob_url("a.jpg").expect("url").as_str(),
            "https://acct.blob.core.windows.net/images-container/a.jpg?sv=1&sig=x"
        );
    }

    #[test]
    fn shared_key_signature_matches_reference() {
        let to_sign = PutBlobSignature {
            content_length: 8,
            content_type: "image/jpeg",
            if_none_match: "",
            date: "Sat, 04 May 2024 07:08:09 GMT",
            resource: "/feederacct/images-container/bird_2024-05-04_07-08-09.jpg",
        }
        .string_to_sign();
        assert_eq!(
            to_sign,
            "PUT\n\n\n8\n\nimage/jpeg\n\n\n\n\n\n\nx-ms-blob-type:BlockBlob\nx-ms-date:Sat, 04 May 2024 07:08:09 GMT\nx-ms-version:2021-08-06\n/feederacct/images-container/bird_2024-05-04_07-08-09.jpg"
        );
        let key = SharedKey::from_base64(KEY).expect("key");
        assert_eq!(
            key.sign(&to_sign).expect("sign"),
            "dD53ffgKRARBH4oKQlzvR2L8YLKCINuS2D1se7H6mEY="
        );
    }

    #[test]
    fn container_names_are_validated() {
        assert!(validate_container_name("images-container").is_ok());
        assert!(validate_container_name("Images").is_err());
        assert!(validate_container_name("ab").is_err());
        assert!(validate_container_name("a--b").is_err());
    }

    #[test]
    fn missing_file_fails_before_request() {
        let conn = StorageConnectionString::parse(&shared_key_conn()).expect("parse");
        let mut store =
            AzureBlobStore::new(conn, DEFAULT_CONTAINER, Duration::from_secs(1)).expect("store");
        let err = store
            .upload(Path::new("/nonexistent/bird.jpg"), "bird.jpg", "image/jpeg", true)
            .unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
