//! S3-compatible object store client.
//!
//! Signs `PUT` requests with AWS Signature Version 4 using the credentials it
//! was constructed with. There is no profile, instance-metadata or
//! environment lookup. The payload SHA-256 is part of the signature, so the
//! store rejects a body that arrives truncated.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::StorageConfig;
use crate::domain::StorageLocation;

use super::{ObjectStore, PutReceipt};

type HmacSha256 = Hmac<Sha256>;

/// Object store client bound to one bucket
#[derive(Clone)]
pub struct S3Client {
    config: StorageConfig,
    client: reqwest::Client,
}

impl S3Client {
    /// Create a client from explicit settings
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Build the object URL for a key, honoring path-style addressing
    pub fn object_url(&self, key: &str) -> Result<Url> {
        let endpoint = self
            .config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.config.region));
        let mut url = Url::parse(&endpoint)
            .with_context(|| format!("Invalid S3 endpoint: {}", endpoint))?;

        let encoded_key = encode_key(key);
        if self.config.force_path_style {
            url.set_path(&format!("/{}/{}", self.config.bucket, encoded_key));
        } else {
            let host = url
                .host_str()
                .with_context(|| format!("S3 endpoint has no host: {}", endpoint))?
                .to_string();
            url.set_host(Some(&format!("{}.{}", self.config.bucket, host)))
                .context("Invalid virtual-hosted bucket name")?;
            url.set_path(&format!("/{}", encoded_key));
        }

        Ok(url)
    }

    fn extra_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(ref token) = self.config.credentials.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        if let Some(ref sse) = self.config.sse {
            headers.push(("x-amz-server-side-encryption", sse.clone()));
        }
        if let Some(ref kms_key) = self.config.sse_kms_key_id {
            headers.push(("x-amz-server-side-encryption-aws-kms-key-id", kms_key.clone()));
        }
        headers
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    fn location(&self, key: &str) -> StorageLocation {
        StorageLocation {
            bucket: self.config.bucket.clone(),
            key: key.to_string(),
            region: Some(self.config.region.clone()),
            endpoint: self.config.endpoint.clone(),
        }
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<PutReceipt> {
        let url = self.object_url(key)?;
        let payload_hash = hex::encode(Sha256::digest(&body));

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        headers.insert("host".to_string(), host_header(&url)?);
        headers.insert("content-type".to_string(), content_type.to_string());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        for (name, value) in self.extra_headers() {
            headers.insert(name.to_string(), value);
        }

        let signed = sign_v4(
            "PUT",
            url.path(),
            &mut headers,
            &payload_hash,
            &self.config,
            Utc::now(),
        )?;

        let size_bytes = body.len() as u64;
        let mut request = self.client.put(url.clone()).body(body);
        for (name, value) in &headers {
            if name != "host" {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        request = request.header("authorization", signed);

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to PUT {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "S3 PUT {} failed with {}: {}",
                key,
                status,
                body.chars().take(300).collect::<String>()
            );
        }

        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        debug!(bucket = %self.config.bucket, key, size_bytes, "Object written");

        Ok(PutReceipt { etag, size_bytes })
    }
}

/// URI-encode each path segment of a key, keeping the separators
pub fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn host_header(url: &Url) -> Result<String> {
    let host = url.host_str().context("URL has no host")?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| anyhow::anyhow!("Invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compute the SigV4 `Authorization` header value.
///
/// Adds `x-amz-date` to `headers`; every header in the map is signed.
pub fn sign_v4(
    method: &str,
    canonical_uri: &str,
    headers: &mut BTreeMap<String, String>,
    payload_hash: &str,
    config: &StorageConfig,
    now: DateTime<Utc>,
) -> Result<String> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    headers.insert("x-amz-date".to_string(), amz_date.clone());

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{}/{}/s3/aws4_request", date_stamp, config.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let secret = format!("AWS4{}", config.credentials.secret_access_key);
    let k_date = hmac_sha256(secret.as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, config.region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, b"s3")?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        config.credentials.access_key_id, scope, signed_headers, signature
    ))
}
