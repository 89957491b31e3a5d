//! LiveKit egress adapter.
//!
//! Talks to the server's Twirp JSON API with a short-lived HS256 access
//! token minted from the configured API key and secret.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::config::EgressConfig;
use crate::domain::{EgressFile, EgressInfo, RemoteEgressStatus};

use super::{EgressPlatform, EgressRequest};

/// Access tokens are valid this long
const TOKEN_TTL_SECS: i64 = 600;

/// LiveKit egress service client
pub struct LiveKitEgressClient {
    base_url: String,
    api_key: String,
    api_secret: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    nbf: i64,
    exp: i64,
    video: VideoGrant,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoGrant {
    room_record: bool,
}

/// EgressInfo as returned by the server (snake_case or camelCase)
#[derive(Debug, Deserialize)]
struct WireEgressInfo {
    #[serde(alias = "egressId")]
    egress_id: String,
    #[serde(default)]
    status: Option<RemoteEgressStatus>,
    #[serde(default, alias = "fileResults")]
    file_results: Vec<WireFileInfo>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireFileInfo {
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    size: Option<WireSize>,
}

/// int64 fields arrive as JSON strings from protojson encoders
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireSize {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct ListEgressResponse {
    #[serde(default)]
    items: Vec<WireEgressInfo>,
}

impl From<WireEgressInfo> for EgressInfo {
    fn from(wire: WireEgressInfo) -> Self {
        let file = wire.file_results.into_iter().next().map(|f| EgressFile {
            location: f.location.filter(|l| !l.is_empty()),
            size_bytes: match f.size {
                Some(WireSize::Number(n)) => Some(n),
                Some(WireSize::Text(s)) => s.parse().ok(),
                None => None,
            },
        });

        EgressInfo {
            egress_id: wire.egress_id,
            status: wire.status.unwrap_or(RemoteEgressStatus::Starting),
            file,
            error: wire.error.filter(|e| !e.is_empty()),
        }
    }
}

impl LiveKitEgressClient {
    pub fn new(config: &EgressConfig) -> Self {
        Self {
            base_url: http_base_url(&config.ws_url),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Build Twirp method URL
    fn api_url(&self, method: &str) -> String {
        format!("{}/twirp/livekit.Egress/{}", self.base_url, method)
    }

    /// Mint a token allowed to manage room recordings
    fn access_token(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = serde_json::to_vec(&Claims {
            iss: &self.api_key,
            nbf: now,
            exp: now + TOKEN_TTL_SECS,
            video: VideoGrant { room_record: true },
        })
        .context("Failed to encode token claims")?;

        let signing_input = format!("{}.{}", header, URL_SAFE_NO_PAD.encode(claims));
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| anyhow::anyhow!("Invalid API secret"))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", signing_input, signature))
    }

    async fn call<R>(&self, method: &str, body: serde_json::Value) -> Result<R>
    where
        R: serde::de::DeserializeOwned,
    {
        let url = self.api_url(method);
        let token = self.access_token()?;

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to call egress {}", method))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Egress API error ({}): {}", status, text);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse egress {} response", method))
    }
}

#[async_trait]
impl EgressPlatform for LiveKitEgressClient {
    async fn start_audio_egress(&self, request: &EgressRequest) -> Result<EgressInfo> {
        let out = &request.output;
        let body = serde_json::json!({
            "room_name": request.room_name,
            "layout": "speaker",
            "audio_only": true,
            "file_outputs": [{
                "file_type": "MP4",
                "filepath": out.key,
                "s3": {
                    "access_key": out.access_key,
                    "secret": out.secret,
                    "session_token": out.session_token.clone().unwrap_or_default(),
                    "region": out.region,
                    "endpoint": out.endpoint.clone().unwrap_or_default(),
                    "bucket": out.bucket,
                    "force_path_style": out.force_path_style,
                },
            }],
        });

        let info: WireEgressInfo = self.call("StartRoomCompositeEgress", body).await?;
        debug!(egress_id = %info.egress_id, room = %request.room_name, "Egress started");
        Ok(info.into())
    }

    async fn stop_egress(&self, egress_id: &str) -> Result<EgressInfo> {
        let info: WireEgressInfo = self
            .call("StopEgress", serde_json::json!({ "egress_id": egress_id }))
            .await?;
        Ok(info.into())
    }

    async fn get_egress(&self, egress_id: &str) -> Result<EgressInfo> {
        let list: ListEgressResponse = self
            .call("ListEgress", serde_json::json!({ "egress_id": egress_id }))
            .await?;

        list.items
            .into_iter()
            .find(|info| info.egress_id == egress_id)
            .map(EgressInfo::from)
            .with_context(|| format!("Egress {} not found", egress_id))
    }
}

/// Map the signalling URL to the HTTP API base
fn http_base_url(ws_url: &str) -> String {
    let trimmed = ws_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        trimmed.to_string()
    }
}
