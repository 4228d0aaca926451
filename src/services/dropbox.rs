//! Minimal Dropbox API client: refresh-token auth and single-shot upload.

use anyhow::{bail, Context, Result};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use super::settings::DropboxCredentials;

const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
const UPLOAD_URL: &str = "https://content.dropboxapi.com/2/files/upload";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Subset of the metadata Dropbox returns for an uploaded file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMetadata {
    pub path_display: String,
    #[serde(default)]
    pub size: u64,
}

pub struct DropboxClient {
    http: reqwest::Client,
    access_token: String,
}

impl DropboxClient {
    /// Exchange the long-lived refresh token for an access token.
    pub async fn connect(credentials: &DropboxCredentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("piusb/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        let response = http
            .post(TOKEN_URL)
            .basic_auth(&credentials.app_key, Some(&credentials.app_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", credentials.refresh_token.as_str()),
            ])
            .send()
            .await
            .context("Dropbox token request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Dropbox token refresh failed: HTTP {}: {}", status.as_u16(), body.trim());
        }
        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse Dropbox token response")?;

        Ok(Self {
            http,
            access_token: token.access_token,
        })
    }

    /// Upload `data` to `path`, overwriting any existing file.
    pub async fn upload(&self, data: Vec<u8>, path: &str) -> Result<FileMetadata> {
        let arg = serde_json::json!({
            "path": path,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        });

        let response = self
            .http
            .post(UPLOAD_URL)
            .bearer_auth(&self.access_token)
            .header("Dropbox-API-Arg", header_safe_json(&arg))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .with_context(|| format!("Dropbox upload request failed: {}", path))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Dropbox API error for {}: HTTP {}: {}",
                path,
                status.as_u16(),
                body.trim()
            );
        }
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Dropbox upload response for {}", path))
    }
}

/// Serialize `value` for an HTTP header: Dropbox wants non-ASCII
/// characters and DEL in `Dropbox-API-Arg` escaped as `\uXXXX`.
pub fn header_safe_json(value: &serde_json::Value) -> String {
    let json = value.to_string();
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() && ch != '\x7f' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}
