use std::io::{Cursor, Read};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client};
use thiserror::Error;
use tracing::{debug, info, error};

use crate::payload::PayloadDocument;

pub const DEFAULT_API_BASE: &str = "https://image.novelai.net";
const IMAGE_EXTENSION: &str = ".png";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("API error: {status} - {detail}")]
    Remote { status: u16, detail: String },
    #[error("network error: {0}")]
    Transport(String),
    #[error("no image in response")]
    EmptyResponse,
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
}

/// Raw answer from the generation endpoint; status handling is left to the caller.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}

#[async_trait]
pub trait ImageApi: Send + Sync {
    /// Only transport-level problems are errors here; any HTTP status is a response.
    async fn generate(&self, payload: &PayloadDocument) -> Result<ApiResponse, GenerationError>;
}

pub struct NaiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl NaiClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/ai/generate-image", self.base_url)
    }
}

#[async_trait]
impl ImageApi for NaiClient {
    async fn generate(&self, payload: &PayloadDocument) -> Result<ApiResponse, GenerationError> {
        let url = self.endpoint();
        info!("🔗 Making request to: {} (model {})", url, payload.model.id());
        debug!("📤 Request body: {}", serde_json::to_string(payload).unwrap_or_default());

        let response = self.client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header(header::ACCEPT, "application/zip")
            .json(payload)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        let body = response.bytes().await.map_err(|e| GenerationError::Transport(e.to_string()))?;
        if !status.is_success() {
            error!("❌ API Error response: {}", String::from_utf8_lossy(&body));
        }
        Ok(ApiResponse { status: status.as_u16(), body })
    }
}

/// Pull the first `.png` entry out of a zip archive. `Ok(None)` when the
/// archive is readable but holds no image.
pub fn extract_first_image(archive: &[u8]) -> Result<Option<Vec<u8>>, GenerationError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| GenerationError::InvalidArchive(e.to_string()))?;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| GenerationError::InvalidArchive(e.to_string()))?;
        if !entry.name().ends_with(IMAGE_EXTENSION) {
            continue;
        }
        info!("🎯 Found image entry {} ({} bytes)", entry.name(), entry.size());
        let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
        entry.read_to_end(&mut data).map_err(|e| GenerationError::InvalidArchive(e.to_string()))?;
        return Ok(Some(data));
    }
    info!("⚠️ No image entry found in archive");
    Ok(None)
}
