use crate::core::state::{Concept, ImageData};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub mod openai;
pub mod sdwebui;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn size_string(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub style: String,
    pub dimensions: Dimensions,
    pub reference_image: Option<Arc<Vec<u8>>>,
    pub concepts: Vec<Concept>,
}

impl ImageRequest {
    /// Prompt with the art style appended, for backends that take a single text field.
    pub fn full_prompt(&self) -> String {
        let prompt = self.prompt.trim().trim_end_matches('.');
        if self.style.trim().is_empty() {
            prompt.to_string()
        } else {
            format!("{}. Style: {}", prompt, self.style.trim())
        }
    }
}

#[async_trait]
pub trait ImageGenerationBackend: Send + Sync + Debug {
    async fn generate(&self, request: &ImageRequest) -> Result<ImageData>;

    fn name(&self) -> &str;

    /// Whether labeled concepts change what this backend draws.
    fn accepts_concepts(&self) -> bool {
        false
    }
}

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_provider")]
    pub provider: String, // "openai" or "sdwebui"
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default = "default_size")]
    pub width: u32,
    #[serde(default = "default_size")]
    pub height: u32,
    /// Retry a failed request once on the local backend.
    #[serde(default = "default_local_fallback")]
    pub local_fallback: bool,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Image handed to every request so characters stay on model.
    pub reference_image: Option<String>,
    pub openai: Option<openai::OpenAIImageConfig>,
    pub sdwebui: Option<sdwebui::SdWebUiConfig>,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_style() -> String {
    "soft watercolor children's picture book illustration".to_string()
}
fn default_size() -> u32 {
    1024
}
fn default_local_fallback() -> bool {
    true
}
fn default_timeout() -> u64 {
    180
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            style: default_style(),
            width: default_size(),
            height: default_size(),
            local_fallback: default_local_fallback(),
            timeout_seconds: default_timeout(),
            reference_image: None,
            openai: None,
            sdwebui: None,
        }
    }
}

impl ImageConfig {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }
}

pub fn create_image_backend(config: &ImageConfig) -> Result<Arc<dyn ImageGenerationBackend>> {
    info!("Initializing image backend for provider: {}", config.provider);
    create_backend(config, &config.provider)
}

/// The on-machine backend used when the primary one fails, if configured.
pub fn create_local_backend(config: &ImageConfig) -> Result<Option<Arc<dyn ImageGenerationBackend>>> {
    if !config.local_fallback || config.provider == "sdwebui" || config.sdwebui.is_none() {
        return Ok(None);
    }
    create_backend(config, "sdwebui").map(Some)
}

fn create_backend(config: &ImageConfig, provider: &str) -> Result<Arc<dyn ImageGenerationBackend>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_seconds))
        .build()?;

    match provider {
        "openai" => {
            let cfg = config.openai.clone().context("OpenAI image config missing")?;
            Ok(Arc::new(openai::OpenAIImageClient::new(cfg, client)?))
        }
        "sdwebui" => {
            let cfg = config.sdwebui.clone().context("SD WebUI config missing")?;
            Ok(Arc::new(sdwebui::SdWebUiClient::new(cfg, client)?))
        }
        _ => Err(anyhow!("Unknown image provider: {}", provider)),
    }
}

// --- Helpers shared by the providers ---

/// Joins `path` onto `base` even when the base has no trailing slash.
pub(crate) fn endpoint(base: &str, path: &str) -> Result<Url> {
    let base = if base.ends_with('/') {
        Url::parse(base)
    } else {
        Url::parse(&format!("{}/", base))
    }
    .with_context(|| format!("Invalid base URL: {}", base))?;
    Ok(base.join(path.trim_start_matches('/'))?)
}

pub(crate) fn decode_image(b64: &str) -> Result<ImageData> {
    // Some servers prefix a data URL header.
    let payload = b64.split_once("base64,").map(|(_, data)| data).unwrap_or(b64);
    let bytes = BASE64
        .decode(payload.trim().as_bytes())
        .context("Image base64 decode failed")?;
    Ok(image_data(bytes))
}

pub(crate) fn encode_image(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub(crate) fn image_data(bytes: Vec<u8>) -> ImageData {
    let mime_type = if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/png"
    };
    ImageData {
        bytes,
        mime_type: mime_type.to_string(),
    }
}
