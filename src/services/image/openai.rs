use super::{decode_image, endpoint, image_data, ImageGenerationBackend, ImageRequest};
use crate::core::error::GenerationError;
use crate::core::state::ImageData;
use crate::services::llm::resolve_api_key;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::multipart;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIImageConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub quality: Option<String>,
}

fn default_model() -> String {
    "gpt-image-1".to_string()
}

#[derive(Debug)]
pub struct OpenAIImageClient {
    api_key: String,
    config: OpenAIImageConfig,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIImageClient {
    pub fn new(config: OpenAIImageConfig, client: reqwest::Client) -> Result<Self> {
        let api_key = resolve_api_key(config.api_key.as_deref(), "OPENAI_API_KEY", "openai")?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            api_key,
            config,
            base_url,
            client,
        })
    }

    fn wants_b64_format(&self) -> bool {
        self.config.model.starts_with("dall-e")
    }

    async fn create(&self, request: &ImageRequest) -> Result<reqwest::Response> {
        let url = endpoint(&self.base_url, "images/generations")?;
        let body = GenerationBody {
            model: self.config.model.clone(),
            prompt: request.full_prompt(),
            n: 1,
            size: request.dimensions.size_string(),
            quality: self.config.quality.clone(),
            response_format: self.wants_b64_format().then(|| "b64_json".to_string()),
        };

        self.client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(GenerationError::from_reqwest)
    }

    async fn edit(&self, request: &ImageRequest, reference: &[u8]) -> Result<reqwest::Response> {
        let url = endpoint(&self.base_url, "images/edits")?;
        let part = multipart::Part::bytes(reference.to_vec())
            .file_name("reference.png")
            .mime_str("image/png")?;

        let mut form = multipart::Form::new()
            .part("image", part)
            .text("model", self.config.model.clone())
            .text("prompt", request.full_prompt())
            .text("n", "1")
            .text("size", request.dimensions.size_string());
        if let Some(quality) = &self.config.quality {
            form = form.text("quality", quality.clone());
        }
        if self.wants_b64_format() {
            form = form.text("response_format", "b64_json");
        }

        self.client
            .post(url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(GenerationError::from_reqwest)
    }

    async fn download(&self, url: &str) -> Result<ImageData> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(GenerationError::from_reqwest)?;
        let resp = GenerationError::check_response(resp).await?;
        let bytes = resp.bytes().await?;
        Ok(image_data(bytes.to_vec()))
    }
}

#[derive(Serialize)]
struct GenerationBody {
    model: String,
    prompt: String,
    n: u32,
    size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<String>,
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageItem>,
}

#[derive(Deserialize)]
struct ImageItem {
    b64_json: Option<String>,
    url: Option<String>,
}

/// Safety-system refusals come back as plain 400s; surface them as rejections.
fn classify(err: anyhow::Error) -> anyhow::Error {
    if let Some(GenerationError::BackendHttp { status: 400, message }) = GenerationError::of(&err) {
        let lower = message.to_lowercase();
        if ["content_policy", "safety", "moderation"]
            .iter()
            .any(|marker| lower.contains(marker))
        {
            return GenerationError::ContentRejected.into();
        }
    }
    err
}

#[async_trait]
impl ImageGenerationBackend for OpenAIImageClient {
    async fn generate(&self, request: &ImageRequest) -> Result<ImageData> {
        let resp = match &request.reference_image {
            Some(reference) => self.edit(request, reference).await?,
            None => self.create(request).await?,
        };
        let resp = GenerationError::check_response(resp).await.map_err(classify)?;

        let body: ImagesResponse = resp.json().await.context("Failed to parse OpenAI image response")?;
        let Some(item) = body.data.into_iter().next() else {
            return Err(GenerationError::NoImageProduced.into());
        };

        if let Some(b64) = item.b64_json {
            return decode_image(&b64);
        }
        if let Some(url) = item.url {
            debug!("Downloading generated image from {}", url);
            return self.download(&url).await;
        }
        Err(GenerationError::NoImageProduced.into())
    }

    fn name(&self) -> &str {
        "openai"
    }
}
