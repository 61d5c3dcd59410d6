use super::{decode_image, encode_image, endpoint, ImageGenerationBackend, ImageRequest};
use crate::core::error::GenerationError;
use crate::core::state::{ConceptLabel, ImageData};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SdWebUiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    pub sampler: Option<String>,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    /// How far img2img may drift from the reference image.
    #[serde(default = "default_denoising_strength")]
    pub denoising_strength: f32,
    #[serde(default = "default_character_weight")]
    pub character_weight: f32,
}

fn default_base_url() -> String {
    "http://127.0.0.1:7860".to_string()
}
fn default_steps() -> u32 {
    25
}
fn default_cfg_scale() -> f32 {
    7.0
}
fn default_negative_prompt() -> String {
    "text, watermark, signature, blurry, deformed, scary, violent".to_string()
}
fn default_denoising_strength() -> f32 {
    0.6
}
fn default_character_weight() -> f32 {
    1.3
}

/// Stable Diffusion WebUI (AUTOMATIC1111 API), usually running on this machine.
#[derive(Debug)]
pub struct SdWebUiClient {
    config: SdWebUiConfig,
    client: reqwest::Client,
}

impl SdWebUiClient {
    pub fn new(config: SdWebUiConfig, client: reqwest::Client) -> Result<Self> {
        // Fail on a malformed URL at startup rather than per page.
        endpoint(&config.base_url, "sdapi/v1/txt2img")?;
        Ok(Self { config, client })
    }

    /// Character concepts get emphasis; the rest are listed as-is, then the prompt and style.
    fn weighted_prompt(&self, request: &ImageRequest) -> String {
        let mut concepts = request.concepts.clone();
        concepts.sort_by_key(|c| c.label);

        let mut parts: Vec<String> = concepts
            .iter()
            .map(|c| match c.label {
                ConceptLabel::Character => format!("({}:{:.1})", c.text, self.config.character_weight),
                _ => c.text.clone(),
            })
            .collect();
        parts.push(request.prompt.trim().trim_end_matches('.').to_string());
        if !request.style.trim().is_empty() {
            parts.push(request.style.trim().to_string());
        }
        parts.join(", ")
    }
}

#[derive(Serialize)]
struct Txt2ImgBody {
    prompt: String,
    negative_prompt: String,
    steps: u32,
    cfg_scale: f32,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    sampler_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    init_images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    denoising_strength: Option<f32>,
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    images: Vec<String>,
}

#[async_trait]
impl ImageGenerationBackend for SdWebUiClient {
    async fn generate(&self, request: &ImageRequest) -> Result<ImageData> {
        let (path, init_images, denoising_strength) = match &request.reference_image {
            Some(reference) => (
                "sdapi/v1/img2img",
                Some(vec![encode_image(reference)]),
                Some(self.config.denoising_strength),
            ),
            None => ("sdapi/v1/txt2img", None, None),
        };
        let url = endpoint(&self.config.base_url, path)?;

        let body = Txt2ImgBody {
            prompt: self.weighted_prompt(request),
            negative_prompt: self.config.negative_prompt.clone(),
            steps: self.config.steps,
            cfg_scale: self.config.cfg_scale,
            width: request.dimensions.width,
            height: request.dimensions.height,
            sampler_name: self.config.sampler.clone(),
            init_images,
            denoising_strength,
        };

        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    GenerationError::GeneratorUnavailable(format!("SD WebUI at {}", self.config.base_url)).into()
                } else {
                    GenerationError::from_reqwest(e)
                }
            })?;
        let resp = GenerationError::check_response(resp).await?;

        let result: ImagesResponse = resp.json().await.context("Failed to parse SD WebUI response")?;
        match result.images.first() {
            Some(b64) => decode_image(b64),
            None => Err(GenerationError::NoImageProduced.into()),
        }
    }

    fn name(&self) -> &str {
        "sdwebui"
    }

    fn accepts_concepts(&self) -> bool {
        true
    }
}
