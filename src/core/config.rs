use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::analysis::AnalysisOptions;
use crate::services::characters::ValidatorOptions;
use crate::services::enrichment::EnrichmentOptions;
use crate::services::illustration::IllustrationOptions;
use crate::services::image::ImageConfig;
use crate::services::llm::LlmConfig;
use crate::services::safety::SafetyConfig;
use crate::services::story::StoryOptions;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub story: StoryOptions,

    #[serde(default)]
    pub characters: ValidatorOptions,

    #[serde(default)]
    pub analysis: AnalysisOptions,

    #[serde(default)]
    pub enrichment: EnrichmentOptions,

    #[serde(default)]
    pub illustration: IllustrationOptions,

    #[serde(default)]
    pub safety: SafetyConfig,
}

fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config.yml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() -> Result<()> {
        let config: Config = serde_yaml_ng::from_str(
            "llm:\n  provider: ollama\n  ollama:\n    base_url: http://localhost:11434\n    model: llama3\n",
        )?;
        assert_eq!(config.output_folder, "output");
        assert_eq!(config.build_folder, "build");
        assert!(!config.unattended);
        assert_eq!(config.image.provider, "openai");
        assert_eq!(config.story.page_count, 8);
        assert_eq!(config.illustration.concurrency, 3);
        assert_eq!(config.characters.repair_prompt_limit, 8);
        assert_eq!(config.enrichment.proximity_window, 30);
        assert!(config.safety.replacements.contains_key("monster"));
        Ok(())
    }

    #[test]
    fn test_sections_override_defaults() -> Result<()> {
        let yaml = r#"
output_folder: books
unattended: true
llm:
  provider: openai
  assistant: ollama
  openai:
    model: gpt-4o-mini
  ollama:
    base_url: http://localhost:11434
    model: llama3
image:
  provider: sdwebui
  style: crayon drawing
  width: 768
  sdwebui:
    base_url: http://127.0.0.1:7860
story:
  page_count: 12
illustration:
  concurrency: 5
"#;
        let config: Config = serde_yaml_ng::from_str(yaml)?;
        assert_eq!(config.output_folder, "books");
        assert!(config.unattended);
        assert_eq!(config.llm.assistant.as_deref(), Some("ollama"));
        assert_eq!(config.image.style, "crayon drawing");
        assert_eq!(config.image.width, 768);
        assert_eq!(config.image.height, 1024);
        assert_eq!(config.image.sdwebui.as_ref().map(|s| s.steps), Some(25));
        assert_eq!(config.story.page_count, 12);
        assert_eq!(config.illustration.concurrency, 5);
        assert_eq!(config.illustration.attempts_per_variant, 2);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(temp_dir.path().join("config.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
