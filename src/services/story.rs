use crate::core::state::StoryBook;
use crate::services::characters::CharacterValidator;
use crate::services::decode::{self, PromptSheetRecord, TextOnlyRecord};
use crate::services::llm::{generate_with_retry, LlmConfig, TextGenerationBackend};
use crate::services::safety::ContentSafetyPolicy;
use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryOptions {
    #[serde(default = "default_page_count")]
    pub page_count: usize,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default = "default_text_max_tokens")]
    pub text_max_tokens: u32,
    #[serde(default = "default_text_temperature")]
    pub text_temperature: f32,
    #[serde(default = "default_prompt_max_tokens")]
    pub prompt_max_tokens: u32,
    #[serde(default = "default_prompt_temperature")]
    pub prompt_temperature: f32,
}

fn default_page_count() -> usize {
    8
}
fn default_audience() -> String {
    "children aged 3 to 7".to_string()
}
fn default_text_max_tokens() -> u32 {
    2500
}
fn default_text_temperature() -> f32 {
    0.8
}
fn default_prompt_max_tokens() -> u32 {
    2000
}
fn default_prompt_temperature() -> f32 {
    0.4
}

impl Default for StoryOptions {
    fn default() -> Self {
        Self {
            page_count: default_page_count(),
            audience: default_audience(),
            text_max_tokens: default_text_max_tokens(),
            text_temperature: default_text_temperature(),
            prompt_max_tokens: default_prompt_max_tokens(),
            prompt_temperature: default_prompt_temperature(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedStory {
    pub book: StoryBook,
    /// The character sheet had to be rewritten by the assistant model.
    pub characters_repaired_by_model: bool,
}

const TEXT_SYSTEM_PROMPT: &str = "You are an award-winning children's picture book author. \
You write warm, simple, age-appropriate stories. You always answer with a single JSON object and nothing else.";

const PROMPT_SYSTEM_PROMPT: &str = "You are an art director for children's picture books. \
You write one illustration prompt per page. Each prompt opens with the main character's name \
followed by a comma, then describes what is visible: characters, setting, action and mood. \
You always answer with a single JSON object and nothing else.";

pub struct StoryGenerator {
    llm: Arc<dyn TextGenerationBackend>,
    llm_config: LlmConfig,
    safety: Arc<dyn ContentSafetyPolicy>,
    validator: CharacterValidator,
    options: StoryOptions,
}

impl StoryGenerator {
    pub fn new(
        llm: Arc<dyn TextGenerationBackend>,
        llm_config: LlmConfig,
        safety: Arc<dyn ContentSafetyPolicy>,
        validator: CharacterValidator,
        options: StoryOptions,
    ) -> Self {
        Self {
            llm,
            llm_config,
            safety,
            validator,
            options,
        }
    }

    /// Text pass, then prompt pass, then merge and the character sheet gate.
    pub async fn generate(&self, concept: &str) -> Result<GeneratedStory> {
        let concept = self.safety.sanitize(concept.trim());
        if concept.is_empty() {
            bail!("Story concept is empty");
        }

        info!("Writing story text with {}", self.llm.name());
        let text = self.write_text(&concept).await?;

        info!("Writing illustration prompts");
        let prompts = self.write_prompts(&text).await?;

        let mut book = decode::merge(text, prompts, self.options.page_count)?;
        let validated = self
            .validator
            .validate(&book.character_descriptions, &book.pages, &book.title)
            .await;
        book.character_descriptions = validated.text;

        info!("Story \"{}\" has {} pages", book.title, book.pages.len());
        Ok(GeneratedStory {
            book,
            characters_repaired_by_model: validated.repaired_by_model,
        })
    }

    async fn write_text(&self, concept: &str) -> Result<TextOnlyRecord> {
        let user = format!(
            "Write a {pages}-page picture book story for {audience} based on this idea:\n{concept}\n\n\
Reply with JSON in exactly this shape:\n\
{{\"title\": \"...\", \"authorLine\": \"...\", \"moral\": \"...\", \
\"characterDescriptions\": \"one line per character: Name - species, colors, clothing\", \
\"pages\": [{{\"pageNumber\": 1, \"text\": \"...\"}}]}}\n\
Write exactly {pages} pages with two to four short sentences each.",
            pages = self.options.page_count,
            audience = self.options.audience,
            concept = concept,
        );

        let raw = generate_with_retry(
            self.llm.as_ref(),
            &self.llm_config,
            TEXT_SYSTEM_PROMPT,
            &user,
            self.options.text_max_tokens,
            self.options.text_temperature,
        )
        .await?;
        debug!("Story text raw output: {}", raw);
        decode::decode(&raw).context("Failed to decode story text")
    }

    async fn write_prompts(&self, text: &TextOnlyRecord) -> Result<PromptSheetRecord> {
        // Keep the model's own page numbers so merge can match prompts back to pages.
        let pages = text
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.text.trim().is_empty())
            .map(|(i, p)| {
                let number = p.page_number.unwrap_or(i as i64 + 1);
                format!("Page {}: {}", number, decode::clean_text(&p.text))
            })
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!(
            "Story title: {title}\n\nCharacters:\n{characters}\n\nPages:\n{pages}\n\n\
Write one illustration prompt for every page above, using the same page numbers. \
Reply with JSON in exactly this shape:\n\
{{\"prompts\": [{{\"pageNumber\": 1, \"imagePrompt\": \"...\"}}]}}",
            title = text.title,
            characters = text.character_descriptions.as_deref().unwrap_or("(not given)"),
            pages = pages,
        );

        let raw = generate_with_retry(
            self.llm.as_ref(),
            &self.llm_config,
            PROMPT_SYSTEM_PROMPT,
            &user,
            self.options.prompt_max_tokens,
            self.options.prompt_temperature,
        )
        .await?;
        debug!("Prompt sheet raw output: {}", raw);
        decode::decode(&raw).context("Failed to decode illustration prompts")
    }
}
