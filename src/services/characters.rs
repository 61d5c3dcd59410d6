use crate::core::state::{StoryPage, ValidatedCharacters};
use crate::services::decode::clean_text;
use crate::services::llm::SharedModel;
use crate::services::vocabulary::{self, CLOTHING, COLORS, SCENE_STARTERS};
use crate::utils::text::{collapse_whitespace, letters_only_lowercase, word_count};
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ValidatorOptions {
    #[serde(default = "default_dash_min_words")]
    pub dash_min_words: usize,
    #[serde(default = "default_plain_min_words")]
    pub plain_min_words: usize,
    #[serde(default = "default_repair_prompt_limit")]
    pub repair_prompt_limit: usize,
    #[serde(default = "default_max_extracted_characters")]
    pub max_extracted_characters: usize,
    #[serde(default = "default_max_details")]
    pub max_details: usize,
    #[serde(default = "default_repair_max_tokens")]
    pub repair_max_tokens: u32,
    #[serde(default = "default_repair_temperature")]
    pub repair_temperature: f32,
}

fn default_dash_min_words() -> usize {
    4
}
fn default_plain_min_words() -> usize {
    5
}
fn default_repair_prompt_limit() -> usize {
    8
}
fn default_max_extracted_characters() -> usize {
    4
}
fn default_max_details() -> usize {
    3
}
fn default_repair_max_tokens() -> u32 {
    300
}
fn default_repair_temperature() -> f32 {
    0.3
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            dash_min_words: default_dash_min_words(),
            plain_min_words: default_plain_min_words(),
            repair_prompt_limit: default_repair_prompt_limit(),
            max_extracted_characters: default_max_extracted_characters(),
            max_details: default_max_details(),
            repair_max_tokens: default_repair_max_tokens(),
            repair_temperature: default_repair_temperature(),
        }
    }
}

pub fn is_adequate(text: &str) -> bool {
    is_adequate_with(text, &ValidatorOptions::default())
}

/// A sheet is usable once a single line reads like a real description.
/// Separator tokens such as `-` are not counted as words.
pub fn is_adequate_with(text: &str, options: &ValidatorOptions) -> bool {
    text.lines().any(|line| {
        let words = description_words(line);
        (line.contains(" - ") && words >= options.dash_min_words) || words >= options.plain_min_words
    })
}

fn description_words(line: &str) -> usize {
    line.split_whitespace()
        .filter(|token| token.chars().any(char::is_alphanumeric))
        .count()
}

const REPAIR_SYSTEM_PROMPT: &str = "You write character sheets for children's picture books. \
For every recurring character write exactly one line in the form \
'Name - species, colors, clothing or distinctive look'. \
Describe only what can be seen. Output the lines and nothing else.";

pub struct CharacterValidator {
    assistant: Option<SharedModel>,
    options: ValidatorOptions,
}

impl CharacterValidator {
    pub fn new(assistant: Option<SharedModel>, options: ValidatorOptions) -> Self {
        Self { assistant, options }
    }

    /// Always returns a sheet; when any page has text the sheet is non-empty.
    pub async fn validate(
        &self,
        descriptions: &str,
        pages: &[StoryPage],
        title: &str,
    ) -> ValidatedCharacters {
        let original = clean_text(descriptions);
        if is_adequate_with(&original, &self.options) {
            return ValidatedCharacters {
                text: original,
                repaired_by_model: false,
            };
        }

        if let Some(model) = &self.assistant {
            match self.repair_with_model(model, pages, title).await {
                Ok(repaired) if is_adequate_with(&repaired, &self.options) => {
                    info!("Character sheet repaired by {}", model.name());
                    return ValidatedCharacters {
                        text: append_block(&original, &repaired),
                        repaired_by_model: true,
                    };
                }
                Ok(_) => warn!("Model character sheet still inadequate, extracting from prompts"),
                Err(e) => warn!("Character sheet repair failed: {}", e),
            }
        }

        let mut extracted = extract_from_prompts(pages, &self.options);
        if extracted.is_empty() && original.is_empty() && pages.iter().any(|p| !p.text.trim().is_empty()) {
            extracted = generic_sheet(title);
        }

        ValidatedCharacters {
            text: append_block(&original, &extracted),
            repaired_by_model: false,
        }
    }

    async fn repair_with_model(
        &self,
        model: &SharedModel,
        pages: &[StoryPage],
        title: &str,
    ) -> anyhow::Result<String> {
        let prompts = pages
            .iter()
            .filter(|p| !p.image_prompt.trim().is_empty())
            .take(self.options.repair_prompt_limit)
            .enumerate()
            .map(|(i, p)| format!("{}. {}", i + 1, p.image_prompt.trim()))
            .collect::<Vec<_>>()
            .join("\n");

        let user = format!(
            "Story title: {}\n\nIllustration prompts:\n{}\n\nWrite the character sheet.",
            title, prompts
        );
        let raw = model
            .generate(
                REPAIR_SYSTEM_PROMPT,
                &user,
                self.options.repair_max_tokens,
                self.options.repair_temperature,
            )
            .await?;
        Ok(clean_text(&raw))
    }
}

/// Inadequate text is kept; the new block goes underneath it.
fn append_block(original: &str, block: &str) -> String {
    match (original.is_empty(), block.is_empty()) {
        (true, _) => block.to_string(),
        (false, true) => original.to_string(),
        (false, false) => format!("{}\n{}", original, block),
    }
}

fn accept_name(candidate: &str) -> bool {
    let Some(first) = candidate.split_whitespace().next() else {
        return false;
    };
    crate::utils::text::starts_with_uppercase(candidate)
        && word_count(candidate) <= 5
        && !vocabulary::contains(SCENE_STARTERS, &first.to_lowercase())
}

/// Builds "Name - detail, detail" lines from names that open the prompts.
pub fn extract_from_prompts(pages: &[StoryPage], options: &ValidatorOptions) -> String {
    let mut names: Vec<String> = Vec::new();
    for page in pages {
        let candidate = page.image_prompt.split(',').next().unwrap_or_default();
        let candidate = collapse_whitespace(candidate);
        if accept_name(&candidate) && !names.iter().any(|n| n.eq_ignore_ascii_case(&candidate)) {
            names.push(candidate);
        }
    }

    names
        .iter()
        .take(options.max_extracted_characters)
        .map(|name| {
            let details = details_for(name, pages, options.max_details);
            if details.is_empty() {
                name.clone()
            } else {
                format!("{} - {}", name, details.join(", "))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn details_for(name: &str, pages: &[StoryPage], max_details: usize) -> Vec<String> {
    let needle = name.to_lowercase();
    let words: Vec<String> = pages
        .iter()
        .filter(|p| p.image_prompt.to_lowercase().contains(&needle))
        .flat_map(|p| {
            letters_only_lowercase(&p.image_prompt)
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect();

    let mut details: Vec<String> = Vec::new();
    if let Some(species) = words.iter().find_map(|w| vocabulary::species_of(w)) {
        details.push(species.to_string());
    }
    for list in [COLORS, CLOTHING] {
        for word in &words {
            if details.len() >= max_details {
                return details;
            }
            if vocabulary::contains(list, word) && !details.contains(word) {
                details.push(word.clone());
            }
        }
    }
    details.truncate(max_details);
    details
}

fn generic_sheet(title: &str) -> String {
    let hero = title
        .split_whitespace()
        .map(|w| w.trim_end_matches("'s").trim_end_matches("’s"))
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .find(|w| {
            crate::utils::text::starts_with_uppercase(w)
                && !vocabulary::contains(SCENE_STARTERS, &w.to_lowercase())
        })
        .unwrap_or("The hero");
    format!("{} - the main character of this story, drawn the same way on every page", hero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GenerationError;
    use crate::services::testing::MockLlmClient;

    fn page(n: usize, text: &str, prompt: &str) -> StoryPage {
        StoryPage {
            page_number: n,
            text: text.to_string(),
            image_prompt: prompt.to_string(),
        }
    }

    #[test]
    fn test_adequacy_examples() {
        assert!(is_adequate("Luna - small orange fox, green scarf"));
        assert!(!is_adequate("cute animal"));
        assert!(is_adequate("cute animal\nA brave little bear in boots"));
        assert!(!is_adequate("Luna - fox"));
    }

    #[test]
    fn test_adequacy_ignores_separator_tokens() {
        assert_eq!(description_words("Luna - small orange fox"), 4);
        assert!(!is_adequate("Luna - orange fox"));
        assert!(is_adequate("Luna - small orange fox"));
        assert!(!is_adequate("Luna – orange – fox –"));
    }

    #[test]
    fn test_adequacy_thresholds_are_configurable() {
        let options = ValidatorOptions {
            plain_min_words: 2,
            ..ValidatorOptions::default()
        };
        assert!(is_adequate_with("cute animal", &options));
    }

    #[test]
    fn test_extract_from_prompts() {
        let pages = vec![
            page(1, "t", "Luna, a small orange fox in a green scarf, walks through the forest"),
            page(2, "t", "The forest at night, stars above"),
            page(3, "t", "Bruno, a big brown bear, waves at Luna"),
            page(4, "t", "luna, lowercase should be ignored"),
        ];
        let sheet = extract_from_prompts(&pages, &ValidatorOptions::default());
        let lines: Vec<&str> = sheet.lines().collect();
        assert_eq!(lines.len(), 2);
        // Luna's prompts mention a bear too, species is the first one seen.
        assert_eq!(lines[0], "Luna - fox, orange, green");
        assert_eq!(lines[1], "Bruno - bear, brown");
    }

    #[test]
    fn test_extract_caps_character_count() {
        let pages: Vec<StoryPage> = ["Ann", "Ben", "Cat", "Dan", "Eve"]
            .iter()
            .enumerate()
            .map(|(i, name)| page(i + 1, "t", &format!("{}, smiling", name)))
            .collect();
        let sheet = extract_from_prompts(&pages, &ValidatorOptions::default());
        assert_eq!(sheet.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_adequate_sheet_is_kept() {
        let validator = CharacterValidator::new(None, ValidatorOptions::default());
        let result = validator
            .validate("**Luna** - small orange fox, green scarf", &[], "Luna")
            .await;
        assert_eq!(result.text, "Luna - small orange fox, green scarf");
        assert!(!result.repaired_by_model);
    }

    #[tokio::test]
    async fn test_never_empty_when_pages_have_text() {
        let validator = CharacterValidator::new(None, ValidatorOptions::default());
        let pages = vec![page(1, "Once upon a time.", "A quiet meadow at dawn")];
        let result = validator.validate("", &pages, "Pip's Rainy Day").await;
        assert!(!result.text.is_empty());
        assert!(result.text.starts_with("Pip - "));
    }

    #[tokio::test]
    async fn test_inadequate_original_is_kept_and_extended() {
        let validator = CharacterValidator::new(None, ValidatorOptions::default());
        let pages = vec![page(1, "t", "Luna, a small orange fox, naps")];
        let result = validator.validate("cute animal", &pages, "Luna").await;
        assert_eq!(result.text, "cute animal\nLuna - fox, orange");
    }

    #[tokio::test]
    async fn test_model_repair_is_flagged() {
        let model = MockLlmClient::new().reply(
            "character sheet",
            "Luna - small orange fox, green scarf\nBruno - big brown bear, red cap",
        );
        let counter = model.call_count.clone();
        let validator = CharacterValidator::new(Some(model.shared()), ValidatorOptions::default());
        let pages = vec![page(1, "t", "Luna walks")];

        let result = validator.validate("", &pages, "Luna").await;
        assert!(result.repaired_by_model);
        assert!(result.text.starts_with("Luna - small orange fox"));
        assert_eq!(*counter.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_to_extraction() {
        let model = MockLlmClient::new().fail("character sheet", GenerationError::Timeout);
        let validator = CharacterValidator::new(Some(model.shared()), ValidatorOptions::default());
        let pages = vec![page(1, "t", "Bruno, a bear in a red cap")];

        let result = validator.validate("", &pages, "Bruno").await;
        assert!(!result.repaired_by_model);
        assert_eq!(result.text, "Bruno - bear, red, cap");
    }
}
