use crate::core::error::GenerationError;
use crate::core::state::{AnalyzedCharacter, PromptAnalysis};
use crate::services::decode;
use crate::services::llm::SharedModel;
use crate::services::vocabulary::{self, ACTIONS, COLORS, MOODS, PREPOSITIONS, SIZES};
use crate::utils::text::{collapse_whitespace, letters_only_lowercase};
use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalysisOptions {
    /// Words on each side of a species word searched for size and color.
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_scene_words")]
    pub max_scene_words: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_window() -> usize {
    4
}
fn default_scene_words() -> usize {
    6
}
fn default_max_tokens() -> u32 {
    250
}
fn default_temperature() -> f32 {
    0.1
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            window: default_window(),
            max_scene_words: default_scene_words(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Words that end a scene phrase.
const SCENE_BREAKERS: &[&str] = &["and", "while", "as", "with", "where", "who", "then"];

pub fn analyze_heuristic(prompt: &str, options: &AnalysisOptions) -> PromptAnalysis {
    let normalized = letters_only_lowercase(prompt);
    let words: Vec<&str> = normalized.split_whitespace().collect();

    let mut seen: Vec<&'static str> = Vec::new();
    let mut characters = Vec::new();
    for (i, word) in words.iter().enumerate() {
        let Some(species) = vocabulary::species_of(word) else {
            continue;
        };
        if seen.contains(&species) {
            continue;
        }
        seen.push(species);

        let start = i.saturating_sub(options.window);
        let end = (i + options.window + 1).min(words.len());
        let window = &words[start..end];

        let mut appearance: Vec<&str> = Vec::new();
        if let Some(size) = window.iter().find(|w| vocabulary::contains(SIZES, w)) {
            appearance.push(*size);
        }
        appearance.extend(
            window
                .iter()
                .filter(|w| vocabulary::contains(COLORS, w))
                .take(2)
                .copied(),
        );

        characters.push(AnalyzedCharacter {
            species: species.to_string(),
            appearance: appearance.join(" "),
        });
    }

    let main_action = words
        .iter()
        .find(|w| vocabulary::contains(ACTIONS, w))
        .map(|w| w.to_string())
        .unwrap_or_default();

    let mood = words
        .iter()
        .filter(|w| vocabulary::contains(MOODS, w))
        .take(2)
        .copied()
        .collect::<Vec<_>>()
        .join(", ");

    PromptAnalysis {
        characters,
        scene_setting: scene_phrase(&words, options.max_scene_words),
        main_action,
        mood,
    }
}

/// First prepositional phrase, e.g. "through a snowy forest".
fn scene_phrase(words: &[&str], max_words: usize) -> String {
    let Some(start) = words
        .iter()
        .enumerate()
        .position(|(i, w)| vocabulary::contains(PREPOSITIONS, w) && i + 1 < words.len())
    else {
        return String::new();
    };

    let mut phrase = vec![words[start]];
    for word in &words[start + 1..] {
        if phrase.len() >= max_words
            || vocabulary::contains(SCENE_BREAKERS, word)
            || vocabulary::contains(ACTIONS, word)
            || vocabulary::contains(PREPOSITIONS, word)
        {
            break;
        }
        phrase.push(*word);
    }

    if phrase.len() < 2 {
        return String::new();
    }
    phrase.join(" ")
}

const ANALYSIS_SYSTEM_PROMPT: &str = "You analyse illustration prompts for a picture book. \
Reply with JSON only, no commentary, in exactly this shape: \
{\"characters\":[{\"species\":\"fox\",\"appearance\":\"small orange, green scarf\"}],\
\"sceneSetting\":\"short phrase\",\"mainAction\":\"one verb\",\"mood\":\"one or two words\"}. \
Use only words that appear in the prompt.";

pub struct PromptAnalyzer {
    model: Option<SharedModel>,
    options: AnalysisOptions,
}

impl PromptAnalyzer {
    pub fn new(model: Option<SharedModel>, options: AnalysisOptions) -> Self {
        Self { model, options }
    }

    /// Model answer when it yields something usable, heuristics otherwise.
    pub async fn analyze(&self, prompt: &str) -> PromptAnalysis {
        if let Some(model) = &self.model {
            match self.analyze_with_model(model, prompt).await {
                Ok(analysis) => return analysis,
                Err(e) => warn!("Prompt analysis fell back to heuristics: {}", e),
            }
        }
        analyze_heuristic(prompt, &self.options)
    }

    /// One prompt at a time; the model is a single shared resource.
    pub async fn analyze_all(&self, prompts: &[String]) -> Vec<PromptAnalysis> {
        let mut analyses = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            analyses.push(self.analyze(prompt).await);
        }
        analyses
    }

    async fn analyze_with_model(&self, model: &SharedModel, prompt: &str) -> Result<PromptAnalysis> {
        let user = format!("Prompt: {}", prompt);
        let raw = model
            .generate(
                ANALYSIS_SYSTEM_PROMPT,
                &user,
                self.options.max_tokens,
                self.options.temperature,
            )
            .await?;
        debug!("Analysis raw output: {}", raw);

        let mut analysis: PromptAnalysis = decode::decode(&raw)?;
        normalize(&mut analysis);

        let is_empty = analysis.characters.is_empty()
            && analysis.scene_setting.is_empty()
            && analysis.main_action.is_empty();
        if is_empty {
            return Err(GenerationError::UnparsableResponse("empty analysis".to_string()).into());
        }
        Ok(analysis)
    }
}

fn normalize(analysis: &mut PromptAnalysis) {
    analysis.characters.retain(|c| !c.species.trim().is_empty());
    for character in &mut analysis.characters {
        let species = character.species.trim().to_lowercase();
        character.species = vocabulary::species_of(&species)
            .map(str::to_string)
            .unwrap_or(species);
        character.appearance = collapse_whitespace(&decode::clean_text(&character.appearance));
    }
    analysis.scene_setting = collapse_whitespace(&analysis.scene_setting);
    analysis.main_action = collapse_whitespace(&analysis.main_action).to_lowercase();
    analysis.mood = collapse_whitespace(&analysis.mood).to_lowercase();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::MockLlmClient;

    #[test]
    fn test_heuristic_analysis() {
        let analysis = analyze_heuristic(
            "Luna, a small orange fox, walking through a snowy forest with her friend, happy and curious",
            &AnalysisOptions::default(),
        );
        assert_eq!(analysis.characters.len(), 1);
        assert_eq!(analysis.characters[0].species, "fox");
        assert_eq!(analysis.characters[0].appearance, "small orange");
        assert_eq!(analysis.main_action, "walking");
        assert_eq!(analysis.scene_setting, "through a snowy forest");
        assert_eq!(analysis.mood, "happy, curious");
    }

    #[test]
    fn test_heuristic_species_are_deduplicated_in_order() {
        let analysis = analyze_heuristic(
            "A big brown bear hugs his friend, a tiny white rabbit, while another bear waves",
            &AnalysisOptions::default(),
        );
        let species: Vec<&str> = analysis.characters.iter().map(|c| c.species.as_str()).collect();
        assert_eq!(species, vec!["bear", "rabbit"]);
        assert_eq!(analysis.characters[0].appearance, "big brown");
        assert_eq!(analysis.characters[1].appearance, "tiny white");
    }

    #[test]
    fn test_heuristic_without_matches() {
        let analysis = analyze_heuristic("Sunset", &AnalysisOptions::default());
        assert_eq!(analysis, PromptAnalysis::default());
    }

    #[tokio::test]
    async fn test_model_analysis_is_normalized() {
        let model = MockLlmClient::new().reply(
            "Prompt:",
            r#"```json
{"characters":[{"species":"Foxes","appearance":"small *orange*"}],"sceneSetting":"snowy  forest","mainAction":"Walking","mood":"calm"}
```"#,
        );
        let analyzer = PromptAnalyzer::new(Some(model.shared()), AnalysisOptions::default());
        let analysis = analyzer.analyze("Luna walking in a snowy forest").await;
        assert_eq!(analysis.characters[0].species, "fox");
        assert_eq!(analysis.characters[0].appearance, "small orange");
        assert_eq!(analysis.scene_setting, "snowy forest");
        assert_eq!(analysis.main_action, "walking");
    }

    #[tokio::test]
    async fn test_batch_falls_back_per_item() {
        let model = MockLlmClient::new()
            .reply("owl", r#"{"characters":[{"species":"owl","appearance":"old grey"}]}"#)
            .reply("fox", "I cannot help with that.");
        let counter = model.call_count.clone();
        let analyzer = PromptAnalyzer::new(Some(model.shared()), AnalysisOptions::default());

        let prompts = vec![
            "An old owl on a branch".to_string(),
            "A red fox running in the snow".to_string(),
        ];
        let analyses = analyzer.analyze_all(&prompts).await;

        assert_eq!(analyses.len(), 2);
        assert_eq!(analyses[0].characters[0].appearance, "old grey");
        assert_eq!(analyses[1].characters[0].species, "fox");
        assert_eq!(analyses[1].main_action, "running");
        assert_eq!(*counter.lock().unwrap(), 2);
    }
}
