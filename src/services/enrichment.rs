use crate::core::error::GenerationError;
use crate::core::state::{CharacterEntry, Concept, ConceptLabel, PromptAnalysis, StoryBook};
use crate::services::decode;
use crate::services::llm::SharedModel;
use crate::services::vocabulary::{self, BEHAVIORAL, CLOTHING};
use crate::utils::text::{
    collapse_whitespace, letters_only_lowercase, looks_plural, starts_with_uppercase,
    strip_punctuation, trim_trailing_punctuation, with_article, word_count,
};
use anyhow::Result;
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrichmentOptions {
    /// Characters on each side of a name searched for the species word.
    #[serde(default = "default_proximity_window")]
    pub proximity_window: usize,
    #[serde(default = "default_min_concept_words")]
    pub min_concept_words: usize,
    #[serde(default = "default_max_concept_words")]
    pub max_concept_words: usize,
    #[serde(default = "default_concept_max_tokens")]
    pub concept_max_tokens: u32,
    #[serde(default = "default_concept_temperature")]
    pub concept_temperature: f32,
}

fn default_proximity_window() -> usize {
    30
}
fn default_min_concept_words() -> usize {
    2
}
fn default_max_concept_words() -> usize {
    6
}
fn default_concept_max_tokens() -> u32 {
    200
}
fn default_concept_temperature() -> f32 {
    0.2
}

impl Default for EnrichmentOptions {
    fn default() -> Self {
        Self {
            proximity_window: default_proximity_window(),
            min_concept_words: default_min_concept_words(),
            max_concept_words: default_max_concept_words(),
            concept_max_tokens: default_concept_max_tokens(),
            concept_temperature: default_concept_temperature(),
        }
    }
}

// --- Character sheet parsing ---

const NAME_SEPARATORS: &[&str] = &[" - ", " – ", ": "];

/// Earliest name separator in a line, as (position, length).
fn separator_position(line: &str) -> Option<(usize, usize)> {
    NAME_SEPARATORS
        .iter()
        .filter_map(|sep| line.find(sep).map(|pos| (pos, sep.len())))
        .min_by_key(|(pos, _)| *pos)
}

/// Splits "Luna - a fox. Bruno - a bear." into two entries but leaves
/// "Luna - a fox. She is kind." alone.
fn split_sentences(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(pos) = line[search..].find(". ") {
        let cut = search + pos;
        let next = cut + 2;
        let after = &line[next..];
        let segment = after.split(". ").next().unwrap_or(after);
        if starts_with_uppercase(after) && separator_position(segment).is_some() {
            parts.push(&line[start..cut + 1]);
            start = next;
        }
        search = next;
    }
    parts.push(&line[start..]);
    parts
}

fn clean_name(raw: &str) -> String {
    let name = raw.trim_matches(|c: char| !c.is_alphanumeric());
    let name = name.trim_start_matches(|c: char| c.is_ascii_digit());
    collapse_whitespace(name.trim_matches(|c: char| !c.is_alphanumeric()))
}

fn is_behavioral(clause: &str) -> bool {
    clause
        .split_whitespace()
        .next()
        .map(|w| vocabulary::contains(BEHAVIORAL, &w.to_lowercase()))
        .unwrap_or(false)
}

fn injection_phrase(details: &str) -> String {
    let clauses: Vec<&str> = details
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    let Some(first) = clauses.first() else {
        return String::new();
    };

    let mut phrase = with_article(first);
    if let Some(second) = clauses.get(1).filter(|c| !is_behavioral(c)) {
        let lower = second.to_lowercase();
        let extra = if lower.starts_with("with ") || lower.starts_with("wearing ") {
            second.to_string()
        } else if second
            .split_whitespace()
            .next()
            .is_some_and(|w| vocabulary::contains(CLOTHING, &w.to_lowercase()))
        {
            format!("wearing {}", second)
        } else if looks_plural(second) {
            format!("with {}", second)
        } else {
            format!("with {}", with_article(second))
        };
        phrase = format!("{} {}", phrase, extra);
    }
    phrase
}

pub fn parse_character_sheet(sheet: &str) -> Vec<CharacterEntry> {
    let lines = sheet
        .lines()
        .flat_map(|line| line.split("; "))
        .flat_map(split_sentences);

    let mut entries = Vec::new();
    for line in lines {
        let Some((pos, len)) = separator_position(line) else {
            continue;
        };
        let name = clean_name(&line[..pos]);
        let details = collapse_whitespace(trim_trailing_punctuation(&line[pos + len..]));
        if name.is_empty() || details.is_empty() || word_count(&name) > 5 {
            continue;
        }

        let species = letters_only_lowercase(&details)
            .split_whitespace()
            .find_map(vocabulary::species_of)
            .unwrap_or_default()
            .to_string();

        entries.push(CharacterEntry {
            injection_phrase: injection_phrase(&details),
            name,
            species,
            visual_summary: details,
        });
    }
    entries
}

// --- Prompt enrichment ---

fn floor_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn strip_article(phrase: &str) -> &str {
    let lower = phrase.to_lowercase();
    for article in ["a ", "an ", "the "] {
        if lower.starts_with(article) {
            return &phrase[article.len()..];
        }
    }
    phrase
}

fn detail_for(entry: &CharacterEntry, analysis: Option<&PromptAnalysis>) -> String {
    if !entry.species.is_empty() {
        let analysed = analysis.and_then(|a| {
            a.characters
                .iter()
                .find(|c| c.species == entry.species && !c.appearance.trim().is_empty())
        });
        if let Some(character) = analysed {
            let appearance = character.appearance.trim();
            return if appearance.to_lowercase().contains(&entry.species) {
                with_article(appearance)
            } else {
                with_article(&format!("{} {}", appearance, entry.species))
            };
        }
    }
    entry.injection_phrase.clone()
}

/// Inserts "<Name>, <detail>," after the first mention of each known character
/// unless the prompt already describes them there.
pub fn enrich_prompt(
    prompt: &str,
    entries: &[CharacterEntry],
    analysis: Option<&PromptAnalysis>,
    options: &EnrichmentOptions,
) -> String {
    let mut prompt = prompt.to_string();

    for entry in entries {
        let Ok(pattern) = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&entry.name))) else {
            continue;
        };
        let Some(found) = pattern.find(&prompt) else {
            continue;
        };
        let (start, end) = (found.start(), found.end());

        if !entry.species.is_empty() {
            let from = floor_boundary(&prompt, start.saturating_sub(options.proximity_window));
            let to = ceil_boundary(&prompt, end + options.proximity_window);
            let nearby = letters_only_lowercase(&prompt[from..to]);
            if nearby
                .split_whitespace()
                .any(|w| vocabulary::species_of(w) == Some(entry.species.as_str()))
            {
                continue;
            }
        }

        let detail = detail_for(entry, analysis);
        if detail.is_empty() {
            continue;
        }
        let lower = prompt.to_lowercase();
        if lower.contains(&detail.to_lowercase()) || lower.contains(&strip_article(&detail).to_lowercase()) {
            continue;
        }

        let rest = prompt[end..].trim_start();
        let rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        let joined = if rest.is_empty() || rest.starts_with(|c: char| c.is_ascii_punctuation()) {
            format!("{}, {}{}", &prompt[..end], detail, rest)
        } else {
            format!("{}, {}, {}", &prompt[..end], detail, rest)
        };
        debug!("Enriched {} on prompt: {}", entry.name, joined);
        prompt = joined;
    }
    prompt
}

pub struct Enricher {
    options: EnrichmentOptions,
}

impl Enricher {
    pub fn new(options: EnrichmentOptions) -> Self {
        Self { options }
    }

    /// Returns a copy of the book with character detail injected into each page's prompt.
    /// `analyses`, when given, is indexed like `book.pages`.
    pub fn enrich(&self, book: &StoryBook, analyses: Option<&[PromptAnalysis]>) -> StoryBook {
        let entries = parse_character_sheet(&book.character_descriptions);
        let mut enriched = book.clone();
        if entries.is_empty() {
            return enriched;
        }

        for (i, page) in enriched.pages.iter_mut().enumerate() {
            let analysis = analyses.and_then(|a| a.get(i));
            page.image_prompt = enrich_prompt(&page.image_prompt, &entries, analysis, &self.options);
        }
        enriched
    }

    pub fn enrich_text(&self, prompt: &str, sheet: &str) -> String {
        let entries = parse_character_sheet(sheet);
        enrich_prompt(prompt, &entries, None, &self.options)
    }
}

// --- Concept decomposition ---

/// Labeled concepts built straight from an analysis: characters, then scene, action, mood.
pub fn concepts_from_analysis(analysis: &PromptAnalysis) -> Vec<Concept> {
    let mut concepts: Vec<Concept> = analysis
        .characters
        .iter()
        .map(|c| Concept {
            label: ConceptLabel::Character,
            text: collapse_whitespace(&format!("{} {}", c.appearance, c.species)),
        })
        .filter(|c| !c.text.is_empty())
        .collect();

    let rest = [
        (ConceptLabel::Setting, &analysis.scene_setting),
        (ConceptLabel::Action, &analysis.main_action),
        (ConceptLabel::Atmosphere, &analysis.mood),
    ];
    for (label, text) in rest {
        let text = collapse_whitespace(text);
        if !text.is_empty() {
            concepts.push(Concept { label, text });
        }
    }
    concepts
}

#[derive(Deserialize)]
struct ConceptSheet {
    #[serde(default)]
    concepts: Vec<RawConcept>,
}

#[derive(Deserialize)]
struct RawConcept {
    #[serde(default)]
    label: String,
    #[serde(default)]
    text: String,
}

const CONCEPT_SYSTEM_PROMPT: &str = "You break an illustration prompt into ranked visual concepts. \
Reply with JSON only: {\"concepts\":[{\"label\":\"CHARACTER\",\"text\":\"small orange fox\"}]}. \
Labels: CHARACTER, SETTING, ACTION, DETAIL, PROPS, ATMOSPHERE. List CHARACTER concepts first. \
Each text is 2 to 6 words taken from the prompt. Never add words that are not in the prompt.";

pub struct ConceptDecomposer {
    model: Option<SharedModel>,
    options: EnrichmentOptions,
}

impl ConceptDecomposer {
    pub fn new(model: Option<SharedModel>, options: EnrichmentOptions) -> Self {
        Self { model, options }
    }

    pub async fn decompose(&self, prompt: &str, analysis: &PromptAnalysis) -> Vec<Concept> {
        if let Some(model) = &self.model {
            match self.decompose_with_model(model, prompt).await {
                Ok(concepts) => return concepts,
                Err(e) => warn!("Concept breakdown fell back to analysis: {}", e),
            }
        }
        concepts_from_analysis(analysis)
    }

    async fn decompose_with_model(&self, model: &SharedModel, prompt: &str) -> Result<Vec<Concept>> {
        let raw = model
            .generate(
                CONCEPT_SYSTEM_PROMPT,
                &format!("Prompt: {}", prompt),
                self.options.concept_max_tokens,
                self.options.concept_temperature,
            )
            .await?;
        debug!("Concept raw output: {}", raw);

        let sheet: ConceptSheet = decode::decode(&raw)?;
        let concepts = validate_concepts(sheet.concepts, prompt, &self.options);
        if concepts.is_empty() {
            return Err(GenerationError::UnparsableResponse("no usable concepts".to_string()).into());
        }
        Ok(concepts)
    }
}

/// Keeps concepts with a known label, a sane length and only words from the prompt.
fn validate_concepts(raw: Vec<RawConcept>, prompt: &str, options: &EnrichmentOptions) -> Vec<Concept> {
    let vocabulary: HashSet<String> = strip_punctuation(prompt)
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();

    let mut concepts: Vec<Concept> = raw
        .into_iter()
        .filter_map(|c| {
            let label = ConceptLabel::parse(&c.label)?;
            let text = strip_punctuation(&c.text);
            let words = word_count(&text);
            let grounded = text
                .split_whitespace()
                .all(|w| vocabulary.contains(&w.to_lowercase()));
            (words >= options.min_concept_words && words <= options.max_concept_words && grounded)
                .then_some(Concept { label, text })
        })
        .collect();

    concepts.sort_by_key(|c| c.label);
    concepts
}
