use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoryPage {
    pub page_number: usize,
    pub text: String,
    pub image_prompt: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct StoryBook {
    pub title: String,
    #[serde(default)]
    pub author_line: String,
    #[serde(default)]
    pub moral: String,
    #[serde(default)]
    pub character_descriptions: String,
    pub pages: Vec<StoryPage>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CharacterEntry {
    pub name: String,
    pub species: String, // lowercase, empty when unknown
    pub visual_summary: String,
    pub injection_phrase: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedCharacter {
    #[serde(default)]
    pub species: String,
    #[serde(default)]
    pub appearance: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptAnalysis {
    #[serde(default)]
    pub characters: Vec<AnalyzedCharacter>,
    #[serde(default)]
    pub scene_setting: String,
    #[serde(default)]
    pub main_action: String,
    #[serde(default)]
    pub mood: String,
}

/// Character sheet after the quality gate.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedCharacters {
    pub text: String,
    pub repaired_by_model: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConceptLabel {
    Character,
    Setting,
    Action,
    Detail,
    Props,
    Atmosphere,
}

impl ConceptLabel {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "CHARACTER" | "CHARACTERS" => Some(Self::Character),
            "SETTING" | "SCENE" => Some(Self::Setting),
            "ACTION" => Some(Self::Action),
            "DETAIL" | "DETAILS" => Some(Self::Detail),
            "PROPS" | "PROP" => Some(Self::Props),
            "ATMOSPHERE" | "MOOD" => Some(Self::Atmosphere),
            _ => None,
        }
    }
}

impl fmt::Display for ConceptLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Character => "CHARACTER",
            Self::Setting => "SETTING",
            Self::Action => "ACTION",
            Self::Detail => "DETAIL",
            Self::Props => "PROPS",
            Self::Atmosphere => "ATMOSPHERE",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Concept {
    pub label: ConceptLabel,
    pub text: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Queued,
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug)]
pub struct IllustrationJob {
    pub index: usize, // 0 = cover, otherwise the page number
    pub prompt: String,
    pub style: String,
    pub concepts: Vec<Concept>,
    pub state: JobState,
    pub last_error: Option<String>,
    pub recovery_attempted: bool,
}

impl IllustrationJob {
    pub fn new(index: usize, prompt: impl Into<String>, style: impl Into<String>) -> Self {
        Self {
            index,
            prompt: prompt.into(),
            style: style.into(),
            concepts: Vec::new(),
            state: JobState::Queued,
            last_error: None,
            recovery_attempted: false,
        }
    }

    pub fn with_concepts(mut self, concepts: Vec<Concept>) -> Self {
        self.concepts = concepts;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageData {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: "image/png".to_string(),
        }
    }

    pub fn extension(&self) -> &str {
        match self.mime_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOutcome {
    pub image: ImageData,
    pub backend_used: String,
    pub did_fallback: bool,
}
