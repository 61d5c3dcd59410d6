use crate::utils::text::collapse_whitespace;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

pub trait ContentSafetyPolicy: Send + Sync + Debug {
    fn sanitize(&self, text: &str) -> String;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SafetyConfig {
    /// Word → replacement. An empty replacement removes the word.
    #[serde(default = "default_replacements")]
    pub replacements: BTreeMap<String, String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            replacements: default_replacements(),
        }
    }
}

fn default_replacements() -> BTreeMap<String, String> {
    [
        ("attack", "surprise"),
        ("blood", ""),
        ("bloody", ""),
        ("dead", "sleeping"),
        ("die", "rest"),
        ("fight", "play"),
        ("fighting", "playing"),
        ("gun", "toy"),
        ("kill", "stop"),
        ("knife", "spoon"),
        ("monster", "creature"),
        ("scary", "surprising"),
        ("sword", "stick"),
        ("terrifying", "surprising"),
        ("weapon", "tool"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Whole-word, case-insensitive replacement from a configurable list.
#[derive(Debug)]
pub struct WordListPolicy {
    rules: Vec<(Regex, String)>,
}

impl WordListPolicy {
    pub fn new(config: &SafetyConfig) -> Result<Self> {
        let rules = config
            .replacements
            .iter()
            .filter(|(word, _)| !word.trim().is_empty())
            .map(|(word, replacement)| {
                let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word.trim())))?;
                Ok((pattern, replacement.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

impl ContentSafetyPolicy for WordListPolicy {
    fn sanitize(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, replacement) in &self.rules {
            out = pattern.replace_all(&out, replacement.as_str()).to_string();
        }
        // Removed words leave gaps before punctuation.
        collapse_whitespace(&out).replace(" ,", ",").replace(" .", ".")
    }
}
