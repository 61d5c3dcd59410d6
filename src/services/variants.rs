use crate::services::decode::clean_text;
use crate::services::llm::SharedModel;
use crate::utils::text::{strip_punctuation, truncate_words, word_count};
use log::{debug, warn};

pub const FALLBACK_SCENE: &str = "A cheerful children's picture book illustration of a sunny meadow \
with friendly animals playing together, soft pastel colors, gentle and safe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    Safe,
    Paraphrase,
    Softened,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub kind: VariantKind,
    pub prompt: String,
    pub max_attempts: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Call the backend with this prompt. `attempt` starts at 1 for each variant.
    Attempt {
        kind: VariantKind,
        prompt: String,
        attempt: usize,
    },
    /// The safe prompt is used up; the caller may supply a paraphrase via `insert_paraphrase`.
    NeedsParaphrase { source: String },
    Exhausted,
}

/// Ordered prompt variants for one illustration job:
/// safe, then an optional paraphrase, then softened, then a single generic fallback.
#[derive(Debug, Clone)]
pub struct VariantChain {
    variants: Vec<Variant>,
    current: usize,
    used: usize,
    attempts_per_variant: usize,
    softened_word_limit: usize,
    paraphrase_requested: bool,
    fallback_added: bool,
}

impl VariantChain {
    pub fn new(safe_prompt: &str, attempts_per_variant: usize, softened_word_limit: usize) -> Self {
        let attempts_per_variant = attempts_per_variant.max(1);
        Self {
            variants: vec![Variant {
                kind: VariantKind::Safe,
                prompt: safe_prompt.to_string(),
                max_attempts: attempts_per_variant,
            }],
            current: 0,
            used: 0,
            attempts_per_variant,
            softened_word_limit,
            paraphrase_requested: false,
            fallback_added: false,
        }
    }

    pub fn next_step(&mut self) -> Step {
        loop {
            if let Some(variant) = self.variants.get(self.current) {
                if self.used < variant.max_attempts {
                    self.used += 1;
                    return Step::Attempt {
                        kind: variant.kind,
                        prompt: variant.prompt.clone(),
                        attempt: self.used,
                    };
                }

                let finished = variant.clone();
                self.current += 1;
                self.used = 0;

                if finished.kind == VariantKind::Safe {
                    self.variants.push(Variant {
                        kind: VariantKind::Softened,
                        prompt: soften(&finished.prompt, self.softened_word_limit),
                        max_attempts: self.attempts_per_variant,
                    });
                    if !self.paraphrase_requested {
                        self.paraphrase_requested = true;
                        return Step::NeedsParaphrase { source: finished.prompt };
                    }
                }
                continue;
            }

            if !self.fallback_added {
                self.fallback_added = true;
                self.variants.push(Variant {
                    kind: VariantKind::Fallback,
                    prompt: FALLBACK_SCENE.to_string(),
                    max_attempts: 1,
                });
                continue;
            }
            return Step::Exhausted;
        }
    }

    /// Places the paraphrase right after the exhausted safe variant. `None` skips it.
    pub fn insert_paraphrase(&mut self, paraphrase: Option<String>) {
        let Some(prompt) = paraphrase.filter(|p| !p.trim().is_empty()) else {
            return;
        };
        self.variants.insert(
            self.current,
            Variant {
                kind: VariantKind::Paraphrase,
                prompt,
                max_attempts: self.attempts_per_variant,
            },
        );
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }
}

/// Plain words only, cut short and wrapped in child-safe scene language.
pub fn soften(prompt: &str, word_limit: usize) -> String {
    let plain = truncate_words(&strip_punctuation(prompt), word_limit);
    if plain.is_empty() {
        return FALLBACK_SCENE.to_string();
    }
    format!(
        "A gentle, friendly children's book illustration of {}, soft colors, wholesome and safe",
        plain
    )
}

const PARAPHRASE_SYSTEM_PROMPT: &str = "You rewrite illustration prompts for a children's picture book \
so that an image generator accepts them. Keep the characters, setting and action. \
Remove anything that could read as violent, scary or unsafe. \
Reply with the rewritten prompt only, one sentence.";

/// Asks the assistant model for a gentler wording, giving up after `attempts` tries.
pub async fn paraphrase(model: &SharedModel, prompt: &str, attempts: usize, max_tokens: u32) -> Option<String> {
    for attempt in 1..=attempts {
        match model
            .generate(PARAPHRASE_SYSTEM_PROMPT, &format!("Prompt: {}", prompt), max_tokens, 0.7)
            .await
        {
            Ok(raw) => {
                let text = clean_text(&raw).replace('\n', " ");
                if word_count(&text) >= 3 && !text.eq_ignore_ascii_case(prompt) {
                    debug!("Paraphrased prompt: {}", text);
                    return Some(text);
                }
                warn!("Unusable paraphrase on attempt {}/{}", attempt, attempts);
            }
            Err(e) => warn!("Paraphrase attempt {}/{} failed: {}", attempt, attempts, e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::MockLlmClient;

    fn kinds(chain: &mut VariantChain, paraphrase: Option<&str>) -> Vec<(VariantKind, usize)> {
        let mut seen = Vec::new();
        loop {
            match chain.next_step() {
                Step::Attempt { kind, attempt, .. } => seen.push((kind, attempt)),
                Step::NeedsParaphrase { .. } => chain.insert_paraphrase(paraphrase.map(str::to_string)),
                Step::Exhausted => return seen,
            }
        }
    }

    #[test]
    fn test_chain_order_with_paraphrase() {
        let mut chain = VariantChain::new("Luna in a storm", 2, 18);
        let seen = kinds(&mut chain, Some("Luna on a breezy day"));
        assert_eq!(
            seen,
            vec![
                (VariantKind::Safe, 1),
                (VariantKind::Safe, 2),
                (VariantKind::Paraphrase, 1),
                (VariantKind::Paraphrase, 2),
                (VariantKind::Softened, 1),
                (VariantKind::Softened, 2),
                (VariantKind::Fallback, 1),
            ]
        );
        assert_eq!(chain.next_step(), Step::Exhausted);

        let prompts: Vec<(VariantKind, &str)> = chain
            .variants()
            .iter()
            .map(|v| (v.kind, v.prompt.as_str()))
            .collect();
        assert_eq!(prompts[0], (VariantKind::Safe, "Luna in a storm"));
        assert_eq!(prompts[1], (VariantKind::Paraphrase, "Luna on a breezy day"));
        assert_eq!(prompts[2].0, VariantKind::Softened);
        assert_eq!(prompts[3], (VariantKind::Fallback, FALLBACK_SCENE));
    }

    #[test]
    fn test_chain_without_paraphrase() {
        let mut chain = VariantChain::new("Luna in a storm", 1, 18);
        let seen = kinds(&mut chain, None);
        assert_eq!(
            seen,
            vec![
                (VariantKind::Safe, 1),
                (VariantKind::Softened, 1),
                (VariantKind::Fallback, 1),
            ]
        );
    }

    #[test]
    fn test_paraphrase_requested_with_safe_prompt() {
        let mut chain = VariantChain::new("Luna in a storm", 1, 18);
        assert!(matches!(chain.next_step(), Step::Attempt { kind: VariantKind::Safe, .. }));
        assert_eq!(
            chain.next_step(),
            Step::NeedsParaphrase { source: "Luna in a storm".to_string() }
        );
    }

    #[test]
    fn test_soften() {
        let softened = soften("**Luna** runs through the dark, scary woods! (at night)", 5);
        assert_eq!(
            softened,
            "A gentle, friendly children's book illustration of Luna runs through the dark, soft colors, wholesome and safe"
        );
        assert_eq!(soften("!!!", 5), FALLBACK_SCENE);
    }

    #[tokio::test]
    async fn test_paraphrase_retries_then_gives_up() {
        let model = MockLlmClient::new().reply("Prompt:", "ok");
        let result = paraphrase(&model.clone().shared(), "Luna in a storm", 2, 100).await;
        assert!(result.is_none());
        assert_eq!(model.calls(), 2);

        let model = MockLlmClient::new().reply("Prompt:", "\"Luna watching rain from a cozy den\"");
        let result = paraphrase(&model.shared(), "Luna in a storm", 2, 100).await;
        assert_eq!(result.as_deref(), Some("Luna watching rain from a cozy den"));
    }
}
