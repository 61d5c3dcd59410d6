use crate::core::error::GenerationError;
use crate::core::state::ImageData;
use crate::services::image::{ImageGenerationBackend, ImageRequest};
use crate::services::llm::{SharedModel, TextGenerationBackend};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replies with the first canned answer whose key appears in the user prompt.
#[derive(Debug, Clone, Default)]
pub struct MockLlmClient {
    replies: Vec<(String, std::result::Result<String, GenerationError>)>,
    pub call_count: Arc<Mutex<usize>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, key: &str, answer: &str) -> Self {
        self.replies.push((key.to_string(), Ok(answer.to_string())));
        self
    }

    pub fn fail(mut self, key: &str, err: GenerationError) -> Self {
        self.replies.push((key.to_string(), Err(err)));
        self
    }

    pub fn calls(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    pub fn shared(self) -> SharedModel {
        SharedModel::new(Arc::new(self))
    }
}

#[async_trait]
impl TextGenerationBackend for MockLlmClient {
    async fn generate(&self, _system: &str, user: &str, _: u32, _: f32) -> Result<String> {
        *self.call_count.lock().unwrap() += 1;
        self.prompts.lock().unwrap().push(user.to_string());

        for (key, answer) in &self.replies {
            if user.contains(key.as_str()) {
                return answer.clone().map_err(Into::into);
            }
        }
        Err(anyhow!("no scripted reply"))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct FailRule {
    key: String,
    remaining: usize,
    err: GenerationError,
}

/// Image backend that echoes the prompt back as the image bytes, failing on request.
#[derive(Default)]
pub struct MockImageBackend {
    rules: Mutex<Vec<FailRule>>,
    delay: Duration,
    panic_key: Mutex<Option<String>>,
    active: AtomicUsize,
    pub peak: Arc<AtomicUsize>,
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for MockImageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockImageBackend").finish()
    }
}

impl MockImageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails the next `times` prompts containing `key`.
    pub fn fail(self, key: &str, times: usize, err: GenerationError) -> Self {
        self.rules.lock().unwrap().push(FailRule {
            key: key.to_string(),
            remaining: times,
            err,
        });
        self
    }

    /// Panics on the first prompt containing `key`, as a crashing task would.
    pub fn panic_once(self, key: &str) -> Self {
        *self.panic_key.lock().unwrap() = Some(key.to_string());
        self
    }

    pub fn calls_containing(&self, key: &str) -> usize {
        self.prompts.lock().unwrap().iter().filter(|p| p.contains(key)).count()
    }
}

#[async_trait]
impl ImageGenerationBackend for MockImageBackend {
    async fn generate(&self, request: &ImageRequest) -> Result<ImageData> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let crash = {
            let mut key = self.panic_key.lock().unwrap();
            if key.as_deref().is_some_and(|k| request.prompt.contains(k)) {
                key.take();
                true
            } else {
                false
            }
        };
        if crash {
            panic!("image backend crashed");
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules
            .iter_mut()
            .find(|r| r.remaining > 0 && request.prompt.contains(r.key.as_str()))
        {
            rule.remaining -= 1;
            return Err(rule.err.clone().into());
        }
        Ok(ImageData::png(request.prompt.as_bytes().to_vec()))
    }

    fn name(&self) -> &str {
        "mock-image"
    }
}
