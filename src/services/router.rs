use crate::core::error::GenerationError;
use crate::core::state::GenerationOutcome;
use crate::services::image::{ImageGenerationBackend, ImageRequest};
use anyhow::Result;
use log::warn;
use std::sync::Arc;

/// Sends a request to the configured backend and, when allowed, replays it on the local one.
/// Holds no per-call state.
#[derive(Debug, Clone)]
pub struct ImageRouter {
    primary: Arc<dyn ImageGenerationBackend>,
    local: Option<Arc<dyn ImageGenerationBackend>>,
    local_fallback: bool,
}

impl ImageRouter {
    pub fn new(
        primary: Arc<dyn ImageGenerationBackend>,
        local: Option<Arc<dyn ImageGenerationBackend>>,
        local_fallback: bool,
    ) -> Self {
        Self {
            primary,
            local,
            local_fallback,
        }
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    /// Whether any backend this router may use draws from labeled concepts.
    pub fn accepts_concepts(&self) -> bool {
        self.primary.accepts_concepts()
            || (self.local_fallback && self.local.as_ref().is_some_and(|l| l.accepts_concepts()))
    }

    pub async fn route(&self, request: &ImageRequest) -> Result<GenerationOutcome> {
        let primary_err = match self.primary.generate(&self.shaped(request, &self.primary)).await {
            Ok(image) => {
                return Ok(GenerationOutcome {
                    image,
                    backend_used: self.primary.name().to_string(),
                    did_fallback: false,
                })
            }
            Err(e) => e,
        };

        let local = match &self.local {
            Some(local) if self.local_fallback && !GenerationError::is_cancelled(&primary_err) => local,
            _ => return Err(primary_err),
        };

        warn!(
            "{} failed ({}), retrying on {}",
            self.primary.name(),
            primary_err,
            local.name()
        );
        let image = local.generate(&self.shaped(request, local)).await?;
        Ok(GenerationOutcome {
            image,
            backend_used: local.name().to_string(),
            did_fallback: true,
        })
    }

    /// Concepts are only forwarded to backends that use them.
    fn shaped(&self, request: &ImageRequest, backend: &Arc<dyn ImageGenerationBackend>) -> ImageRequest {
        let mut shaped = request.clone();
        if !backend.accepts_concepts() {
            shaped.concepts.clear();
        }
        shaped
    }
}
