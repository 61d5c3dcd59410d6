use crate::core::error::GenerationError;
use crate::core::state::{GenerationOutcome, IllustrationJob, JobState};
use crate::services::image::{Dimensions, ImageRequest};
use crate::services::llm::SharedModel;
use crate::services::router::ImageRouter;
use crate::services::safety::ContentSafetyPolicy;
use crate::services::variants::{self, Step, VariantChain, VariantKind};
use anyhow::{anyhow, Result};
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IllustrationOptions {
    /// Jobs allowed to talk to an image backend at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_attempts_per_variant")]
    pub attempts_per_variant: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_paraphrase_attempts")]
    pub paraphrase_attempts: usize,
    #[serde(default = "default_paraphrase_max_tokens")]
    pub paraphrase_max_tokens: u32,
    #[serde(default = "default_softened_word_limit")]
    pub softened_word_limit: usize,
}

fn default_concurrency() -> usize {
    3
}
fn default_attempts_per_variant() -> usize {
    2
}
fn default_retry_delay_ms() -> u64 {
    1500
}
fn default_max_jitter_ms() -> u64 {
    500
}
fn default_paraphrase_attempts() -> usize {
    2
}
fn default_paraphrase_max_tokens() -> u32 {
    200
}
fn default_softened_word_limit() -> usize {
    18
}

impl Default for IllustrationOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            attempts_per_variant: default_attempts_per_variant(),
            retry_delay_ms: default_retry_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            paraphrase_attempts: default_paraphrase_attempts(),
            paraphrase_max_tokens: default_paraphrase_max_tokens(),
            softened_word_limit: default_softened_word_limit(),
        }
    }
}

#[derive(Debug, Default)]
pub struct IllustrationReport {
    pub jobs: Vec<IllustrationJob>,
    /// Keyed by job index (0 = cover).
    pub images: BTreeMap<usize, GenerationOutcome>,
    /// Job index → last error, for every job without an image.
    pub missing: BTreeMap<usize, String>,
    pub cancelled: bool,
    pub fatal: Option<GenerationError>,
    /// Most jobs the table held `InFlight` at once during the parallel phase.
    pub peak_in_flight: usize,
}

enum JobEvent {
    Started(usize),
    Finished(usize, Result<GenerationOutcome>),
}

/// Reports a job's end to the orchestrator. A task that unwinds before
/// finishing reports an abort from `drop`.
struct Settlement {
    slot: usize,
    events: mpsc::UnboundedSender<JobEvent>,
    sent: bool,
}

impl Settlement {
    fn new(slot: usize, events: mpsc::UnboundedSender<JobEvent>) -> Self {
        Self {
            slot,
            events,
            sent: false,
        }
    }

    fn finish(mut self, result: Result<GenerationOutcome>) {
        self.sent = true;
        let _ = self.events.send(JobEvent::Finished(self.slot, result));
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self
                .events
                .send(JobEvent::Finished(self.slot, Err(anyhow!("Task aborted"))));
        }
    }
}

#[derive(Clone)]
pub struct Illustrator {
    router: ImageRouter,
    safety: Arc<dyn ContentSafetyPolicy>,
    assistant: Option<SharedModel>,
    options: IllustrationOptions,
    dimensions: Dimensions,
    reference_image: Option<Arc<Vec<u8>>>,
}

impl Illustrator {
    pub fn new(
        router: ImageRouter,
        safety: Arc<dyn ContentSafetyPolicy>,
        assistant: Option<SharedModel>,
        options: IllustrationOptions,
        dimensions: Dimensions,
    ) -> Self {
        Self {
            router,
            safety,
            assistant,
            options,
            dimensions,
            reference_image: None,
        }
    }

    pub fn with_reference_image(mut self, image: Option<Vec<u8>>) -> Self {
        self.reference_image = image.map(Arc::new);
        self
    }

    /// Runs every job: a bounded parallel phase, then one sequential pass over the failures.
    /// `progress` receives `(completed, total)` as parallel jobs settle.
    pub async fn illustrate<F>(
        &self,
        mut jobs: Vec<IllustrationJob>,
        token: &CancellationToken,
        progress: F,
    ) -> IllustrationReport
    where
        F: Fn(usize, usize),
    {
        let run = token.child_token();
        let total = jobs.len();
        let mut report = IllustrationReport::default();

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<JobEvent>();
        let mut set: JoinSet<()> = JoinSet::new();

        for (slot, job) in jobs.iter().enumerate() {
            let worker = self.clone();
            let job = job.clone();
            let semaphore = semaphore.clone();
            let run = run.clone();
            let events = events_tx.clone();

            set.spawn(async move {
                let permit = tokio::select! {
                    _ = run.cancelled() => {
                        let _ = events.send(JobEvent::Finished(slot, Err(GenerationError::Cancelled.into())));
                        return;
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            let _ = events.send(JobEvent::Finished(slot, Err(GenerationError::Cancelled.into())));
                            return;
                        }
                    },
                };
                let _ = events.send(JobEvent::Started(slot));
                // Declared after the permit so it drops first, even when unwinding.
                let settlement = Settlement::new(slot, events);
                let result = worker.run_chain(&job, &run).await;
                settlement.finish(result);
                drop(permit);
            });
        }
        drop(events_tx);

        // One ordered channel: a job's finish event always precedes the start
        // event of whichever job takes over its permit.
        let mut completed = 0;
        let mut in_flight = 0;
        while let Some(event) = events_rx.recv().await {
            match event {
                JobEvent::Started(slot) => {
                    jobs[slot].state = JobState::InFlight;
                    in_flight += 1;
                    report.peak_in_flight = report.peak_in_flight.max(in_flight);
                }
                JobEvent::Finished(slot, result) => {
                    if jobs[slot].state == JobState::InFlight {
                        in_flight -= 1;
                    }
                    self.settle(&mut jobs[slot], result, &mut report, &run);
                    completed += 1;
                    progress(completed, total);
                }
            }
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!("Illustration task aborted: {}", e);
            }
        }

        if !run.is_cancelled() {
            self.recover(&mut jobs, &mut report, &run).await;
        }

        report.cancelled = token.is_cancelled();
        for job in &jobs {
            if job.state != JobState::Succeeded {
                let reason = job.last_error.clone().unwrap_or_else(|| "Not attempted".to_string());
                report.missing.insert(job.index, reason);
            }
        }
        report.jobs = jobs;
        report
    }

    /// Failed jobs get one more full chain each, in page order, one at a time.
    async fn recover(
        &self,
        jobs: &mut [IllustrationJob],
        report: &mut IllustrationReport,
        run: &CancellationToken,
    ) {
        let mut failed: Vec<usize> = (0..jobs.len())
            .filter(|&slot| jobs[slot].state == JobState::Failed && !jobs[slot].recovery_attempted)
            .collect();
        failed.sort_by_key(|&slot| jobs[slot].index);
        if failed.is_empty() {
            return;
        }
        info!("Recovering {} failed illustration(s)", failed.len());

        for slot in failed {
            if run.is_cancelled() {
                break;
            }
            let job = &mut jobs[slot];
            job.state = JobState::InFlight;
            job.recovery_attempted = true;
            let result = self.run_chain(job, run).await;
            self.settle(job, result, report, run);
        }
    }

    fn settle(
        &self,
        job: &mut IllustrationJob,
        result: Result<GenerationOutcome>,
        report: &mut IllustrationReport,
        run: &CancellationToken,
    ) {
        match result {
            Ok(outcome) => {
                if outcome.did_fallback {
                    info!("Illustration {} drawn by {}", job.index, outcome.backend_used);
                }
                job.state = JobState::Succeeded;
                job.last_error = None;
                report.images.insert(job.index, outcome);
            }
            Err(e) => {
                job.state = JobState::Failed;
                job.last_error = Some(e.to_string());
                if let Some(err @ GenerationError::NoCredential(_)) = GenerationError::of(&e) {
                    warn!("Stopping illustration: {}", err);
                    report.fatal.get_or_insert_with(|| err.clone());
                    run.cancel();
                } else if !GenerationError::is_cancelled(&e) {
                    warn!("Illustration {} failed: {}", job.index, e);
                }
            }
        }
    }

    /// Re-runs one job's whole chain, for a caller-driven retry of a missing page.
    pub async fn retry_job(
        &self,
        job: &mut IllustrationJob,
        token: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        job.state = JobState::InFlight;
        match self.run_chain(job, token).await {
            Ok(outcome) => {
                job.state = JobState::Succeeded;
                job.last_error = None;
                Ok(outcome)
            }
            Err(e) => {
                job.state = JobState::Failed;
                job.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_chain(&self, job: &IllustrationJob, token: &CancellationToken) -> Result<GenerationOutcome> {
        let safe_prompt = self.safety.sanitize(&job.prompt);
        let mut chain = VariantChain::new(
            &safe_prompt,
            self.options.attempts_per_variant,
            self.options.softened_word_limit,
        );
        let mut last_error: Option<anyhow::Error> = None;

        loop {
            match chain.next_step() {
                Step::Attempt { kind, prompt, attempt } => {
                    if let Some(err) = &last_error {
                        self.pause(err, token).await?;
                    }

                    let request = ImageRequest {
                        prompt,
                        style: job.style.clone(),
                        dimensions: self.dimensions,
                        reference_image: self.reference_image.clone(),
                        concepts: match kind {
                            VariantKind::Safe | VariantKind::Paraphrase => job.concepts.clone(),
                            _ => Vec::new(),
                        },
                    };

                    let result = tokio::select! {
                        _ = token.cancelled() => Err(GenerationError::Cancelled.into()),
                        result = self.router.route(&request) => result,
                    };
                    match result {
                        Ok(outcome) => {
                            if kind != VariantKind::Safe {
                                info!("Illustration {} succeeded with {:?} prompt", job.index, kind);
                            }
                            return Ok(outcome);
                        }
                        Err(e) if GenerationError::is_fatal(&e) => return Err(e),
                        Err(e) => {
                            warn!(
                                "Illustration {} {:?} attempt {} failed: {}",
                                job.index, kind, attempt, e
                            );
                            last_error = Some(e);
                        }
                    }
                }
                Step::NeedsParaphrase { source } => {
                    let paraphrase = match &self.assistant {
                        Some(model) => tokio::select! {
                            _ = token.cancelled() => return Err(GenerationError::Cancelled.into()),
                            text = variants::paraphrase(
                                model,
                                &source,
                                self.options.paraphrase_attempts,
                                self.options.paraphrase_max_tokens,
                            ) => text,
                        },
                        None => None,
                    };
                    chain.insert_paraphrase(paraphrase);
                }
                Step::Exhausted => {
                    return Err(last_error.unwrap_or_else(|| anyhow!("No prompt variant was attempted")));
                }
            }
        }
    }

    /// Waits between attempts; a backend's Retry-After wins over the configured delay.
    async fn pause(&self, last_error: &anyhow::Error, token: &CancellationToken) -> Result<()> {
        let jitter = if self.options.max_jitter_ms > 0 {
            rand::rng().random_range(0..=self.options.max_jitter_ms)
        } else {
            0
        };
        let delay = GenerationError::retry_after(last_error)
            .unwrap_or(Duration::from_millis(self.options.retry_delay_ms))
            + Duration::from_millis(jitter);

        tokio::select! {
            _ = token.cancelled() => Err(GenerationError::Cancelled.into()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
