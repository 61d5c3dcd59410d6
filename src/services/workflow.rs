use crate::core::config::Config;
use crate::core::error::GenerationError;
use crate::core::io::{join_path, read_json, write_json, Storage};
use crate::core::state::{IllustrationJob, ImageData, JobState, PromptAnalysis, StoryBook};
use crate::services::analysis::{analyze_heuristic, PromptAnalyzer};
use crate::services::characters::CharacterValidator;
use crate::services::enrichment::{parse_character_sheet, ConceptDecomposer, Enricher};
use crate::services::illustration::Illustrator;
use crate::services::image::{create_image_backend, create_local_backend};
use crate::services::llm::{create_assistant, create_llm, SharedModel, TextGenerationBackend};
use crate::services::router::ImageRouter;
use crate::services::safety::WordListPolicy;
use crate::services::story::StoryGenerator;
use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Story generated for a concept and page count, cached in the build folder between runs.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct CachedStory {
    concept: String,
    #[serde(default)]
    page_count: usize,
    book: StoryBook,
    #[serde(default)]
    characters_repaired_by_model: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub title: String,
    /// Paths written during this run.
    pub images: Vec<String>,
    /// Job index (0 = cover) → last error.
    pub missing: BTreeMap<usize, String>,
}

pub struct WorkflowManager {
    config: Config,
    story_generator: StoryGenerator,
    analyzer: PromptAnalyzer,
    enricher: Enricher,
    decomposer: ConceptDecomposer,
    illustrator: Illustrator,
    concepts_enabled: bool,
    has_assistant: bool,
    storage: Arc<dyn Storage>,
    jobs: Vec<IllustrationJob>,
}

impl WorkflowManager {
    pub async fn new(
        config: Config,
        llm: Arc<dyn TextGenerationBackend>,
        assistant: Option<SharedModel>,
        router: ImageRouter,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let safety = Arc::new(WordListPolicy::new(&config.safety)?);

        let reference_image = match &config.image.reference_image {
            Some(path) => Some(storage.read(path).await?),
            None => None,
        };

        let story_generator = StoryGenerator::new(
            llm,
            config.llm.clone(),
            safety.clone(),
            CharacterValidator::new(assistant.clone(), config.characters.clone()),
            config.story.clone(),
        );
        let analyzer = PromptAnalyzer::new(assistant.clone(), config.analysis.clone());
        let enricher = Enricher::new(config.enrichment.clone());
        let decomposer = ConceptDecomposer::new(assistant.clone(), config.enrichment.clone());

        let concepts_enabled = router.accepts_concepts();
        let illustrator = Illustrator::new(
            router,
            safety,
            assistant.clone(),
            config.illustration.clone(),
            config.image.dimensions(),
        )
        .with_reference_image(reference_image);

        Ok(Self {
            config,
            story_generator,
            analyzer,
            enricher,
            decomposer,
            illustrator,
            concepts_enabled,
            has_assistant: assistant.is_some(),
            storage,
            jobs: Vec::new(),
        })
    }

    /// Builds every backend named in the config.
    pub async fn from_config(config: Config, storage: Arc<dyn Storage>) -> Result<Self> {
        let llm: Arc<dyn TextGenerationBackend> = Arc::from(create_llm(&config.llm)?);
        let assistant = create_assistant(&config.llm)?;
        let router = ImageRouter::new(
            create_image_backend(&config.image)?,
            create_local_backend(&config.image)?,
            config.image.local_fallback,
        );
        info!(
            "Text backend: {}, image backend: {}, assistant: {}",
            llm.name(),
            router.primary_name(),
            assistant.as_ref().map(|a| a.name()).unwrap_or("none")
        );
        Self::new(config, llm, assistant, router, storage).await
    }

    pub async fn run(&mut self, concept: &str, token: &CancellationToken) -> Result<RunSummary> {
        let book = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(GenerationError::Cancelled.into()),
            book = self.load_or_generate_story(concept) => book?,
        };

        println!("Analyzing illustration prompts...");
        let prompts: Vec<String> = book.pages.iter().map(|p| p.image_prompt.clone()).collect();
        let analyses = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(GenerationError::Cancelled.into()),
            analyses = self.analyzer.analyze_all(&prompts) => analyses,
        };

        // Heuristic analyses feed concepts only; appearance injection needs model analyses.
        let book = self
            .enricher
            .enrich(&book, self.has_assistant.then_some(analyses.as_slice()));
        let book_path = join_path(&self.config.output_folder, "storybook.json");
        write_json(self.storage.as_ref(), &book_path, &book).await?;

        let jobs = self.build_jobs(&book, &analyses).await;
        let existing = self.existing_images().await?;

        let (done, pending): (Vec<_>, Vec<_>) =
            jobs.into_iter().partition(|job| existing.contains(&job.index));
        if !done.is_empty() {
            println!("Skipping {} illustration(s) already in {}", done.len(), self.config.output_folder);
        }

        let mut summary = RunSummary {
            title: book.title.clone(),
            ..RunSummary::default()
        };
        self.jobs = done
            .into_iter()
            .map(|mut job| {
                job.state = JobState::Succeeded;
                job
            })
            .collect();
        if pending.is_empty() {
            println!("All illustrations already present");
            return Ok(summary);
        }

        println!("Drawing {} illustration(s)...", pending.len());
        let pb = ProgressBar::new(pending.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );
        let report = self
            .illustrator
            .illustrate(pending, token, |completed, _| pb.set_position(completed as u64))
            .await;
        pb.finish_with_message("Illustration complete");

        for (index, outcome) in &report.images {
            summary.images.push(self.write_image(*index, &outcome.image).await?);
        }
        summary.missing = report.missing;
        self.jobs.extend(report.jobs);
        self.jobs.sort_by_key(|job| job.index);

        if let Some(fatal) = report.fatal {
            return Err(fatal.into());
        }
        if report.cancelled {
            return Err(GenerationError::Cancelled.into());
        }
        if !summary.missing.is_empty() {
            warn!("{} illustration(s) missing after recovery", summary.missing.len());
        }
        Ok(summary)
    }

    /// Runs one job's chain again and writes the image on success.
    pub async fn retry_illustration(&mut self, index: usize, token: &CancellationToken) -> Result<String> {
        let Some(slot) = self.jobs.iter().position(|job| job.index == index) else {
            bail!("No illustration job for index {}", index);
        };

        let mut job = self.jobs[slot].clone();
        let result = self.illustrator.retry_job(&mut job, token).await;
        self.jobs[slot] = job;

        let outcome = result?;
        self.write_image(index, &outcome.image).await
    }

    pub fn jobs(&self) -> &[IllustrationJob] {
        &self.jobs
    }

    async fn load_or_generate_story(&self, concept: &str) -> Result<StoryBook> {
        let path = join_path(&self.config.build_folder, "story.json");
        let page_count = self.config.story.page_count;

        if self.storage.exists(&path).await? {
            let cached: CachedStory = read_json(self.storage.as_ref(), &path).await?;
            if cached.concept == concept && cached.page_count == page_count {
                println!("Loading cached story from {}", path);
                return Ok(cached.book);
            }
            info!("Concept or page count changed, regenerating story");
        }

        println!("Writing story...");
        let story = self.story_generator.generate(concept).await?;
        if story.characters_repaired_by_model {
            info!("Character sheet was rewritten by the assistant model");
        }

        let cached = CachedStory {
            concept: concept.to_string(),
            page_count,
            book: story.book,
            characters_repaired_by_model: story.characters_repaired_by_model,
        };
        write_json(self.storage.as_ref(), &path, &cached).await?;
        Ok(cached.book)
    }

    async fn build_jobs(&self, book: &StoryBook, analyses: &[PromptAnalysis]) -> Vec<IllustrationJob> {
        let style = &self.config.image.style;
        let cover_prompt = self.cover_prompt(book);
        let cover_analysis = analyze_heuristic(&cover_prompt, &self.config.analysis);

        let mut jobs = Vec::with_capacity(book.pages.len() + 1);
        let cover_concepts = if self.concepts_enabled {
            self.decomposer.decompose(&cover_prompt, &cover_analysis).await
        } else {
            Vec::new()
        };
        jobs.push(IllustrationJob::new(0, cover_prompt, style.as_str()).with_concepts(cover_concepts));

        for (i, page) in book.pages.iter().enumerate() {
            let concepts = if self.concepts_enabled {
                let analysis = analyses.get(i).cloned().unwrap_or_default();
                self.decomposer.decompose(&page.image_prompt, &analysis).await
            } else {
                Vec::new()
            };
            jobs.push(
                IllustrationJob::new(page.page_number, page.image_prompt.as_str(), style.as_str())
                    .with_concepts(concepts),
            );
        }
        jobs
    }

    fn cover_prompt(&self, book: &StoryBook) -> String {
        let names: Vec<String> = parse_character_sheet(&book.character_descriptions)
            .into_iter()
            .map(|entry| entry.name)
            .take(3)
            .collect();

        let prompt = if names.is_empty() {
            format!("Cover of a picture book titled \"{}\", bright and welcoming", book.title)
        } else {
            format!(
                "{} together on the cover of a picture book titled \"{}\", smiling, bright and welcoming",
                names.join(" and "),
                book.title
            )
        };
        self.enricher.enrich_text(&prompt, &book.character_descriptions)
    }

    async fn existing_images(&self) -> Result<HashSet<usize>> {
        let entries = self.storage.list(&self.config.output_folder).await?;
        Ok(entries
            .iter()
            .filter_map(|entry| Path::new(entry).file_stem()?.to_str().and_then(index_of_stem))
            .collect())
    }

    async fn write_image(&self, index: usize, image: &ImageData) -> Result<String> {
        let file = format!("{}.{}", image_stem(index), image.extension());
        let path = join_path(&self.config.output_folder, &file);
        self.storage.write(&path, &image.bytes).await?;
        Ok(path)
    }
}

fn image_stem(index: usize) -> String {
    if index == 0 {
        "cover".to_string()
    } else {
        format!("page_{:02}", index)
    }
}

fn index_of_stem(stem: &str) -> Option<usize> {
    if stem == "cover" {
        return Some(0);
    }
    stem.strip_prefix("page_")?.parse().ok().filter(|&i| i > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::services::illustration::IllustrationOptions;
    use crate::services::image::ImageGenerationBackend;
    use crate::services::testing::{MockImageBackend, MockLlmClient};
    use std::fs;

    const TEXT_REPLY: &str = r#"{"title": "Luna's Snowy Walk", "authorLine": "by Nana",
        "moral": "Friends keep you warm.",
        "characterDescriptions": "Luna - small orange fox, green scarf",
        "pages": [
            {"pageNumber": 1, "text": "Luna sees snow."},
            {"pageNumber": 2, "text": "Luna meets Bruno."}
        ]}"#;

    const PROMPT_REPLY: &str = r#"{"prompts": [
        {"pageNumber": 1, "imagePrompt": "Luna looking at falling snow"},
        {"pageNumber": 2, "imagePrompt": "Luna and Bruno under a pine tree"}
    ]}"#;

    fn llm() -> MockLlmClient {
        MockLlmClient::new()
            .reply("based on this idea", TEXT_REPLY)
            .reply("Write one illustration prompt", PROMPT_REPLY)
    }

    fn config(root: &Path) -> Config {
        let yaml = format!(
            "output_folder: {}\nbuild_folder: {}\nunattended: true\nllm:\n  provider: mock\n  retry_count: 0\nstory:\n  page_count: 2\n",
            root.join("output").display(),
            root.join("build").display()
        );
        let mut config: Config = serde_yaml_ng::from_str(&yaml).unwrap();
        config.illustration = IllustrationOptions {
            attempts_per_variant: 1,
            retry_delay_ms: 0,
            max_jitter_ms: 0,
            ..IllustrationOptions::default()
        };
        config
    }

    async fn workflow(config: Config, llm: MockLlmClient, images: Arc<MockImageBackend>) -> Result<WorkflowManager> {
        let backend: Arc<dyn ImageGenerationBackend> = images;
        WorkflowManager::new(
            config,
            Arc::new(llm),
            None,
            ImageRouter::new(backend, None, false),
            Arc::new(NativeStorage::new()),
        )
        .await
    }

    #[tokio::test]
    async fn test_run_writes_book_and_images() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let config = config(temp_dir.path());
        let images = Arc::new(MockImageBackend::new());

        let mut workflow = workflow(config, llm(), images.clone()).await?;
        let summary = workflow.run("A fox who loves snow", &CancellationToken::new()).await?;

        assert_eq!(summary.title, "Luna's Snowy Walk");
        assert!(summary.missing.is_empty());
        assert_eq!(summary.images.len(), 3);

        let output = temp_dir.path().join("output");
        assert!(output.join("cover.png").exists());
        assert!(temp_dir.path().join("build").join("story.json").exists());

        // The mock backend echoes the prompt it was given.
        let page_one = fs::read_to_string(output.join("page_01.png"))?;
        assert!(page_one.starts_with("Luna, a small orange fox"));
        assert!(page_one.contains("looking at falling snow"));
        let cover = fs::read_to_string(output.join("cover.png"))?;
        assert!(cover.contains("Luna's Snowy Walk"));

        let book: StoryBook = serde_json::from_str(&fs::read_to_string(output.join("storybook.json"))?)?;
        assert_eq!(book.pages.len(), 2);
        assert_eq!(book.pages[0].image_prompt, page_one);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_run_reuses_story_and_images() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let llm = llm();
        let calls = llm.call_count.clone();
        let images = Arc::new(MockImageBackend::new());

        let mut first = workflow(config(temp_dir.path()), llm.clone(), images.clone()).await?;
        first.run("A fox who loves snow", &CancellationToken::new()).await?;
        assert_eq!(*calls.lock().unwrap(), 2);
        let drawn = images.prompts.lock().unwrap().len();

        let mut second = workflow(config(temp_dir.path()), llm, images.clone()).await?;
        let summary = second.run("A fox who loves snow", &CancellationToken::new()).await?;

        assert_eq!(*calls.lock().unwrap(), 2, "cached story should skip the text backend");
        assert_eq!(images.prompts.lock().unwrap().len(), drawn);
        assert!(summary.images.is_empty());
        assert!(second.jobs().iter().all(|job| job.state == JobState::Succeeded));
        Ok(())
    }

    #[tokio::test]
    async fn test_page_count_change_regenerates_story() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let llm = llm();
        let images = Arc::new(MockImageBackend::new());

        let mut first = workflow(config(temp_dir.path()), llm.clone(), images.clone()).await?;
        first.run("A fox who loves snow", &CancellationToken::new()).await?;
        assert_eq!(llm.calls(), 2);

        let mut longer = config(temp_dir.path());
        longer.story.page_count = 3;
        let mut second = workflow(longer, llm.clone(), images).await?;
        second.run("A fox who loves snow", &CancellationToken::new()).await?;
        assert_eq!(llm.calls(), 4, "a new page count should not reuse the cached story");

        let cached: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(temp_dir.path().join("build").join("story.json"))?)?;
        assert_eq!(cached["page_count"], 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_page_can_be_retried() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        // Safe and softened attempts fail twice over (parallel phase and recovery),
        // and so does the generic fallback.
        let images = Arc::new(
            MockImageBackend::new()
                .fail("pine", 4, GenerationError::ContentRejected)
                .fail("sunny meadow", 2, GenerationError::ContentRejected),
        );

        let mut workflow = workflow(config(temp_dir.path()), llm(), images.clone()).await?;
        let token = CancellationToken::new();
        let summary = workflow.run("A fox who loves snow", &token).await?;

        assert_eq!(summary.missing.keys().copied().collect::<Vec<_>>(), vec![2]);
        let output = temp_dir.path().join("output");
        assert!(output.join("page_01.png").exists());
        assert!(!output.join("page_02.png").exists());

        let path = workflow.retry_illustration(2, &token).await?;
        assert!(path.ends_with("page_02.png"));
        assert!(output.join("page_02.png").exists());
        assert!(workflow.retry_illustration(9, &token).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp_dir = tempfile::tempdir().unwrap();
        let images = Arc::new(MockImageBackend::new());
        let mut workflow = workflow(config(temp_dir.path()), llm(), images).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = workflow.run("A fox", &token).await.unwrap_err();
        assert!(GenerationError::is_cancelled(&err));
    }

    #[test]
    fn test_image_file_names() {
        assert_eq!(image_stem(0), "cover");
        assert_eq!(image_stem(7), "page_07");
        assert_eq!(index_of_stem("page_12"), Some(12));
        assert_eq!(index_of_stem("cover"), Some(0));
        assert_eq!(index_of_stem("storybook"), None);
        assert_eq!(index_of_stem("page_00"), None);
    }
}
