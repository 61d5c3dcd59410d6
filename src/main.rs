use anyhow::Result;
use std::sync::Arc;
use storybook::core::config::Config;
use storybook::core::error::GenerationError;
use storybook::core::io::NativeStorage;
use storybook::services::workflow::WorkflowManager;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load config
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM and image settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    // 2. Story concept from the command line, or ask for one
    let args: Vec<String> = std::env::args().skip(1).collect();
    let concept = if !args.is_empty() {
        args.join(" ")
    } else if config.unattended {
        anyhow::bail!("No story concept given. Usage: storybook <concept>");
    } else {
        inquire::Text::new("What should the story be about?").prompt()?
    };

    // 3. Ctrl-C cancels the run but keeps finished pages
    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling, finished pages are kept...");
            ctrl_c.cancel();
        }
    });

    // 4. Run
    let unattended = config.unattended;
    let mut manager = WorkflowManager::from_config(config, Arc::new(NativeStorage::new())).await?;
    let summary = match manager.run(&concept, &token).await {
        Ok(summary) => summary,
        Err(e) if GenerationError::is_cancelled(&e) => {
            println!("Cancelled.");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    println!("\"{}\": {} illustration(s) written", summary.title, summary.images.len());
    if summary.missing.is_empty() {
        println!("Storybook complete!");
        return Ok(());
    }

    // 5. Offer a manual retry for each missing illustration
    for (index, reason) in &summary.missing {
        let label = if *index == 0 {
            "Cover".to_string()
        } else {
            format!("Page {}", index)
        };
        println!("{} has no illustration: {}", label, reason);

        if unattended || token.is_cancelled() {
            continue;
        }
        let retry = inquire::Confirm::new(&format!("Retry {}?", label.to_lowercase()))
            .with_default(true)
            .prompt();
        match retry {
            Ok(true) => match manager.retry_illustration(*index, &token).await {
                Ok(path) => println!("Saved {}", path),
                Err(e) => println!("{} failed again: {}", label, e),
            },
            Ok(false) => {}
            Err(_) => {
                println!("Error reading input, stopping.");
                break;
            }
        }
    }

    Ok(())
}
