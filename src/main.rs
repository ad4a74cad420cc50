use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use narrator::{Pipeline, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PROMPT: &str = "Based on what happens in the video, write a short narration \
     in the style of classical Chinese poetry.";

#[derive(Parser)]
#[command(name = "narrator")]
#[command(about = "Narrate videos using OpenAI vision and text-to-speech", long_about = None)]
struct Cli {
    input_file: PathBuf,
    #[arg(short, long, default_value = DEFAULT_PROMPT)]
    prompt: String,
    /// Where to save the narrated video
    #[arg(short, long)]
    output: PathBuf,
    #[command(flatten)]
    settings: Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "narrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let video = tokio::fs::read(&cli.input_file)
        .await
        .with_context(|| format!("failed to read {}", cli.input_file.display()))?;

    let mut pipeline = Pipeline::from_settings(&cli.settings)?;
    let bytes = pipeline
        .run(video, &cli.prompt, |narrated| {
            println!("{}", narrated.narration());
            narrated.output().deliver(&cli.output)
        })
        .await?;

    tracing::info!(path = %cli.output.display(), bytes, "narrated video saved");
    Ok(())
}
