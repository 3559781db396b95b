use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ultraflux_core::{
    write_jpeg, FluxLoader, GenerateRequest, GenerationRequest, Loader, ModelLike, ServiceConfig,
};

const BUILTIN_PROMPTS: &str = include_str!("prompts.txt");

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate UltraFlux images for a list of prompts")]
struct Args {
    #[command(flatten)]
    service: ServiceConfig,

    /// File with one prompt per line (`#` starts a comment line)
    #[arg(long, conflicts_with = "prompt")]
    prompts_file: Option<PathBuf>,

    /// Prompt to render, may be repeated
    #[arg(long)]
    prompt: Vec<String>,

    #[arg(long, default_value_t = 4096)]
    height: usize,

    #[arg(long, default_value_t = 4096)]
    width: usize,

    #[arg(long, default_value_t = 50)]
    num_inference_steps: usize,

    #[arg(long, default_value_t = 4.0)]
    guidance_scale: f64,

    /// Seed used for every prompt
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn parse_prompts(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

impl Args {
    fn prompts(&self) -> Result<Vec<String>> {
        if !self.prompt.is_empty() {
            return Ok(self.prompt.clone());
        }
        match &self.prompts_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Ok(parse_prompts(&text))
            }
            None => Ok(parse_prompts(BUILTIN_PROMPTS)),
        }
    }

    fn request(&self, prompt: &str) -> GenerateRequest {
        GenerateRequest {
            height: self.height,
            width: self.width,
            num_inference_steps: self.num_inference_steps,
            guidance_scale: self.guidance_scale,
            seed: Some(self.seed),
            ..GenerateRequest::new(prompt)
        }
    }
}

/// Renders `requests` in order into `results_dir` as `ultra_flux_{idx:02}.jpeg`,
/// with 1-based indices and existing files replaced. A failed prompt is
/// logged and skipped. Returns how many prompts failed.
fn run_batch(
    model: &impl ModelLike,
    requests: &[GenerationRequest],
    results_dir: &Path,
) -> Result<usize> {
    let mut failed = 0;
    for (idx, request) in requests.iter().enumerate() {
        let idx = idx + 1;
        let path = results_dir.join(format!("ultra_flux_{idx:02}.jpeg"));
        let started = Instant::now();
        let saved = model
            .run(request)
            .and_then(|image| write_jpeg(&image, &path));
        match saved {
            Ok(()) => info!(idx, elapsed = ?started.elapsed(), path = %path.display(), "saved image"),
            Err(err) => {
                failed += 1;
                error!(idx, "generation failed: {err:#}");
            }
        }
    }
    Ok(failed)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let prompts = args.prompts()?;
    if prompts.is_empty() {
        bail!("no prompts to render");
    }
    // Reject bad parameters before spending minutes loading weights.
    let requests = prompts
        .iter()
        .map(|prompt| args.request(prompt).resolve())
        .collect::<Result<Vec<_>, _>>()?;

    let results_dir = &args.service.results_dir;
    std::fs::create_dir_all(results_dir)
        .with_context(|| format!("failed to create results dir {}", results_dir.display()))?;

    let model = FluxLoader.load(args.service.pipeline.clone()).await?;

    let failed = run_batch(&model, &requests, results_dir)?;

    if failed > 0 {
        bail!("{failed} of {} prompts failed", prompts.len());
    }
    Ok(())
}
