use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use site_clone::cli::{default_archive_name, CloneCommand};
use site_clone::{
    parse_page_url, BarProgress, CloneEngine, FileManager, HttpFetcher, HttpRenderer, JsonProgress, ProgressSink,
};

fn init_logging(verbose: bool) {
    let default = if verbose { "site_clone=debug" } else { "site_clone=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CloneCommand::parse();
    init_logging(args.verbose);

    let config = args.to_config().context("Invalid configuration")?;
    let page = parse_page_url(&args.url)?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(default_archive_name(page.host_str().unwrap_or_default())));

    if !args.progress_json {
        println!("🚀 Cloning: {}", page.as_str().blue());
        println!("📦 Output archive: {:?}", output);
        println!("⚡ Max concurrent downloads: {}", config.harvest_concurrency);
    }

    let renderer = HttpRenderer::new(&config)?;
    let fetcher = HttpFetcher::new(&config)?;
    let engine = CloneEngine::new(page, config, fetcher)?;

    let bar = (!args.progress_json).then(BarProgress::new);
    let sink: &dyn ProgressSink = match &bar {
        Some(bar) => bar,
        None => &JsonProgress,
    };
    let result = engine.run(&renderer, sink).await;
    if let Some(bar) = &bar {
        bar.finish(if result.is_ok() { "✅ Clone complete" } else { "❌ Clone failed" });
    }
    let clone = result.context("Clone failed")?;

    FileManager::save_archive(&output, &clone.archive)?;
    if let Some(dir) = &args.extract_dir {
        let written = FileManager::new(dir)?.extract(&clone.contents)?;
        if !args.progress_json {
            println!("📁 Extracted {} files to {:?}", written, dir);
        }
    }

    if !args.progress_json {
        let report = &clone.report;
        println!("📊 Captured resources: {}", report.captured);
        println!("🖼️  Harvested external assets: {}", report.harvested.len());
        println!("🔗 References rewritten: {}", report.rewritten);
        if report.placeholders > 0 {
            println!("⚠️  Placeholders inserted: {}", report.placeholders.to_string().yellow());
        }
        if !report.warnings.is_empty() {
            println!("⚠️  Warnings: {} (run with -v for details)", report.warnings.len().to_string().yellow());
        }
        println!("✅ Saved {} ({} bytes)", output.display().to_string().green(), clone.archive.len());
    }
    Ok(())
}
