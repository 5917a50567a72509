use std::{
    collections::HashMap,
    io::{stdin, stdout, BufReader, Write},
    num::NonZeroUsize,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{DecimalBytes, MultiProgress, ProgressBar, ProgressStyle};

use layerscope::{
    progress::{ProgressEvent, ProgressSink},
    AnalysisResult, AnalyzerOptions, ImageAnalyzer,
};

/// layerscope
#[derive(Debug, Parser)]
#[clap(name = "layerscope", version)]
pub struct App {
    /// Image archive as written by `docker save`, or `-` for stdin
    archive: Option<PathBuf>,
    /// Print the full result as JSON
    #[clap(long)]
    json: bool,
    /// Number of layers to index in parallel
    #[clap(long)]
    jobs: Option<NonZeroUsize>,
    /// Give up after this many seconds
    #[clap(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Number of inefficient files to list
    #[clap(long, default_value_t = 10)]
    top: usize,
    /// Don't show progress
    #[clap(long, short)]
    quiet: bool,
}

/// One spinner per layer while it is being indexed.
struct ProgressBars {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<usize, ProgressBar>>,
}

impl ProgressBars {
    fn new() -> Result<Self> {
        Ok(Self {
            multi: MultiProgress::new(),
            style: ProgressStyle::with_template("  {prefix} {spinner:.cyan} {msg}")?,
            bars: Mutex::default(),
        })
    }
}

impl ProgressSink for ProgressBars {
    fn event(&self, event: &ProgressEvent) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };

        match event {
            ProgressEvent::LayerStarted { layer, name } => {
                let bar = self
                    .multi
                    .add(ProgressBar::new_spinner().with_style(self.style.clone()));
                bar.set_prefix(format!("[layer: {layer:2}]"));
                bar.set_message(name.clone());
                bar.enable_steady_tick(Duration::from_millis(100));
                bars.insert(*layer, bar);
            }
            ProgressEvent::LayerProgress {
                layer,
                name,
                records,
            } => {
                if let Some(bar) = bars.get(layer) {
                    bar.set_message(format!("{name} : {records} files"));
                }
            }
            ProgressEvent::LayerFinished {
                layer,
                name,
                records,
                size,
            } => {
                if let Some(bar) = bars.remove(layer) {
                    bar.finish_with_message(format!(
                        "{name} : {records} files, {}",
                        DecimalBytes(*size)
                    ));
                }
            }
            ProgressEvent::ArchiveScanned { layers } => {
                log::debug!("archive scanned, {layers} layers");
            }
        }
    }
}

fn print_report(out: &mut impl Write, result: &AnalysisResult, top: usize) -> Result<()> {
    if !result.repo_tags.is_empty() {
        writeln!(out, "Image: {}", result.repo_tags.join(", "))?;
    }

    writeln!(out, "Layers:")?;
    writeln!(out, "{:<25} {:>7}  Command", "Id", "Size")?;
    for layer in result.layers.iter().rev() {
        writeln!(out, "{layer}")?;
    }
    writeln!(out)?;

    let percent = |ratio: f64| format!("{:.2} %", ratio * 100.0);
    writeln!(out, "Efficiency score:       {}", percent(result.efficiency_score))?;
    writeln!(out, "Total size:             {}", DecimalBytes(result.size_bytes))?;
    writeln!(out, "User size:              {}", DecimalBytes(result.user_size_bytes))?;
    writeln!(out, "Squashed size:          {}", DecimalBytes(result.squashed_size_bytes))?;
    writeln!(out, "Potential wasted space: {}", DecimalBytes(result.wasted_bytes))?;
    writeln!(out, "Wasted user percent:    {}", percent(result.wasted_user_percent))?;

    if result.duplicate_paths.is_empty() {
        return Ok(());
    }

    writeln!(out)?;
    writeln!(out, "Inefficient files:")?;
    writeln!(out, "{:<6} {:>12}  File Path", "Count", "Wasted Space")?;
    for duplicate in result.duplicate_paths.iter().take(top) {
        writeln!(
            out,
            "{:<6} {:>12}  {}",
            duplicate.occurrences.len(),
            DecimalBytes(duplicate.cumulative_wasted_size).to_string(),
            duplicate.path.display()
        )?;
    }
    if result.duplicate_paths.len() > top {
        writeln!(out, "... and {} more", result.duplicate_paths.len() - top)?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let options = AnalyzerOptions {
        jobs: args.jobs,
        timeout: args.timeout.map(Duration::from_secs),
    };
    let mut analyzer = ImageAnalyzer::new(options);
    if !args.quiet {
        analyzer = analyzer.with_progress(Arc::new(ProgressBars::new()?));
    }

    let result = match &args.archive {
        Some(path) if path.as_os_str() != "-" => analyzer
            .analyze_path(path)
            .await
            .with_context(|| format!("Analyzing {}", path.display()))?,
        _ => analyzer
            .analyze(BufReader::new(stdin()))
            .await
            .context("Analyzing image from stdin")?,
    };

    let mut out = stdout().lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &result)?;
        writeln!(out)?;
    } else {
        print_report(&mut out, &result, args.top)?;
    }

    Ok(())
}
