use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use track2vec::{real, Progress, TrainConfig, Trainer};

#[derive(Parser)]
#[command(about = "Train track, artist and genre embeddings from listening sessions", long_about = None)]
struct Options {
    /// Use session records from FILE to train the model
    #[arg(long = "train", value_name = "FILE")]
    input: PathBuf,

    /// Read track metadata (artists, genres, token counts) from FILE
    #[arg(long, value_name = "FILE")]
    metadata: PathBuf,

    /// Save checkpoints and vectors to DIR; pretrained vectors are read from here too
    #[arg(long = "output", value_name = "DIR")]
    output_dir: PathBuf,

    /// Set size of embedding vectors
    #[arg(long, default_value_t = 200)]
    dim: usize,

    /// Set max skip length between tracks
    #[arg(long, default_value_t = 3)]
    window: usize,

    /// Number of passes over the corpus token count
    #[arg(long, default_value_t = 10)]
    epoch: u64,

    /// Number of negative examples per positive one
    #[arg(long, default_value_t = 100)]
    negative: usize,

    /// Set the starting learning rate
    #[arg(long, default_value_t = 0.1)]
    lr: real,

    /// Update the learning rate every N tokens per thread
    #[arg(long, value_name = "N", default_value_t = 100_000)]
    lr_update_rate: u64,

    /// Set threshold for occurrence of tracks. Those that appear with higher
    /// frequency in the training data will be randomly down-sampled
    #[arg(long, default_value_t = 1e-4)]
    sample: real,

    /// Use N threads; default is the number of CPUs
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Start each streaming thread N lines after the previous one
    #[arg(long, value_name = "N", default_value_t = 1000)]
    thread_interval: u64,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Do not blend in vectors from a previous run
    #[arg(long)]
    no_pretrained: bool,

    /// Learning rate multiplier for tracks with a pretrained vector
    #[arg(long, default_value_t = 0.2)]
    pretrained_lr: real,

    /// Load the whole corpus into memory instead of streaming it
    #[arg(long)]
    in_memory: bool,

    /// Seconds between progress reports
    #[arg(long, value_name = "SECS", default_value_t = 5.0)]
    report_interval: f64,

    /// Append progress records as JSON lines to a file in DIR
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Name of this run in the progress log
    #[arg(long, default_value = "track2vec")]
    run_label: String,

    /// Progress records buffered before the progress log is written
    #[arg(long, value_name = "N", default_value_t = 1000)]
    log_buffer_size: usize,

    /// 0 = warnings only, 1 = progress, 2 = debug output
    #[arg(long, default_value_t = 1)]
    verbose: u8,
}

impl Options {
    fn to_config(&self) -> TrainConfig {
        let defaults = TrainConfig::default();
        TrainConfig {
            input: self.input.clone(),
            metadata: self.metadata.clone(),
            output_dir: self.output_dir.clone(),
            dim: self.dim,
            window: self.window,
            epoch: self.epoch,
            negative: self.negative,
            lr: self.lr,
            lr_update_rate: self.lr_update_rate,
            sample: self.sample,
            threads: self.threads.unwrap_or(defaults.threads),
            thread_interval: self.thread_interval,
            seed: self.seed,
            load_pretrained: !self.no_pretrained,
            pretrained_lr: self.pretrained_lr,
            in_memory: self.in_memory,
            report_interval: Duration::from_secs_f64(self.report_interval.max(0.0)),
            log_buffer_size: self.log_buffer_size,
            verbose: self.verbose,
        }
    }
}

#[derive(Serialize)]
struct LogRecord {
    run: String,
    elapsed_secs: f64,
    progress: real,
    loss: real,
    throughput: real,
    learning_rate: real,
    eta_secs: real,
}

/// Progress records, appended to `<dir>/<run>.progress.json` in batches.
struct ProgressLog {
    path: PathBuf,
    run: String,
    start: Instant,
    capacity: usize,
    buffer: Vec<LogRecord>,
}

impl ProgressLog {
    fn create(dir: &Path, run: &str, capacity: usize) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("error creating log directory {}", dir.display()))?;
        let path = dir.join(format!("{run}.progress.json"));
        File::create(&path).with_context(|| format!("error creating {}", path.display()))?;
        Ok(ProgressLog {
            path,
            run: run.to_string(),
            start: Instant::now(),
            capacity: capacity.max(1),
            buffer: vec![],
        })
    }

    fn record(&mut self, p: &Progress) -> Result<()> {
        self.buffer.push(LogRecord {
            run: self.run.clone(),
            elapsed_secs: self.start.elapsed().as_secs_f64(),
            progress: p.progress,
            loss: p.loss,
            throughput: p.throughput,
            learning_rate: p.learning_rate,
            eta_secs: p.eta_secs,
        });
        if self.buffer.len() >= self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("error opening {}", self.path.display()))?;
        let mut out = BufWriter::new(file);
        for record in self.buffer.drain(..) {
            serde_json::to_writer(&mut out, &record).context("error writing progress log")?;
            writeln!(out).context("error writing progress log")?;
        }
        out.flush().context("error writing progress log")?;
        Ok(())
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn train(options: &Options) -> Result<()> {
    let config = options.to_config();
    let output_dir = config.output_dir.clone();
    let log_buffer_size = config.log_buffer_size;
    let mut trainer = Trainer::new(config).context("error preparing training")?;

    let mut log = match &options.log_dir {
        Some(dir) => Some(ProgressLog::create(dir, &options.run_label, log_buffer_size)?),
        None => None,
    };

    let bar = if options.verbose > 0 {
        ProgressBar::new(1000)
    } else {
        ProgressBar::hidden()
    };
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% {msg}")
            .context("invalid progress bar template")?,
    );

    let mut log_result = Ok(());
    let result = trainer.train(|p| {
        bar.set_position((p.progress * 1000.0) as u64);
        bar.set_message(format!(
            "loss {:.4}  lr {:.5}  {:.0} tracks/thread/sec  eta {}",
            p.loss,
            p.learning_rate,
            p.throughput,
            HumanDuration(Duration::from_secs_f64(p.eta_secs.max(0.0))),
        ));
        if let Some(log) = &mut log {
            if log_result.is_ok() {
                log_result = log.record(p);
            }
        }
    });
    bar.finish();
    if let Some(log) = &mut log {
        log.flush()?;
    }
    result.context("training failed")?;
    log_result?;

    trainer
        .save_model(&output_dir)
        .context("error saving model checkpoint")?;
    trainer
        .save_vectors(&output_dir)
        .context("error saving vectors")?;
    info!("vectors saved to {}", output_dir.display());
    Ok(())
}

fn main() {
    let options = Options::parse();
    init_logging(options.verbose);

    if let Err(err) = train(&options) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}
