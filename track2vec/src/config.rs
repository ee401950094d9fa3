//! Training hyperparameters and file locations.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::real;

/// Everything a training run needs to know, fixed for the duration of the run.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Training corpus, one session record per line.
    pub input: PathBuf,
    /// Track metadata, one track per line.
    pub metadata: PathBuf,
    /// Directory for checkpoints and exported vectors. Pretrained vectors are
    /// also read from here.
    pub output_dir: PathBuf,

    /// Embedding vector length.
    pub dim: usize,
    /// Max skip length between tracks.
    pub window: usize,
    /// Number of passes over the token budget.
    pub epoch: u64,
    /// Number of negative examples per positive one.
    pub negative: usize,
    /// Starting learning rate.
    pub lr: real,
    /// Tokens a thread processes between learning rate updates.
    pub lr_update_rate: u64,
    /// Sub-sampling threshold; frequent tracks are randomly dropped.
    pub sample: real,
    pub threads: usize,
    /// Lines between the starting positions of consecutive streaming threads.
    pub thread_interval: u64,
    pub seed: u64,

    /// Blend vectors from a previous run found in `output_dir`.
    pub load_pretrained: bool,
    /// Learning rate multiplier for tracks that got a pretrained vector.
    pub pretrained_lr: real,
    /// Load the whole corpus into memory instead of streaming it.
    pub in_memory: bool,

    pub report_interval: Duration,
    /// Progress records buffered before the progress log is flushed.
    pub log_buffer_size: usize,
    pub verbose: u8,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            input: PathBuf::new(),
            metadata: PathBuf::new(),
            output_dir: PathBuf::new(),
            dim: 200,
            window: 3,
            epoch: 10,
            negative: 100,
            lr: 0.1,
            lr_update_rate: 100_000,
            sample: 1e-4,
            threads: thread::available_parallelism().map_or(1, |n| n.get()),
            thread_interval: 1000,
            seed: 0,
            load_pretrained: true,
            pretrained_lr: 0.2,
            in_memory: false,
            report_interval: Duration::from_secs(5),
            log_buffer_size: 1000,
            verbose: 1,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("input", &self.input),
            ("metadata", &self.metadata),
            ("output directory", &self.output_dir),
        ];
        for (name, path) in required {
            if path.as_os_str().is_empty() {
                return Err(Error::Config(format!("{name} path is required")));
            }
        }
        if self.dim == 0 {
            return Err(Error::Config("dim must be positive".to_string()));
        }
        if self.window == 0 {
            return Err(Error::Config("window must be positive".to_string()));
        }
        if self.threads == 0 {
            return Err(Error::Config("at least one thread is required".to_string()));
        }
        if self.epoch == 0 {
            return Err(Error::Config("epoch must be positive".to_string()));
        }
        if !(self.lr > 0.0) {
            return Err(Error::Config(format!("invalid learning rate {}", self.lr)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> TrainConfig {
        TrainConfig {
            input: "corpus.json".into(),
            metadata: "meta.json".into(),
            output_dir: "out".into(),
            ..TrainConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid_once_paths_are_set() {
        assert!(paths().validate().is_ok());
    }

    #[test]
    fn missing_paths_are_rejected() {
        let err = TrainConfig::default().validate().unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("input")));

        let config = TrainConfig {
            output_dir: PathBuf::new(),
            ..paths()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for config in [
            TrainConfig { dim: 0, ..paths() },
            TrainConfig { window: 0, ..paths() },
            TrainConfig { threads: 0, ..paths() },
            TrainConfig { epoch: 0, ..paths() },
        ] {
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
    }
}
