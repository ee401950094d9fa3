//! The training run: set up the model, train it on many threads, save it.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::panic;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::Instant;

use rand::Rng;
use tracing::{debug, info};

use crate::checkpoint::{self, blend_vectors, write_vectors};
use crate::config::TrainConfig;
use crate::corpus::{self, CorpusReader};
use crate::entity::{Entity, EntityKind};
use crate::error::{Error, Result};
use crate::model::{Model, State};
use crate::real;
use crate::vector;
use crate::vocab::Vocab;

/// The learning rate never decays below this.
pub const MIN_LEARNING_RATE: real = 0.001;

/// Reported ETA before any progress has been made: 30 days.
const UNKNOWN_ETA_SECS: real = 2_592_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Draining,
    Completed,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Initializing => "initializing",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        })
    }
}

/// A snapshot of a running training job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Fraction of the token budget processed, in `[0, 1]`.
    pub progress: real,
    /// Mean loss per example recently seen by the first thread.
    pub loss: real,
    /// Tokens per second per thread.
    pub throughput: real,
    pub learning_rate: real,
    pub eta_secs: real,
}

/// `base * (1 - progress)`, but never below [`MIN_LEARNING_RATE`].
pub fn learning_rate(base: real, progress: real) -> real {
    (base * (1.0 - progress)).max(MIN_LEARNING_RATE)
}

/// Counters shared by the workers of one run.
struct Run {
    budget: u64,
    processed: AtomicU64,
    /// `f64` bits; negative until the first thread publishes a loss.
    loss: AtomicU64,
    learning_rate: AtomicU64,
    failure: OnceLock<Error>,
}

impl Run {
    fn new(budget: u64, lr: real) -> Self {
        Run {
            budget,
            processed: AtomicU64::new(0),
            loss: AtomicU64::new((-1.0 as real).to_bits()),
            learning_rate: AtomicU64::new(lr.to_bits()),
            failure: OnceLock::new(),
        }
    }

    fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Adds `tokens` to the shared count and returns the new progress.
    fn add_tokens(&self, tokens: u64) -> real {
        let processed = self.processed.fetch_add(tokens, Ordering::Relaxed) + tokens;
        self.progress_at(processed)
    }

    fn progress_at(&self, processed: u64) -> real {
        if self.budget == 0 {
            return 1.0;
        }
        (processed as real / self.budget as real).min(1.0)
    }

    fn loss(&self) -> Option<real> {
        let loss = real::from_bits(self.loss.load(Ordering::Relaxed));
        (loss >= 0.0).then_some(loss)
    }

    fn publish(&self, loss: Option<real>, lr: real) {
        if let Some(loss) = loss {
            self.loss.store(loss.to_bits(), Ordering::Relaxed);
        }
        self.learning_rate.store(lr.to_bits(), Ordering::Relaxed);
    }

    fn learning_rate(&self) -> real {
        real::from_bits(self.learning_rate.load(Ordering::Relaxed))
    }

    /// Records the first error; later ones are dropped.
    fn fail(&self, err: Error) {
        if let Err(err) = self.failure.set(err) {
            debug!("dropping secondary worker error: {err}");
        }
    }

    fn failed(&self) -> bool {
        self.failure.get().is_some()
    }

    fn done(&self) -> bool {
        self.failed() || self.processed() >= self.budget
    }

    fn report(&self, start: Instant, threads: usize, loss: real) -> Progress {
        let processed = self.processed();
        let progress = self.progress_at(processed);
        let elapsed = start.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            processed as real / elapsed / threads as real
        } else {
            0.0
        };
        let eta_secs = if progress > 0.0 {
            elapsed * (1.0 - progress) / progress
        } else {
            UNKNOWN_ETA_SECS
        };
        Progress {
            progress,
            loss,
            throughput,
            learning_rate: self.learning_rate(),
            eta_secs,
        }
    }
}

/// Where a worker gets its sequences from.
enum Source<'a> {
    Stream {
        corpus: CorpusReader,
        pass: u64,
        tokens_this_pass: u64,
    },
    Memory {
        shard: &'a [Vec<usize>],
        next: usize,
    },
}

impl Source<'_> {
    /// Fills `out` with the next sub-sampled sequence and returns the number
    /// of tokens it had before sub-sampling.
    fn next_sequence<R: Rng>(&mut self, vocab: &Vocab, rng: &mut R, out: &mut Vec<usize>) -> Result<u64> {
        match self {
            Source::Stream {
                corpus,
                pass,
                tokens_this_pass,
            } => {
                let n = vocab.read_sequence(corpus, rng, out)?;
                if corpus.passes() != *pass {
                    // Only a pass that started at the top of the file covers
                    // the whole corpus.
                    if *pass > 0 && *tokens_this_pass == 0 {
                        return Err(Error::EmptyCorpus(corpus.path().to_path_buf()));
                    }
                    *pass = corpus.passes();
                    *tokens_this_pass = 0;
                }
                *tokens_this_pass += n;
                Ok(n)
            }
            Source::Memory { shard, next } => {
                let seq = &shard[*next];
                *next = (*next + 1) % shard.len();
                out.clear();
                out.extend(
                    seq.iter()
                        .copied()
                        .filter(|&t| !vocab.track(t).discard(rng.gen())),
                );
                Ok(seq.len() as u64)
            }
        }
    }
}

/// Runs one skip-gram pass over `seq`: every track is trained against each
/// distinct track within a randomly shrunk window around it.
pub fn skipgram(
    model: &Model,
    vocab: &Vocab,
    window: usize,
    seq: &[usize],
    lr: real,
    state: &mut State,
) -> Result<()> {
    let mut context = BTreeSet::new();
    for (w, &center) in seq.iter().enumerate() {
        let boundary = state.rng.gen_range(1..=window);
        context.clear();
        let lo = w.saturating_sub(boundary);
        let hi = (w + boundary + 1).min(seq.len());
        for (pos, &track) in seq.iter().enumerate().take(hi).skip(lo) {
            if pos != w {
                context.insert(track);
            }
        }
        let track = vocab.track(center);
        let rate = lr * track.lr_scale();
        for &target in &context {
            model.update(track, target, &context, rate, state)?;
        }
    }
    Ok(())
}

pub struct Trainer {
    config: TrainConfig,
    vocab: Vocab,
    model: Model,
    trained: bool,
}

fn enter(phase: Phase) {
    info!(%phase, "training phase");
}

impl Trainer {
    /// Builds the vocabulary, allocates the model and, if configured, blends
    /// in vectors from a previous run found in the output directory.
    pub fn new(config: TrainConfig) -> Result<Self> {
        enter(Phase::Initializing);
        config.validate()?;
        let mut vocab = Vocab::load(&config.metadata, config.sample)?;
        let model = Model::for_vocab(&vocab, &config)?;
        if config.load_pretrained {
            load_pretrained(&config, &mut vocab, &model)?;
        }
        Ok(Trainer {
            config,
            vocab,
            model,
            trained: false,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Trains until `epoch` times the corpus token count has been processed.
    ///
    /// `on_progress` is called on this thread every `report_interval` once a
    /// loss is available, and a last time with progress 1.0 on success. The
    /// first error any worker hits is returned after all workers stop.
    pub fn train(&mut self, mut on_progress: impl FnMut(&Progress)) -> Result<()> {
        let budget = self
            .config
            .epoch
            .checked_mul(self.vocab.ntokens())
            .ok_or_else(|| Error::Config("token budget overflows u64".to_string()))?;
        let shards = if self.config.in_memory {
            let shards = corpus::load_shards(&self.config.input, &self.vocab, self.config.threads)?;
            info!("loaded the corpus into {} shards", shards.len());
            Some(shards)
        } else {
            None
        };

        let run = Run::new(budget, self.config.lr);
        let threads = self.config.threads;
        info!("training on {threads} threads for {budget} tokens");
        let start = Instant::now();

        enter(Phase::Running);
        let this: &Trainer = self;
        thread::scope(|s| {
            let workers = (0..threads)
                .map(|id| {
                    let run = &run;
                    let shards = shards.as_deref();
                    s.spawn(move || {
                        if let Err(err) = this.train_thread(id, run, shards) {
                            run.fail(err);
                        }
                    })
                })
                .collect::<Vec<_>>();

            // Workers only return early on failure or panic.
            while !run.done() && !workers.iter().any(|w| w.is_finished()) {
                thread::sleep(this.config.report_interval);
                if let Some(loss) = run.loss() {
                    on_progress(&run.report(start, threads, loss));
                }
            }

            enter(Phase::Draining);
            for worker in workers {
                if let Err(payload) = worker.join() {
                    panic::resume_unwind(payload);
                }
            }
        });

        let loss = run.loss().unwrap_or(0.0);
        let lr = run.learning_rate();
        if let Some(err) = run.failure.into_inner() {
            enter(Phase::Failed);
            return Err(err);
        }
        self.trained = true;
        enter(Phase::Completed);
        on_progress(&Progress {
            progress: 1.0,
            loss,
            throughput: 0.0,
            learning_rate: lr,
            eta_secs: 0.0,
        });
        info!("training took {:.1}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    fn train_thread(&self, id: usize, run: &Run, shards: Option<&[Vec<Vec<usize>>]>) -> Result<()> {
        let config = &self.config;
        let mut state = State::new(config.dim, config.seed.wrapping_add(id as u64));
        let mut source = match shards {
            Some(shards) => Source::Memory {
                shard: &shards[id % shards.len()],
                next: 0,
            },
            None => {
                let start_line = id as u64 * config.thread_interval;
                debug!("thread {id} starts at line {start_line}");
                let corpus = CorpusReader::open(&config.input, start_line)?;
                Source::Stream {
                    pass: corpus.passes(),
                    corpus,
                    tokens_this_pass: 0,
                }
            }
        };

        let mut lr = config.lr;
        let mut local_tokens: u64 = 0;
        let mut seq = vec![];
        while !run.done() {
            local_tokens += source.next_sequence(&self.vocab, &mut state.rng, &mut seq)?;
            if local_tokens > config.lr_update_rate {
                let progress = run.add_tokens(local_tokens);
                local_tokens = 0;
                lr = learning_rate(config.lr, progress);
                if id == 0 {
                    run.publish(state.take_loss(), lr);
                }
            }
            skipgram(&self.model, &self.vocab, config.window, &seq, lr, &mut state)?;
        }
        if id == 0 {
            run.publish(state.take_loss(), lr);
        }
        debug!("thread {id} finished");
        Ok(())
    }

    fn ensure_trained(&self) -> Result<()> {
        if self.trained {
            Ok(())
        } else {
            Err(Error::NotTrained)
        }
    }

    /// Writes the raw input and output rows, which a later run can blend in.
    pub fn save_model(&self, dir: &Path) -> Result<()> {
        self.ensure_trained()?;
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let input = &self.model.input;
        let output = &self.model.output;
        write_vectors(
            &dir.join(checkpoint::OUTPUT_TRACK_FILE),
            EntityKind::Track,
            self.vocab.tracks().iter().map(|t| (t.id(), output.row(t.index()))),
        )?;
        write_vectors(
            &dir.join(checkpoint::INPUT_TRACK_FILE),
            EntityKind::Track,
            self.vocab.tracks().iter().map(|t| (t.id(), input.row(t.index()))),
        )?;
        write_vectors(
            &dir.join(checkpoint::INPUT_ARTIST_FILE),
            EntityKind::Artist,
            self.vocab.artists().iter().map(|a| (a.id(), input.row(a.index()))),
        )?;
        write_vectors(
            &dir.join(checkpoint::INPUT_GENRE_FILE),
            EntityKind::Genre,
            self.vocab.genres().iter().map(|g| (g.id(), input.row(g.index()))),
        )
    }

    /// Writes the final embeddings. A track's vector is the average of its
    /// composed input vector and its output row.
    pub fn save_vectors(&self, dir: &Path) -> Result<()> {
        self.ensure_trained()?;
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        let model = &self.model;
        let mut hidden = vec![0.0; model.dim()];
        write_vectors(
            &dir.join(checkpoint::TRACK_VEC_FILE),
            EntityKind::Track,
            self.vocab.tracks().iter().map(|t| {
                model.compute_hidden(t, &mut hidden);
                (t.id(), vector::average(&hidden, &model.output.row(t.index())))
            }),
        )?;
        write_vectors(
            &dir.join(checkpoint::ARTIST_VEC_FILE),
            EntityKind::Artist,
            self.vocab.artists().iter().map(|a| (a.id(), model.input.row(a.index()))),
        )?;
        write_vectors(
            &dir.join(checkpoint::GENRE_VEC_FILE),
            EntityKind::Genre,
            self.vocab.genres().iter().map(|g| (g.id(), model.input.row(g.index()))),
        )
    }
}

/// Adds checkpointed rows from `config.output_dir` to a fresh model. Tracks
/// that received an input vector train at `pretrained_lr` from then on.
fn load_pretrained(config: &TrainConfig, vocab: &mut Vocab, model: &Model) -> Result<()> {
    let dir = &config.output_dir;
    blend_vectors(
        &dir.join(checkpoint::INPUT_GENRE_FILE),
        EntityKind::Genre,
        &model.input,
        |id| vocab.genres().index_of(id),
    )?;
    blend_vectors(
        &dir.join(checkpoint::INPUT_ARTIST_FILE),
        EntityKind::Artist,
        &model.input,
        |id| vocab.artists().index_of(id),
    )?;
    let tracks = blend_vectors(
        &dir.join(checkpoint::INPUT_TRACK_FILE),
        EntityKind::Track,
        &model.input,
        |id| vocab.tracks().index_of(id),
    )?;
    blend_vectors(
        &dir.join(checkpoint::OUTPUT_TRACK_FILE),
        EntityKind::Track,
        &model.output,
        |id| vocab.tracks().index_of(id),
    )?;
    for &index in &tracks {
        vocab.set_lr_scale(index, config.pretrained_lr);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::NegativeSamplingLoss;
    use crate::matrix::Matrix;
    use crate::sampling::NegativeTable;
    use crate::vocab::VocabBuilder;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    #[test]
    fn learning_rate_decays_to_a_floor() {
        assert_eq!(learning_rate(0.1, 0.0), 0.1);
        assert!((learning_rate(0.1, 0.5) - 0.05).abs() < 1e-12);
        assert_eq!(learning_rate(0.1, 1.0), MIN_LEARNING_RATE);
        assert_eq!(learning_rate(0.1, 0.995), MIN_LEARNING_RATE);
    }

    #[test]
    fn report_before_any_progress() {
        let run = Run::new(100, 0.1);
        assert_eq!(run.loss(), None);
        let report = run.report(Instant::now(), 4, 0.7);
        assert_eq!(report.progress, 0.0);
        assert_eq!(report.eta_secs, UNKNOWN_ETA_SECS);
        assert_eq!(report.learning_rate, 0.1);

        assert!((run.add_tokens(25) - 0.25).abs() < 1e-12);
        run.publish(Some(0.3), 0.075);
        assert_eq!(run.loss(), Some(0.3));
        let report = run.report(Instant::now(), 4, 0.3);
        assert!(report.eta_secs >= 0.0 && report.eta_secs < UNKNOWN_ETA_SECS);
        assert_eq!(report.learning_rate, 0.075);
        assert!(!run.done());
        run.add_tokens(80);
        assert!(run.done());
    }

    #[test]
    fn first_failure_wins() {
        let run = Run::new(100, 0.1);
        run.fail(Error::NumericDivergence { row: 1 });
        run.fail(Error::NotTrained);
        assert!(run.done());
        assert!(matches!(
            run.failure.into_inner(),
            Some(Error::NumericDivergence { row: 1 })
        ));
    }

    #[test]
    fn skipgram_trains_each_distinct_context_track() {
        let mut builder = VocabBuilder::new(1.0);
        for id in ["1", "2", "3", "4"] {
            builder.add_track(id, 1, vec![], vec![]).unwrap();
        }
        let vocab = builder.index();
        let input = Matrix::zeros(4, 2).unwrap();
        input.add_vector_to_row(&[1.0, 1.0], 0, 1.0);
        let output = Matrix::zeros(4, 2).unwrap();
        let table = NegativeTable::new(&vocab.track_counts(), 4).unwrap();
        let model = Model::new(input, output, NegativeSamplingLoss::new(0, table));
        let mut state = State::new(2, 9);

        // Window 1 around the center track 0 reaches only track 1 (twice).
        skipgram(&model, &vocab, 1, &[0, 1, 1], 0.5, &mut state).unwrap();
        assert_eq!(model.output.row(2), [0.0, 0.0]);
        assert_eq!(model.output.row(3), [0.0, 0.0]);
        assert!(model.output.row(1)[0] > 0.0);
        // Track 1 is a center too, so its input row took a gradient.
        assert_ne!(model.input.row(1), [0.0, 0.0]);
    }

    fn replay_model(vocab: &Vocab) -> Model {
        let input = Matrix::random(3, 2, 1).unwrap();
        let output = Matrix::random(3, 2, 2).unwrap();
        let table = NegativeTable::new(&vocab.track_counts(), 3).unwrap();
        Model::new(input, output, NegativeSamplingLoss::new(0, table))
    }

    fn rows(m: &Matrix) -> Vec<Vec<real>> {
        (0..m.rows()).map(|i| m.row(i)).collect()
    }

    #[test]
    fn skipgram_visits_context_tracks_in_ascending_order() {
        let mut builder = VocabBuilder::new(1.0);
        for id in ["1", "2", "3"] {
            builder.add_track(id, 1, vec![], vec![]).unwrap();
        }
        let vocab = builder.index();
        let trained = replay_model(&vocab);
        skipgram(&trained, &vocab, 1, &[2, 0, 1], 0.5, &mut State::new(2, 3)).unwrap();

        let replay = |order: [usize; 2]| {
            let model = replay_model(&vocab);
            let mut state = State::new(2, 3);
            let just_0: BTreeSet<usize> = [0].into_iter().collect();
            let both: BTreeSet<usize> = [1, 2].into_iter().collect();
            model.update(vocab.track(2), 0, &just_0, 0.5, &mut state).unwrap();
            for target in order {
                model.update(vocab.track(0), target, &both, 0.5, &mut state).unwrap();
            }
            model.update(vocab.track(1), 0, &just_0, 0.5, &mut state).unwrap();
            model
        };

        let ascending = replay([1, 2]);
        assert_eq!(rows(&trained.input), rows(&ascending.input));
        assert_eq!(rows(&trained.output), rows(&ascending.output));

        let descending = replay([2, 1]);
        assert!(
            rows(&trained.input) != rows(&descending.input)
                || rows(&trained.output) != rows(&descending.output)
        );
    }

    #[test]
    fn memory_source_cycles_through_its_shard() {
        let mut builder = VocabBuilder::new(1.0);
        builder.add_track("1", 1, vec![], vec![]).unwrap();
        builder.add_track("2", 1, vec![], vec![]).unwrap();
        let vocab = builder.index();
        let shard = vec![vec![0, 1], vec![1]];
        let mut source = Source::Memory {
            shard: &shard,
            next: 0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let mut seq = vec![];
        let lens: Vec<u64> = (0..3)
            .map(|_| source.next_sequence(&vocab, &mut rng, &mut seq).unwrap())
            .collect();
        assert_eq!(lens, [2, 1, 2]);
        assert_eq!(seq, [0, 1]);
    }

    fn config_in(dir: &Path, metadata: &str, corpus: &str) -> TrainConfig {
        let input = dir.join("corpus.json");
        let meta = dir.join("meta.json");
        std::fs::write(&input, corpus).unwrap();
        std::fs::write(&meta, metadata).unwrap();
        TrainConfig {
            input,
            metadata: meta,
            output_dir: dir.join("out"),
            dim: 4,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn saving_before_training_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), "{\"track_id\": 1, \"ntoken\": 2}\n", "");
        let trainer = Trainer::new(config).unwrap();
        assert!(matches!(trainer.save_model(dir.path()), Err(Error::NotTrained)));
        assert!(matches!(trainer.save_vectors(dir.path()), Err(Error::NotTrained)));
    }

    #[test]
    fn largest_seed_trains_on_several_threads() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = "{\"track_id\": 1, \"ntoken\": 3}\n{\"track_id\": 2, \"ntoken\": 3}\n";
        let config = TrainConfig {
            seed: u64::MAX,
            threads: 2,
            window: 1,
            epoch: 1,
            sample: 1.0,
            lr_update_rate: 0,
            load_pretrained: false,
            report_interval: Duration::from_millis(5),
            ..config_in(dir.path(), metadata, "{\"t\": [1, 2, 1], \"l\": 3}\n")
        };
        let mut trainer = Trainer::new(config).unwrap();
        trainer.train(|_| {}).unwrap();
    }

    #[test]
    fn token_budget_overflow_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = "{\"track_id\": 1, \"ntoken\": 9223372036854775808}\n";
        let config = TrainConfig {
            epoch: 2,
            load_pretrained: false,
            ..config_in(dir.path(), metadata, "{\"t\": [1], \"l\": 1}\n")
        };
        let mut trainer = Trainer::new(config).unwrap();
        assert!(matches!(trainer.train(|_| {}), Err(Error::Config(_))));
        assert!(matches!(trainer.save_model(dir.path()), Err(Error::NotTrained)));
    }
}
