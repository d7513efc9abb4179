use std::time::Instant;

use camino::Utf8PathBuf;
use clap::Parser;
use owo_colors::{AnsiColors, OwoColorize};
use rand::{seq::SliceRandom, SeedableRng};
use snafu::ResultExt;
use sms_spam::{
    artifacts::{self, ModelArtifacts},
    classifier::{LstmClassifier, ModelConfig},
    dataset::Dataset,
    normalize,
    optimizer::Optimizer,
    tch::{self, nn::VarStore, Tensor},
    tokenizer::BatchEncoder,
    training_progress::{EpochReportRecorder, Evaluation},
    EncodedSequence, SequenceEncoder, Truncation, Vocabulary,
};
use training::{parse_truncation, MiscConfig, ModelSection, TrainConfig, VerificationConfig};

#[global_allocator]
static ALLOCATOR: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Spam classifier training.
#[derive(Parser)]
struct Args {
    /// Path to the train configuration TOML.
    #[arg(long = "config", default_value = "train.toml")]
    train_config: Utf8PathBuf,

    /// Size of the mini batch, i.e. the amount of messages fed to the neural
    /// network at once.
    #[arg(long = "batch", default_value_t = 32)]
    batch_size: usize,

    /// Accumulate gradients for this amount of mini batches before updating the
    /// weights.
    #[arg(long = "macro-batch", default_value_t = 1)]
    macro_batch: usize,

    /// The amount of training epochs.
    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Manual seed for torch.
    #[arg(long, default_value_t = 0xdeadf00d)]
    seed: i64,

    /// Which end of long messages is cut off: `pre` or `post`.
    #[arg(long, default_value = "pre", value_parser = parse_truncation)]
    truncation: Truncation,

    /// CUDA device index. CPU is used when absent.
    #[arg(long)]
    cuda: Option<usize>,

    /// Output directory. The model, training logs and checkpoints go here.
    #[arg(long, default_value = "data")]
    output: Utf8PathBuf,

    /// Debug logs.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> snafu::Report<snafu::Whatever> {
    snafu::Report::capture(run)
}

type Sample = (EncodedSequence, bool);

fn run() -> Result<(), snafu::Whatever> {
    let Args {
        batch_size,
        macro_batch,
        epochs,
        train_config: train_config_path,
        output: output_dir,
        seed: torch_seed,
        truncation,
        cuda,
        verbose,
    } = Args::parse();
    training::init_tracing(verbose);
    let batch_size = batch_size.max(1);

    tch::manual_seed(torch_seed);
    let mut rng = rand::rngs::SmallRng::seed_from_u64(1337);

    let output = ModelArtifacts::new(output_dir.clone());
    output
        .create_dir()
        .whatever_context("Can't create output directory")?;

    let cfg: TrainConfig = {
        let train_config = std::fs::read_to_string(&train_config_path)
            .whatever_context("Can't read training configuration")?;

        toml::from_str(&train_config).whatever_context("Can't parse training configuration")?
    };
    tracing::debug!(?cfg, "Training configuration");
    std::fs::copy(&train_config_path, output_dir.join("train.toml"))
        .whatever_context("Can't copy configuration file to the output")?;

    let TrainConfig {
        data,
        model: model_section,
        lr,
        verification: VerificationConfig {
            samples: verification_samples,
        },
        misc: MiscConfig {
            portion: training_portion,
            balance_classes,
        },
    } = cfg;

    let dataset = Dataset::load(&data.dataset).whatever_context("Loading the dataset")?;
    snafu::ensure_whatever!(!dataset.is_empty(), "The dataset is empty");
    println!(
        "Dataset: {} normal messages and {} spam messages",
        dataset.ham_count(),
        dataset.spam_count()
    );

    // The vocabulary sees every message, the split only affects training.
    let begin = Instant::now();
    let normalized = dataset
        .tagged_sentences()
        .map(|(text, is_spam)| (normalize(text), is_spam))
        .collect::<Vec<_>>();
    let vocabulary = Vocabulary::fit(normalized.iter().map(|(text, _)| text));
    println!(
        "Vocabulary of {} words fitted in {:?}",
        vocabulary.len(),
        begin.elapsed()
    );

    let max_len = match model_section.max_len {
        Some(max_len) => max_len,
        None => normalized
            .iter()
            .map(|(text, _)| text.split_whitespace().count())
            .max()
            .unwrap_or(0)
            .max(1),
    };
    println!("Sequence length: {max_len}");
    let encoder = SequenceEncoder::new(vocabulary, max_len, truncation);

    let (training_set, test_set) = dataset.split(data.test_portion, data.seed);
    snafu::ensure_whatever!(!training_set.is_empty(), "Training set is empty");
    snafu::ensure_whatever!(!test_set.is_empty(), "Test set is empty");
    let spam_count = training_set.spam_count();
    let ham_count = training_set.ham_count();
    println!(
        "Training set: {ham_count} normal messages and {spam_count} spam messages, \
         test set: {} messages",
        test_set.len()
    );

    let mut tokenized_training = encode(&encoder, batch_size, &training_set);
    let test_data = encode(&encoder, batch_size, &test_set);

    let model_config = build_model_config(&model_section, encoder.vocabulary(), max_len);
    model_config
        .validate()
        .whatever_context("Invalid model configuration")?;
    output
        .save_config(&model_config)
        .whatever_context("Can't save the model configuration")?;
    output
        .save_vocabulary(encoder.vocabulary())
        .whatever_context("Can't save the vocabulary")?;

    let device = cuda.map_or(tch::Device::Cpu, tch::Device::Cuda);
    let var_store = VarStore::new(device);
    let classifier = LstmClassifier::new(&var_store.root(), &model_config);

    let training_items = training_portion
        .map(|portion| {
            let len = tokenized_training.len() as f32 * portion.clamp(0., 1.);
            let len = len.round() as usize;
            len.min(tokenized_training.len())
        })
        .unwrap_or(tokenized_training.len());
    let total_steps = tokenized_training[..training_items]
        .chunks(batch_size)
        .len();

    let mut optimizer = Optimizer::new(&var_store, lr, total_steps, macro_batch)
        .whatever_context("Invalid learning rate configuration")?;

    let pos_weight = (balance_classes && spam_count != 0).then(|| {
        let pos_weight: f64 = ham_count as f64 / spam_count as f64;
        println!("Positive samples weight set to {pos_weight:.3}");
        Tensor::scalar_tensor(pos_weight, (tch::Kind::Float, device))
    });

    let mut best_result = f64::NEG_INFINITY;
    let mut last_summary = None;
    for epoch in 0..epochs {
        let mut epoch_optimizer = optimizer
            .start_epoch()
            .whatever_context("Can't start an epoch")?;
        println!(
            "Epoch #{epoch}, base learning rate = {:.3e}",
            epoch_optimizer.base_learning_rate()
        );

        let mut loss_reporter = LossReporter::new(500, batch_size, training_items);
        let mut progress_info = EpochReportRecorder::new(epoch, training_items);

        tokenized_training.shuffle(&mut rng);

        let begin = Instant::now();
        for batch in tokenized_training[..training_items].chunks(batch_size) {
            let step = classifier
                .train(
                    batch
                        .iter()
                        .map(|(sequence, is_spam)| (sequence.ids(), *is_spam)),
                    pos_weight.as_ref(),
                )
                .whatever_context("Train failed")?;
            let loss = f32::try_from(&step.loss).whatever_context("Loss is not a scalar")?;
            progress_info.record(
                batch.len(),
                step.correct,
                epoch_optimizer.learning_rate(),
                loss,
            );
            loss_reporter.report(loss);
            epoch_optimizer
                .next_mini_batch(&step.loss)
                .whatever_context("Optimizer step failed")?;
        }
        let elapsed = begin.elapsed();
        epoch_optimizer
            .finish()
            .whatever_context("Optimizer step failed")?;
        drop(loss_reporter);

        let evaluation = assess_model(&test_data, batch_size, &classifier)?;
        let accuracy = evaluation.matrix.accuracy();
        let color = if accuracy >= best_result {
            AnsiColors::Green
        } else {
            AnsiColors::Cyan
        };
        println!(
            "Epoch #{epoch} trained in {elapsed:?}, train loss = {:.4}, train accuracy = {:.4}, \
             validation loss = {:.4}, validation accuracy = {}",
            progress_info.avg_loss(),
            progress_info.accuracy(),
            evaluation.loss,
            format_args!("{:.4}", accuracy).color(color),
        );

        let last = output_dir.join("last.safetensors");
        artifacts::save_weights(&var_store, &last).whatever_context("Can't save weights")?;

        if accuracy >= best_result {
            let previous_best = std::mem::replace(&mut best_result, accuracy);
            println!(
                "Epoch #{epoch}. {}: {:.3}%, previous was {:.3}%",
                "This is the best result so far".green(),
                (accuracy * 100.).green(),
                (previous_best.max(0.) * 100.).cyan()
            );
            let best = output_dir.join("best.safetensors");
            std::fs::copy(&last, &best).whatever_context("Can't copy the best model")?;
            tracing::info!(%best, epoch, "Saved the best checkpoint");
        } else {
            println!(
                "Epoch #{epoch}. Best result so far: {:.3}%",
                (best_result * 100.).cyan()
            );
        }

        let verification = predict_samples(&verification_samples, &classifier, &encoder)?;
        let report = progress_info.finalize(evaluation, verification);
        report
            .save(output_dir.join(format!("epoch_{epoch:0>4}.txt")))
            .whatever_context("Can't save report")?;
        report
            .plot(output_dir.join(format!("epoch_{epoch:0>4}.png")))
            .whatever_context("Can't save report plot")?;
        last_summary = Some(report.summary());
    }

    output
        .save_weights(&var_store)
        .whatever_context("Can't save the trained model")?;
    println!("Model saved to {}", output.weights());

    if let Some(summary) = last_summary {
        println!("{summary}");
    }
    Ok(())
}

/// Normalizes and encodes every message of the set.
fn encode(encoder: &SequenceEncoder, batch_size: usize, dataset: &Dataset) -> Vec<Sample> {
    let begin = Instant::now();
    let encoded = BatchEncoder::new(
        encoder,
        batch_size,
        dataset
            .tagged_sentences()
            .map(|(text, is_spam)| (normalize(text), is_spam)),
    )
    .collect_all();
    tracing::debug!(
        messages = encoded.len(),
        elapsed = ?begin.elapsed(),
        "Messages encoded"
    );
    encoded
}

fn build_model_config(section: &ModelSection, vocabulary: &Vocabulary, max_len: usize) -> ModelConfig {
    ModelConfig {
        embedding_dim: section.embedding_dim,
        lstm_hidden: section.lstm_hidden,
        dense_units: section.dense_units,
        ..ModelConfig::new(vocabulary.embedding_rows() as i64, max_len)
    }
}

/// Predicts a probability of being a spam for each of the messages.
fn predict_samples(
    samples: &[String],
    classifier: &LstmClassifier,
    encoder: &SequenceEncoder,
) -> Result<Vec<(String, f32)>, snafu::Whatever> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    let probabilities = classifier
        .predict(samples.iter().map(|sample| encoder.encode(&normalize(sample))))
        .whatever_context("Prediction failed")?;
    Ok(samples.iter().cloned().zip(probabilities).collect())
}

/// Assesses how well the trained model performs on the held out messages.
fn assess_model(
    test_data: &[Sample],
    batch_size: usize,
    classifier: &LstmClassifier,
) -> Result<Evaluation, snafu::Whatever> {
    let _guard = tch::no_grad_guard();
    let begin = Instant::now();

    let bar = indicatif::ProgressBar::new(test_data.len() as u64).with_style(
        indicatif::ProgressStyle::with_template(
            "[{elapsed:>4}/{duration:<4}] {bar:40.cyan/blue} {pos:>7}/{len:7}",
        )
        .whatever_context("Invalid progress bar template")?,
    );

    let mut evaluation = Evaluation::new();
    let mut loss_sum = 0f64;

    for batch in test_data.chunks(batch_size) {
        let assessment = classifier
            .assess(
                batch
                    .iter()
                    .map(|(sequence, is_spam)| (sequence.ids(), *is_spam)),
            )
            .whatever_context("Validation pass failed")?;
        loss_sum += assessment.loss * batch.len() as f64;

        for ((_, is_spam), probability) in batch.iter().zip(assessment.probabilities) {
            evaluation.record(*is_spam, probability);
        }

        bar.inc(batch.len() as u64);
    }
    bar.finish_and_clear();
    evaluation.loss = (loss_sum / test_data.len().max(1) as f64) as f32;
    tracing::debug!(elapsed = ?begin.elapsed(), "Assessment performed");

    Ok(evaluation)
}

/// A helper type to report the running "loss".
struct LossReporter {
    loss_sum: f32,
    loss_counter: usize,
    report_interval: usize,
    batch_size: usize,

    bar: indicatif::ProgressBar,
}

impl LossReporter {
    pub fn new(report_interval: usize, batch_size: usize, total_elements: usize) -> Self {
        let bar = indicatif::ProgressBar::new(total_elements as u64);
        if let Ok(style) = indicatif::ProgressStyle::with_template(
            "[{elapsed:>4}/{duration:<4}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}",
        ) {
            bar.set_style(style);
        }
        Self {
            loss_sum: 0.,
            loss_counter: 0,
            report_interval: report_interval.max(1),
            batch_size,
            bar,
        }
    }

    pub fn report(&mut self, loss: f32) {
        if self.loss_counter * self.batch_size >= self.report_interval {
            let avg_loss = self.loss_sum / self.loss_counter as f32;
            self.bar.inc((self.loss_counter * self.batch_size) as u64);
            self.bar.set_message(format!("Average loss: {avg_loss:.4}"));
            self.loss_sum = 0.;
            self.loss_counter = 0;
        }
        self.loss_sum += loss;
        self.loss_counter += 1;
    }
}

impl Drop for LossReporter {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}
