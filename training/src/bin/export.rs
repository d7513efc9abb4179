//! Converts a trained model into the mobile set.

use camino::Utf8PathBuf;
use clap::Parser;
use snafu::ResultExt;
use sms_spam::{artifacts, MobileArtifacts, SpamService};
use training::{ArtifactsArgs, SAMPLE_MESSAGES};

#[global_allocator]
static ALLOCATOR: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
struct Args {
    #[command(flatten)]
    artifacts: ArtifactsArgs,

    /// Where the mobile set goes.
    #[arg(long, default_value = "data/mobile")]
    output: Utf8PathBuf,

    /// Debug logs.
    #[arg(short, long)]
    verbose: bool,
}

#[snafu::report]
fn main() -> Result<(), snafu::Whatever> {
    let Args {
        artifacts,
        output,
        verbose,
    } = Args::parse();
    training::init_tracing(verbose);

    let source = artifacts.model_artifacts();
    let mobile = MobileArtifacts::new(output);
    let manifest = mobile
        .export_from(&source)
        .whatever_context("Export failed")?;
    println!(
        "Exported {} ({}, max_len = {}, vocab_size = {}) to {}",
        manifest.weights,
        manifest.precision,
        manifest.max_len,
        manifest.vocab_size,
        mobile.dir()
    );
    println!("Vocabulary: {}", mobile.vocabulary());
    println!("Manifest: {}", mobile.manifest());

    // The export is only good if it loads back and still classifies.
    let model = mobile
        .load(artifacts.truncation, artifacts.device())
        .whatever_context("Can't load the exported model back")?;
    let service = SpamService::new(model);
    let sample = SAMPLE_MESSAGES[1];
    let verdict = service
        .predict(sample)
        .whatever_context("The exported model can't classify")?;
    println!(
        "Check: {sample:?} -> {} ({:.4})",
        verdict.label(),
        verdict.probability
    );

    let original = std::fs::metadata(source.weights())
        .whatever_context("Can't read the source weights metadata")?
        .len();
    let exported = std::fs::metadata(mobile.weights())
        .whatever_context("Can't read the exported weights metadata")?
        .len();
    println!(
        "Weights: {} bytes -> {} bytes ({})",
        original,
        exported,
        artifacts::MOBILE_WEIGHTS_FILE
    );
    Ok(())
}
