//! Dataset overview: the first rows, the class balance, message lengths and
//! a plot of all of it.

use camino::Utf8PathBuf;
use clap::Parser;
use owo_colors::OwoColorize;
use snafu::ResultExt;
use sms_spam::{dataset::Dataset, normalize, visualize};

#[derive(Debug, Parser)]
struct Args {
    /// CSV file(s) or directories with them.
    #[arg(default_value = "data/sms.csv")]
    dataset: Vec<Utf8PathBuf>,

    /// Amount of rows to print.
    #[arg(long, default_value_t = 5)]
    head: usize,

    /// Where the plot goes.
    #[arg(long, default_value = "dataset_analysis.png")]
    plot: Utf8PathBuf,
}

#[snafu::report]
fn main() -> Result<(), snafu::Whatever> {
    let Args {
        dataset: paths,
        head,
        plot,
    } = Args::parse();
    training::init_tracing(false);

    let dataset = Dataset::load(&paths).whatever_context("Can't load the dataset")?;
    snafu::ensure_whatever!(!dataset.is_empty(), "The dataset is empty");

    println!("First {} messages:", head.min(dataset.len()));
    for entry in dataset.entries.iter().take(head) {
        let class = if entry.message.is_spam {
            "spam".red().to_string()
        } else {
            "normal".green().to_string()
        };
        println!(
            "{}:{} [{class}] {}",
            dataset.source_path(entry.source),
            entry.row,
            entry.message.text
        );
        println!("    normalized: {}", normalize(&entry.message.text));
    }

    let stats = dataset.stats();
    println!();
    println!("Messages: {}", stats.total());
    println!("Normal: {}", stats.ham);
    println!("Spam: {} ({:.2}%)", stats.spam, stats.spam_ratio() * 100.);
    if let Some(lengths) = stats.length_summary() {
        println!("Length (characters): {lengths}");
    }
    if let Some(words) = stats.word_count_summary() {
        println!("Words: {words}");
    }

    visualize::plot_dataset(&stats, &plot).whatever_context("Can't plot the dataset")?;
    println!("Plot saved to {plot}");
    Ok(())
}
