use std::io::{BufRead, Write};

use camino::Utf8PathBuf;
use clap::Parser;
use owo_colors::{AnsiColors, OwoColorize};
use snafu::ResultExt;
use sms_spam::{PredictError, SpamService, Verdict};
use training::{ArtifactsArgs, SAMPLE_MESSAGES};

#[global_allocator]
static ALLOCATOR: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Tries the trained model on messages.
///
/// Without messages an interactive menu is shown.
#[derive(Parser)]
struct Args {
    #[command(flatten)]
    artifacts: ArtifactsArgs,

    /// File with line-separated messages.
    #[arg(long)]
    file: Option<Utf8PathBuf>,

    /// Classify the built-in sample messages and exit.
    #[arg(long)]
    samples: bool,

    /// Messages to classify.
    message: Vec<String>,
}

fn main() -> snafu::Report<snafu::Whatever> {
    snafu::Report::capture(run)
}

fn run() -> Result<(), snafu::Whatever> {
    let Args {
        artifacts,
        file,
        samples,
        message: mut messages,
    } = Args::parse();
    training::init_tracing(false);

    let model = artifacts
        .model_artifacts()
        .load(artifacts.truncation, artifacts.device())
        .whatever_context("Can't load the model")?;
    let service = SpamService::new(model);

    if let Some(file) = file {
        let reader = std::io::BufReader::new(
            std::fs::File::open(&file).whatever_context("Can't open the file with messages")?,
        );
        for line in reader.lines() {
            let line = line.whatever_context("Can't read a message")?;
            let line = line.trim();
            if !line.is_empty() {
                messages.push(line.to_owned());
            }
        }
    }
    if samples {
        messages.extend(SAMPLE_MESSAGES.iter().map(|&s| s.to_owned()));
    }

    if !messages.is_empty() {
        for message in &messages {
            print_prediction(&service, message);
        }
        return Ok(());
    }

    menu(&service)
}

fn menu(service: &SpamService) -> Result<(), snafu::Whatever> {
    println!("1. Interactive test");
    println!("2. Test sample messages");
    let choice = prompt("Choice (1/2): ")?.unwrap_or_default();
    match choice.trim() {
        "1" => interactive(service),
        "2" => {
            for message in SAMPLE_MESSAGES {
                print_prediction(service, message);
            }
            Ok(())
        }
        other => snafu::whatever!("Unknown choice {other:?}"),
    }
}

/// Reads messages until `q` or the end of input.
fn interactive(service: &SpamService) -> Result<(), snafu::Whatever> {
    println!("Type a message, 'q' to quit.");
    while let Some(line) = prompt("> ")? {
        let message = line.trim();
        if message.eq_ignore_ascii_case("q") {
            break;
        }
        if message.is_empty() {
            println!("Please enter a message!");
            continue;
        }
        print_prediction(service, message);
    }
    Ok(())
}

/// Prints the prompt and reads a line. `None` on the end of input.
fn prompt(text: &str) -> Result<Option<String>, snafu::Whatever> {
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{text}").whatever_context("Can't write to stdout")?;
    stdout.flush().whatever_context("Can't write to stdout")?;

    let mut line = String::new();
    let read = std::io::stdin()
        .read_line(&mut line)
        .whatever_context("Can't read from stdin")?;
    Ok((read != 0).then_some(line))
}

fn print_prediction(service: &SpamService, message: &str) {
    match service.predict(message) {
        Ok(verdict) => println!("{}", Prediction { message, verdict }),
        Err(error @ PredictError::EmptyMessage) => println!("{message:?}: {error}"),
        Err(error) => println!("{message:?}: {}", snafu::Report::from_error(error)),
    }
}

struct Prediction<'a> {
    message: &'a str,
    verdict: Verdict,
}

impl std::fmt::Display for Prediction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let color = if self.verdict.is_spam {
            AnsiColors::Red
        } else {
            AnsiColors::Green
        };
        writeln!(f, "Message: {}", self.message)?;
        writeln!(f, "Prediction: {}", self.verdict.label().color(color))?;
        writeln!(f, "Confidence: {:.2}%", self.verdict.confidence() * 100.)?;
        write!(f, "Raw score: {:.4}", self.verdict.probability)
    }
}
