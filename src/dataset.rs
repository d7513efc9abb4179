//! Dataset loader.
//!
//! A dataset is one or more CSV files with a `Message` column holding the SMS
//! text and a `spam` column holding `1` for spam and `0` for normal messages.

use camino::{Utf8Path, Utf8PathBuf};
use rand::{seq::SliceRandom, SeedableRng};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::LabeledMessage;

/// A dataset that combines multiple CSV files.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Files the entries were loaded from.
    pub sources: Vec<Utf8PathBuf>,
    /// Flat entries.
    pub entries: Vec<DataEntry>,
}

/// Data source identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SourceId(usize);

/// A single data entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    /// A link to the source file.
    pub source: SourceId,
    /// One-based record number in the source file, the header excluded.
    pub row: u64,
    /// The actual entry.
    pub message: LabeledMessage,
}

/// Unable to load a dataset.
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// Unable to open a CSV file.
    #[snafu(display("Unable to open the CSV file at {path}"))]
    OpenCsv {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: csv::Error,
    },
    /// A record can't be parsed.
    #[snafu(display("Malformed record in {path}"))]
    ReadRecord {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: csv::Error,
    },
    /// Unable to traverse a directory.
    #[snafu(display("Unable to traverse {path}"))]
    WalkDirectory {
        /// Path to the directory.
        path: Utf8PathBuf,
        /// Source error.
        source: walkdir::Error,
    },
    /// A path is not a valid UTF-8.
    #[snafu(display("Non-unicode file path {}", path.display()))]
    NonUnicodePath {
        /// The path.
        path: std::path::PathBuf,
    },
}

#[derive(Debug, serde::Deserialize)]
struct CsvRecord {
    #[serde(rename = "Message", alias = "message")]
    message: String,
    #[serde(rename = "spam", alias = "Spam", deserialize_with = "parse_flag")]
    spam: bool,
}

/// Accepts `0`/`1` as well as `true`/`false`.
fn parse_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = <String as serde::Deserialize>::deserialize(deserializer)?;
    match value.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other if other.eq_ignore_ascii_case("true") => Ok(true),
        other if other.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(<D::Error as serde::de::Error>::custom(format!(
            "expected 0 or 1, got {other:?}"
        ))),
    }
}

impl Dataset {
    /// Loads every provided path. Directories are traversed recursively and
    /// every `*.csv` file inside is loaded.
    pub fn load<I, P>(paths: I) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Utf8Path>,
    {
        let mut dataset = Self::default();
        for path in paths {
            let path = path.as_ref();
            if path.is_dir() {
                let mut files = Vec::new();
                for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
                    let entry = entry.context(WalkDirectorySnafu { path })?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let file = Utf8Path::from_path(entry.path()).context(NonUnicodePathSnafu {
                        path: entry.path(),
                    })?;
                    if file.extension() == Some("csv") {
                        files.push(file.to_owned());
                    }
                }
                for file in files {
                    dataset.append_csv(&file)?;
                }
            } else {
                dataset.append_csv(path)?;
            }
        }
        Ok(dataset)
    }

    /// Loads a single CSV file.
    pub fn load_csv<P>(path: P) -> Result<Self, LoadError>
    where
        P: AsRef<Utf8Path>,
    {
        let mut dataset = Self::default();
        dataset.append_csv(path.as_ref())?;
        Ok(dataset)
    }

    fn append_csv(&mut self, path: &Utf8Path) -> Result<(), LoadError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .context(OpenCsvSnafu { path })?;
        let source = self.add_source(path.to_owned());

        let before = self.entries.len();
        for (row, record) in (1..).zip(reader.deserialize::<CsvRecord>()) {
            let record = record.context(ReadRecordSnafu { path })?;
            self.entries.push(DataEntry {
                source,
                row,
                message: LabeledMessage {
                    text: record.message,
                    is_spam: record.spam,
                },
            });
        }
        tracing::debug!(%path, records = self.entries.len() - before, "CSV loaded");
        Ok(())
    }

    /// Adds a source to the data set and returns its identifier.
    pub fn add_source(&mut self, path: Utf8PathBuf) -> SourceId {
        let id = SourceId(self.sources.len());
        self.sources.push(path);
        id
    }

    /// Returns a path to the given source.
    ///
    /// # Panics
    ///
    /// Will panic if source identifier is out of range.
    pub fn source_path(&self, source_id: SourceId) -> &Utf8Path {
        self.sources
            .get(source_id.0)
            .expect("Source identifier out of range")
    }

    /// Returns the underlying tagged sentences.
    pub fn tagged_sentences(&self) -> impl ExactSizeIterator<Item = (&str, bool)> {
        self.entries
            .iter()
            .map(|entry| (entry.message.text.as_str(), entry.message.is_spam))
    }

    /// Returns the amount of entries in the dataset.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the dataset contains no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The amount of spam messages.
    pub fn spam_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.message.is_spam)
            .count()
    }

    /// The amount of normal messages.
    pub fn ham_count(&self) -> usize {
        self.len() - self.spam_count()
    }

    /// Randomly splits the dataset into the train and the test parts.
    ///
    /// The test part receives `ceil(len * test_portion)` entries. The split
    /// depends only on the seed and the order of the entries.
    pub fn split(&self, test_portion: f64, seed: u64) -> (Dataset, Dataset) {
        let mut order = (0..self.entries.len()).collect::<Vec<_>>();
        let mut rng = rand_xoshiro::Xoshiro256Plus::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let test_len = (self.entries.len() as f64 * test_portion.clamp(0., 1.)).ceil() as usize;
        let test_len = test_len.min(self.entries.len());
        let (test, train) = order.split_at(test_len);

        let pick = |indices: &[usize]| Dataset {
            sources: self.sources.clone(),
            entries: indices
                .iter()
                .map(|&index| self.entries[index].clone())
                .collect(),
        };
        (pick(train), pick(test))
    }

    /// Computes length statistics.
    pub fn stats(&self) -> DatasetStats {
        let mut stats = DatasetStats::default();
        for entry in &self.entries {
            let text = &entry.message.text;
            stats.lengths.push(text.chars().count());
            stats.word_counts.push(text.split_whitespace().count());
            if entry.message.is_spam {
                stats.spam += 1;
            } else {
                stats.ham += 1;
            }
        }
        stats
    }
}

/// Class counts and per-message lengths.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DatasetStats {
    /// The amount of spam messages.
    pub spam: usize,
    /// The amount of normal messages.
    pub ham: usize,
    /// Length of every message in characters.
    pub lengths: Vec<usize>,
    /// Amount of words in every message.
    pub word_counts: Vec<usize>,
}

/// Minimum, maximum and mean of a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Minimum value.
    pub min: usize,
    /// Maximum value.
    pub max: usize,
    /// Arithmetic mean.
    pub mean: f64,
}

impl DatasetStats {
    /// Total amount of messages.
    pub fn total(&self) -> usize {
        self.spam + self.ham
    }

    /// Share of spam messages, `0` for an empty dataset.
    pub fn spam_ratio(&self) -> f64 {
        if self.total() == 0 {
            0.
        } else {
            self.spam as f64 / self.total() as f64
        }
    }

    /// Summary of the message lengths.
    pub fn length_summary(&self) -> Option<Summary> {
        summarize(&self.lengths)
    }

    /// Summary of the word counts.
    pub fn word_count_summary(&self) -> Option<Summary> {
        summarize(&self.word_counts)
    }
}

fn summarize(values: &[usize]) -> Option<Summary> {
    use itertools::{Itertools, MinMaxResult};

    let (min, max) = match values.iter().copied().minmax() {
        MinMaxResult::NoElements => return None,
        MinMaxResult::OneElement(value) => (value, value),
        MinMaxResult::MinMax(min, max) => (min, max),
    };
    let mean = values.iter().sum::<usize>() as f64 / values.len() as f64;
    Some(Summary { min, max, mean })
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "min {}, max {}, mean {:.2}", self.min, self.max, self.mean)
    }
}
