//! Shared pieces of the offline tools.

use camino::Utf8PathBuf;
use serde::Deserialize;
use sms_spam::{optimizer::OptimizerConfiguration, tch, ModelArtifacts, Truncation};

/// Messages every tool can be tried on.
pub const SAMPLE_MESSAGES: [&str; 8] = [
    "Merhaba nasılsın? Bugün buluşalım mı?",
    "TEBRİKLER! 1000 TL kazandınız! Hemen tıklayın!",
    "Toplantı yarın saat 14:00'da başlayacak",
    "ACIL! Kredi kartı bilgilerinizi güncelleyin",
    "Akşam yemeğine gelir misin?",
    "Vodafone'dan size özel %70 indirim!",
    "Doktor randevunuz yarın saat 10:00",
    "ŞOK FİYAT! Sadece bugün geçerli kampanya!",
];

/// Training configuration.
#[derive(Debug, Deserialize)]
pub struct TrainConfig {
    /// Dataset section.
    pub data: DataConfig,

    /// Model hyper-parameters.
    #[serde(default)]
    pub model: ModelSection,

    /// Learning rate configuration section.
    #[serde(default)]
    pub lr: OptimizerConfiguration,

    /// Verification config.
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Miscellaneous config.
    #[serde(default)]
    pub misc: MiscConfig,
}

/// Where the messages come from and how they are split.
#[derive(Debug, Deserialize)]
pub struct DataConfig {
    /// CSV file(s) or directories with CSV files.
    #[serde(deserialize_with = "parse::parse_one_or_many", alias = "datasets")]
    pub dataset: Vec<Utf8PathBuf>,

    /// Portion of the messages held out for validation.
    #[serde(default = "defaults::test_portion")]
    pub test_portion: f64,

    /// Seed of the train/test split.
    #[serde(default = "defaults::split_seed")]
    pub seed: u64,
}

/// Model hyper-parameters.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Size of a word embedding.
    pub embedding_dim: i64,
    /// Hidden size of each LSTM direction.
    pub lstm_hidden: i64,
    /// Units of the hidden dense layer.
    pub dense_units: i64,
    /// Fixed sequence length. The longest training message is used when
    /// absent.
    pub max_len: Option<usize>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            embedding_dim: 16,
            lstm_hidden: 64,
            dense_units: 64,
            max_len: None,
        }
    }
}

/// Verification configuration.
#[derive(Debug, Deserialize)]
pub struct VerificationConfig {
    /// Samples to verify each epoch.
    pub samples: Vec<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            samples: SAMPLE_MESSAGES.iter().map(|&s| s.to_owned()).collect(),
        }
    }
}

/// Miscellaneous training parameters.
#[derive(Debug, Default, Deserialize)]
pub struct MiscConfig {
    /// When set, only this portion of the training set is selected on each
    /// epoch.
    ///
    /// The actual items are selected randomly each epoch.
    #[serde(default)]
    pub portion: Option<f32>,

    /// Weight the spam class by the ham to spam ratio.
    #[serde(default)]
    pub balance_classes: bool,
}

mod defaults {
    pub const fn test_portion() -> f64 {
        0.2
    }

    pub const fn split_seed() -> u64 {
        42
    }
}

mod parse {
    use serde::{Deserialize, Deserializer};

    pub fn parse_one_or_many<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum OneOrMany<T> {
            One(T),
            Many(Vec<T>),
        }
        Ok(match OneOrMany::deserialize(d)? {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        })
    }
}

/// Parses `pre` or `post`.
pub fn parse_truncation(value: &str) -> Result<Truncation, String> {
    match value {
        "pre" => Ok(Truncation::Pre),
        "post" => Ok(Truncation::Post),
        other => Err(format!("expected \"pre\" or \"post\", got {other:?}")),
    }
}

/// Where the trained model lives and how to run it.
#[derive(Debug, clap::Args)]
pub struct ArtifactsArgs {
    /// Directory with the trained model.
    #[arg(long, default_value = "data", env = "SPAM_ARTIFACTS")]
    pub artifacts: Utf8PathBuf,

    /// Which end of long messages is cut off: `pre` or `post`.
    #[arg(long, default_value = "pre", value_parser = parse_truncation)]
    pub truncation: Truncation,

    /// CUDA device index. CPU is used when absent.
    #[arg(long)]
    pub cuda: Option<usize>,
}

impl ArtifactsArgs {
    /// The artifacts.
    pub fn model_artifacts(&self) -> ModelArtifacts {
        ModelArtifacts::new(self.artifacts.clone())
    }

    /// The torch device.
    pub fn device(&self) -> tch::Device {
        self.cuda.map_or(tch::Device::Cpu, tch::Device::Cuda)
    }
}

/// Installs the log subscriber. `RUST_LOG` wins unless `verbose` is set.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config() {
        let config: TrainConfig = toml::from_str(
            r#"
[data]
dataset = "data/sms.csv"
"#,
        )
        .unwrap();
        assert_eq!(config.data.dataset, vec![Utf8PathBuf::from("data/sms.csv")]);
        assert_eq!(config.data.test_portion, 0.2);
        assert_eq!(config.data.seed, 42);
        assert_eq!(config.model.embedding_dim, 16);
        assert_eq!(config.model.max_len, None);
        assert_eq!(config.verification.samples.len(), SAMPLE_MESSAGES.len());
        assert!(config.misc.portion.is_none());
    }

    #[test]
    fn full_config() {
        let config: TrainConfig = toml::from_str(
            r#"
[data]
datasets = ["a.csv", "more"]
test_portion = 0.1
seed = 7

[model]
lstm_hidden = 32
max_len = 51

[lr]
warmup = 1e-5
warmup_period = 0.1

[lr.inter_epoch.exponent_decrease]
base = 1e-3
factor = 2
min = 1e-5

[lr.within_epoch.cosine_annealing]
restarts = 0
factor = 10

[verification]
samples = ["Merhaba"]

[misc]
portion = 0.5
balance_classes = true
"#,
        )
        .unwrap();
        assert_eq!(config.data.dataset.len(), 2);
        assert_eq!(config.data.seed, 7);
        assert_eq!(config.model.lstm_hidden, 32);
        assert_eq!(config.model.dense_units, 64);
        assert_eq!(config.model.max_len, Some(51));
        assert!(config.lr.validate().is_ok());
        assert_eq!(config.verification.samples, ["Merhaba"]);
        assert!(config.misc.balance_classes);
    }

    #[test]
    fn truncation_values() {
        assert_eq!(parse_truncation("pre"), Ok(Truncation::Pre));
        assert_eq!(parse_truncation("post"), Ok(Truncation::Post));
        assert!(parse_truncation("both").is_err());
    }
}
