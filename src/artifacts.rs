//! Files a trained model consists of.

use camino::{Utf8Path, Utf8PathBuf};
use snafu::{ensure, ResultExt, Snafu};

use crate::{
    classifier::{self, LstmClassifier, ModelConfig, SpamClassifier, TchClassifier},
    tokenizer::{SequenceEncoder, Truncation},
    vocabulary::{self, Vocabulary},
};

/// Trained weights.
pub const WEIGHTS_FILE: &str = "spam_model.safetensors";
/// Half-precision weights for the mobile client.
pub const MOBILE_WEIGHTS_FILE: &str = "spam_model.f16.safetensors";
/// Model hyper-parameters, see [`ModelConfig`].
pub const CONFIG_FILE: &str = "spam_model.json";
/// The fitted vocabulary in the tokenizer JSON format.
pub const VOCABULARY_FILE: &str = "tokenizer.json";
/// Description of a mobile export.
pub const MANIFEST_FILE: &str = "manifest.json";

/// A directory with a trained model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    dir: Utf8PathBuf,
}

/// A directory with a model exported for the mobile client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MobileArtifacts {
    dir: Utf8PathBuf,
}

/// Everything the inference needs.
pub struct LoadedModel {
    /// Text to ids.
    pub encoder: SequenceEncoder,
    /// Ids to a probability.
    pub classifier: Box<dyn SpamClassifier>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("max_len", &self.encoder.max_len())
            .field("vocabulary", &self.encoder.vocabulary().len())
            .finish_non_exhaustive()
    }
}

/// Unable to load the artifacts.
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// Unable to read the model configuration.
    #[snafu(display("Unable to read the model configuration at {path}"))]
    ReadConfig {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
    /// The model configuration is malformed.
    #[snafu(display("Malformed model configuration at {path}"))]
    ParseConfig {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: serde_json::Error,
    },
    /// Unable to load the vocabulary.
    #[snafu(display("Unable to load the vocabulary from {path}"))]
    Vocabulary {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: vocabulary::LoadError,
    },
    /// The weights and the vocabulary were produced by different runs.
    #[snafu(display(
        "The model expects {expected} embedding rows, the vocabulary provides {actual}"
    ))]
    VocabularyMismatch {
        /// Rows in the model configuration.
        expected: i64,
        /// Rows the vocabulary needs.
        actual: usize,
    },
    /// Unable to load the weights.
    #[snafu(context(false), display("Unable to load the classifier"))]
    Classifier {
        /// Source error.
        source: classifier::LoadError,
    },
    /// Unable to read the manifest.
    #[snafu(display("Unable to read the manifest at {path}"))]
    Manifest {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
    /// The manifest is malformed.
    #[snafu(display("Malformed manifest at {path}"))]
    ParseManifest {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: serde_json::Error,
    },
}

/// Unable to save the artifacts.
#[derive(Debug, Snafu)]
pub enum SaveError {
    /// Unable to create the output directory.
    #[snafu(display("Unable to create the directory {path}"))]
    CreateDir {
        /// The directory.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
    /// Unable to create a temporary file next to the destination.
    #[snafu(display("Can't create a temporary file in {path}"))]
    TempFile {
        /// The directory.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
    /// Unable to write the data.
    #[snafu(display("Can't write {path}"))]
    Write {
        /// The destination.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
    /// Unable to serialize the data.
    #[snafu(display("Can't serialize {path}"))]
    Serialize {
        /// The destination.
        path: Utf8PathBuf,
        /// Source error.
        source: serde_json::Error,
    },
    /// Torch can't save the weights.
    #[snafu(display("Can't save weights to {path}"))]
    Weights {
        /// The destination.
        path: Utf8PathBuf,
        /// Source error.
        source: tch::TchError,
    },
    /// Unable to move the temporary file in place.
    #[snafu(display("Can't persist {path}"))]
    Persist {
        /// The destination.
        path: Utf8PathBuf,
        /// Source error.
        source: tempfile::PersistError,
    },
}

/// Unable to export a model.
#[derive(Debug, Snafu)]
pub enum ExportError {
    /// Unable to load the source model.
    #[snafu(display("Unable to load the source model"))]
    LoadSource {
        /// Source error.
        source: LoadError,
    },
    /// Unable to write the export.
    #[snafu(context(false), display("Unable to write the export"))]
    SaveExport {
        /// Source error.
        source: SaveError,
    },
}

/// Describes an exported model.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    /// When the export was made.
    #[serde(with = "time::serde::timestamp")]
    pub created: time::OffsetDateTime,
    /// Precision of the stored weights.
    pub precision: String,
    /// Length of the encoded sequences.
    pub max_len: usize,
    /// Rows of the embedding table.
    pub vocab_size: i64,
    /// Weights file name.
    pub weights: String,
    /// Model configuration file name.
    pub config: String,
    /// Vocabulary file name.
    pub vocabulary: String,
}

/// Writes a file through a temporary file in the same directory so that
/// readers never see a partially written file.
fn write_atomically<F>(path: &Utf8Path, write: F) -> Result<(), SaveError>
where
    F: FnOnce(&std::path::Path) -> Result<(), SaveError>,
{
    let directory = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let suffix = path.extension().map(|ext| format!(".{ext}")).unwrap_or_default();
    let temp = tempfile::Builder::new()
        .suffix(&suffix)
        .tempfile_in(directory)
        .context(TempFileSnafu { path: directory })?;
    write(temp.path())?;
    temp.persist(path).context(PersistSnafu { path })?;
    Ok(())
}

/// Serializes the value as pretty JSON atomically.
fn write_json<T: serde::Serialize>(path: &Utf8Path, value: &T) -> Result<(), SaveError> {
    let data = serde_json::to_vec_pretty(value).context(SerializeSnafu { path })?;
    write_atomically(path, |temp| std::fs::write(temp, &data).context(WriteSnafu { path }))
}

fn write_vocabulary(path: &Utf8Path, vocabulary: &Vocabulary) -> Result<(), SaveError> {
    let data = vocabulary.to_json().context(SerializeSnafu { path })?;
    write_atomically(path, |temp| std::fs::write(temp, data.as_bytes()).context(WriteSnafu { path }))
}

fn read_config(path: &Utf8Path) -> Result<ModelConfig, LoadError> {
    let data = std::fs::read_to_string(path).context(ReadConfigSnafu { path })?;
    serde_json::from_str(&data).context(ParseConfigSnafu { path })
}

/// Loads the configuration, the vocabulary and the weights and checks they
/// fit each other.
fn load_model(
    config: &Utf8Path,
    vocabulary: &Utf8Path,
    weights: &Utf8Path,
    truncation: Truncation,
    device: tch::Device,
) -> Result<LoadedModel, LoadError> {
    let config = read_config(config)?;
    let vocabulary = Vocabulary::load(vocabulary).context(VocabularySnafu { path: vocabulary })?;
    ensure!(
        usize::try_from(config.vocab_size).ok() == Some(vocabulary.embedding_rows()),
        VocabularyMismatchSnafu {
            expected: config.vocab_size,
            actual: vocabulary.embedding_rows(),
        }
    );
    let classifier = TchClassifier::load(config, weights, device)?;
    tracing::info!(
        max_len = config.max_len,
        vocabulary = vocabulary.len(),
        %weights,
        "Model loaded"
    );
    Ok(LoadedModel {
        encoder: SequenceEncoder::new(vocabulary, config.max_len, truncation),
        classifier: Box::new(classifier),
    })
}

impl ModelArtifacts {
    /// Artifacts in the given directory.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Path to the weights.
    pub fn weights(&self) -> Utf8PathBuf {
        self.dir.join(WEIGHTS_FILE)
    }

    /// Path to the model configuration.
    pub fn config(&self) -> Utf8PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Path to the vocabulary.
    pub fn vocabulary(&self) -> Utf8PathBuf {
        self.dir.join(VOCABULARY_FILE)
    }

    /// Creates the directory if it doesn't exist.
    pub fn create_dir(&self) -> Result<(), SaveError> {
        std::fs::create_dir_all(&self.dir).context(CreateDirSnafu { path: &self.dir })
    }

    /// Loads the model for inference.
    pub fn load(&self, truncation: Truncation, device: tch::Device) -> Result<LoadedModel, LoadError> {
        load_model(
            &self.config(),
            &self.vocabulary(),
            &self.weights(),
            truncation,
            device,
        )
    }

    /// Reads the model configuration only.
    pub fn load_config(&self) -> Result<ModelConfig, LoadError> {
        read_config(&self.config())
    }

    /// Reads the vocabulary only.
    pub fn load_vocabulary(&self) -> Result<Vocabulary, LoadError> {
        let path = self.vocabulary();
        Vocabulary::load(&path).context(VocabularySnafu { path })
    }

    /// Saves the model configuration.
    pub fn save_config(&self, config: &ModelConfig) -> Result<(), SaveError> {
        write_json(&self.config(), config)
    }

    /// Saves the vocabulary.
    pub fn save_vocabulary(&self, vocabulary: &Vocabulary) -> Result<(), SaveError> {
        write_vocabulary(&self.vocabulary(), vocabulary)
    }

    /// Saves the weights to the default location.
    pub fn save_weights(&self, var_store: &tch::nn::VarStore) -> Result<(), SaveError> {
        save_weights(var_store, &self.weights())
    }
}

/// Atomically saves the weights to the path. The format is picked by the
/// extension, use `.safetensors`.
pub fn save_weights(var_store: &tch::nn::VarStore, path: &Utf8Path) -> Result<(), SaveError> {
    write_atomically(path, |temp| var_store.save(temp).context(WeightsSnafu { path }))?;
    tracing::debug!(%path, "Weights saved");
    Ok(())
}

impl MobileArtifacts {
    /// Artifacts in the given directory.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Path to the half-precision weights.
    pub fn weights(&self) -> Utf8PathBuf {
        self.dir.join(MOBILE_WEIGHTS_FILE)
    }

    /// Path to the model configuration.
    pub fn config(&self) -> Utf8PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Path to the vocabulary.
    pub fn vocabulary(&self) -> Utf8PathBuf {
        self.dir.join(VOCABULARY_FILE)
    }

    /// Path to the manifest.
    pub fn manifest(&self) -> Utf8PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Converts a trained model into the mobile set and returns the written
    /// manifest.
    pub fn export_from(&self, source: &ModelArtifacts) -> Result<Manifest, ExportError> {
        let config = source.load_config().context(LoadSourceSnafu)?;
        let vocabulary = source.load_vocabulary().context(LoadSourceSnafu)?;
        config
            .validate()
            .map_err(classifier::LoadError::from)
            .map_err(LoadError::from)
            .context(LoadSourceSnafu)?;

        let mut var_store = tch::nn::VarStore::new(tch::Device::Cpu);
        let _model = LstmClassifier::new(&var_store.root(), &config);
        var_store
            .load(source.weights())
            .map_err(|error| classifier::LoadError::Weights {
                path: source.weights(),
                source: error,
            })
            .map_err(LoadError::from)
            .context(LoadSourceSnafu)?;
        var_store.half();

        std::fs::create_dir_all(&self.dir).context(CreateDirSnafu { path: &self.dir })?;
        save_weights(&var_store, &self.weights())?;
        write_json(&self.config(), &config)?;
        write_vocabulary(&self.vocabulary(), &vocabulary)?;

        let manifest = Manifest {
            created: time::OffsetDateTime::now_utc(),
            precision: "f16".into(),
            max_len: config.max_len,
            vocab_size: config.vocab_size,
            weights: MOBILE_WEIGHTS_FILE.into(),
            config: CONFIG_FILE.into(),
            vocabulary: VOCABULARY_FILE.into(),
        };
        write_json(&self.manifest(), &manifest)?;
        tracing::info!(dir = %self.dir, "Mobile export written");
        Ok(manifest)
    }

    /// Reads the manifest.
    pub fn load_manifest(&self) -> Result<Manifest, LoadError> {
        let path = self.manifest();
        let data = std::fs::read_to_string(&path).context(ManifestSnafu { path: &path })?;
        serde_json::from_str(&data).context(ParseManifestSnafu { path })
    }

    /// Loads the exported model, converting the weights back to f32.
    pub fn load(&self, truncation: Truncation, device: tch::Device) -> Result<LoadedModel, LoadError> {
        load_model(
            &self.config(),
            &self.vocabulary(),
            &self.weights(),
            truncation,
            device,
        )
    }
}
