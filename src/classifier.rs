//! The spam classifier: an embedding, a bidirectional LSTM and two dense
//! layers on top of it.

use parking_lot::Mutex;
use snafu::{ensure, ResultExt, Snafu};
use tch::{
    nn::{self, Module, RNN},
    IndexOp, Tensor,
};

use crate::tokenizer::EncodedSequence;

/// Anything that can tell the probability of a sequence being a spam.
pub trait SpamClassifier: Send + Sync {
    /// Returns the spam probability in `[0, 1]`.
    fn spam_probability(&self, sequence: &EncodedSequence) -> Result<f32, ClassifyError>;
}

/// Classification failure.
#[derive(Debug, Snafu)]
pub enum ClassifyError {
    /// Torch reported an error.
    #[snafu(display("Torch error: {source}"))]
    Tch {
        /// Source error.
        source: tch::TchError,
    },
    /// Nothing to classify.
    #[snafu(display("Empty batch"))]
    EmptyBatch,
    /// The model produced something that is not a probability.
    #[snafu(display("The model produced a non-finite output {value}"))]
    NonFinite {
        /// The output.
        value: f32,
    },
    /// Some other classifier backend failed.
    #[snafu(display("{message}"))]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

/// Hyper-parameters of the model. Stored next to the weights since the
/// weights can't be loaded without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModelConfig {
    /// Rows in the embedding table: the vocabulary size plus the padding row.
    pub vocab_size: i64,
    /// Size of a word embedding.
    #[serde(default = "defaults::embedding_dim")]
    pub embedding_dim: i64,
    /// Hidden size of each LSTM direction.
    #[serde(default = "defaults::lstm_hidden")]
    pub lstm_hidden: i64,
    /// Units of the hidden dense layer.
    #[serde(default = "defaults::dense_units")]
    pub dense_units: i64,
    /// Length of the encoded sequences the model was trained on.
    pub max_len: usize,
}

mod defaults {
    pub fn embedding_dim() -> i64 {
        16
    }

    pub fn lstm_hidden() -> i64 {
        64
    }

    pub fn dense_units() -> i64 {
        64
    }
}

/// Invalid model configuration.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The embedding must contain at least the padding and the OOV rows.
    #[snafu(display("Vocabulary size {vocab_size} is too small"))]
    VocabSize {
        /// The configured size.
        vocab_size: i64,
    },
    /// Sequences can't be empty.
    #[snafu(display("Maximum sequence length must be positive"))]
    ZeroLength,
    /// Layer sizes must be positive.
    #[snafu(display("Layer sizes must be positive"))]
    LayerSize,
}

impl ModelConfig {
    /// Creates a configuration with the default layer sizes.
    pub fn new(vocab_size: i64, max_len: usize) -> Self {
        Self {
            vocab_size,
            embedding_dim: defaults::embedding_dim(),
            lstm_hidden: defaults::lstm_hidden(),
            dense_units: defaults::dense_units(),
            max_len,
        }
    }

    /// Checks the values make sense.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.vocab_size >= 2,
            VocabSizeSnafu {
                vocab_size: self.vocab_size
            }
        );
        ensure!(self.max_len > 0, ZeroLengthSnafu);
        ensure!(
            self.embedding_dim > 0 && self.lstm_hidden > 0 && self.dense_units > 0,
            LayerSizeSnafu
        );
        Ok(())
    }
}

/// The model itself.
pub struct LstmClassifier {
    embedding: nn::Embedding,
    lstm: nn::LSTM,
    dense: nn::Linear,
    output: nn::Linear,
    device: tch::Device,
}

impl LstmClassifier {
    /// Registers the model variables under the given path.
    pub fn new(var_store: &nn::Path<'_>, config: &ModelConfig) -> Self {
        let embedding = nn::embedding(
            var_store / "embedding",
            config.vocab_size,
            config.embedding_dim,
            nn::EmbeddingConfig::default(),
        );
        let lstm = nn::lstm(
            var_store / "lstm",
            config.embedding_dim,
            config.lstm_hidden,
            nn::RNNConfig {
                bidirectional: true,
                batch_first: true,
                ..Default::default()
            },
        );
        let dense = nn::linear(
            var_store / "dense",
            config.lstm_hidden * 2,
            config.dense_units,
            nn::LinearConfig::default(),
        );
        let output = nn::linear(
            var_store / "output",
            config.dense_units,
            1,
            nn::LinearConfig::default(),
        );
        Self {
            embedding,
            lstm,
            dense,
            output,
            device: var_store.device(),
        }
    }

    /// Predicts spam probabilities for the sequences.
    pub fn predict<I, Ids>(&self, input: I) -> Result<Vec<f32>, ClassifyError>
    where
        I: IntoIterator<Item = Ids>,
        Ids: AsRef<[i64]>,
    {
        let logits = self.forward(input, false)?;
        probabilities(&logits)
    }

    /// Computes both the mean loss and the probabilities from a single
    /// gradient-free forward pass.
    pub fn assess<'a, I>(&self, input: I) -> Result<Assessment, ClassifyError>
    where
        I: IntoIterator<Item = (&'a [i64], bool)>,
    {
        let (ids, tags): (Vec<_>, Vec<_>) = input
            .into_iter()
            .map(|(ids, is_spam)| (ids, f32::from(is_spam)))
            .unzip();
        let tags = Tensor::from_slice(&tags).to(self.device);

        let logits = self.forward(ids, false)?.squeeze_dim(1);
        let no_weight: Option<&Tensor> = None;
        let loss = logits
            .binary_cross_entropy_with_logits(&tags, no_weight, no_weight, tch::Reduction::Mean)
            .double_value(&[]);
        Ok(Assessment {
            loss,
            probabilities: probabilities(&logits)?,
        })
    }

    /// Runs a forward pass and returns unnormalized logits of shape
    /// `[batch, 1]`. Gradients are only tracked when `train` is set.
    pub fn forward<I, Ids>(&self, input: I, train: bool) -> Result<Tensor, ClassifyError>
    where
        I: IntoIterator<Item = Ids>,
        Ids: AsRef<[i64]>,
    {
        if train {
            self.forward_impl(input)
        } else {
            tch::no_grad(|| self.forward_impl(input))
        }
    }

    fn forward_impl<I, Ids>(&self, input: I) -> Result<Tensor, ClassifyError>
    where
        I: IntoIterator<Item = Ids>,
        Ids: AsRef<[i64]>,
    {
        let batch = input
            .into_iter()
            .map(|ids| Tensor::from_slice(ids.as_ref()))
            .collect::<Vec<_>>();
        ensure!(!batch.is_empty(), EmptyBatchSnafu);
        let ids = Tensor::pad_sequence(&batch, true, crate::vocabulary::PADDING_ID as f64)
            .to(self.device);

        let embedded = self.embedding.forward(&ids);
        let (_, nn::LSTMState((hidden, _))) = self.lstm.seq(&embedded);
        // [directions, batch, hidden] -> [batch, directions * hidden]
        let sentence = Tensor::cat(&[hidden.i(0), hidden.i(1)], 1);

        let dense = self.dense.forward(&sentence).relu();
        Ok(self.output.forward(&dense))
    }

    /// Feed forwards the input and calculates the binary cross entropy loss.
    pub fn train<'a, I>(&self, input: I, pos_weight: Option<&Tensor>) -> Result<TrainStep, ClassifyError>
    where
        I: IntoIterator<Item = (&'a [i64], bool)>,
    {
        let (ids, tags): (Vec<_>, Vec<_>) = input
            .into_iter()
            .map(|(ids, is_spam)| (ids, f32::from(is_spam)))
            .unzip();
        let tags = Tensor::from_slice(&tags).to(self.device);

        let logits = self.forward(ids, true)?.squeeze_dim(1);
        let loss = logits.binary_cross_entropy_with_logits(
            &tags,
            None,
            pos_weight,
            tch::Reduction::Mean,
        );
        // A positive logit is a probability above one half.
        let correct = tch::no_grad(|| logits.gt(0.).eq_tensor(&tags.gt(0.5)).sum(tch::Kind::Int64));
        let correct = i64::try_from(&correct).context(TchSnafu)?;
        Ok(TrainStep {
            loss,
            correct: correct as usize,
        })
    }
}

fn probabilities(logits: &Tensor) -> Result<Vec<f32>, ClassifyError> {
    let probabilities = logits
        .sigmoid()
        .flatten(0, -1)
        .to_kind(tch::Kind::Float)
        .to(tch::Device::Cpu);
    let probabilities = Vec::<f32>::try_from(&probabilities).context(TchSnafu)?;
    if let Some(&value) = probabilities.iter().find(|value| !value.is_finite()) {
        return NonFiniteSnafu { value }.fail();
    }
    Ok(probabilities)
}

/// Mean loss and per-sample probabilities of a validation batch.
#[derive(Debug, Clone)]
pub struct Assessment {
    /// Mean binary cross entropy.
    pub loss: f64,
    /// Spam probabilities in input order.
    pub probabilities: Vec<f32>,
}

/// Outcome of a training forward pass.
pub struct TrainStep {
    /// Scalar loss, ready for the backward pass.
    pub loss: Tensor,
    /// Samples classified correctly at the one half threshold.
    pub correct: usize,
}

/// Unable to load the weights.
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// The configuration is broken.
    #[snafu(context(false), display("Invalid model configuration"))]
    Config {
        /// Source error.
        source: ConfigError,
    },
    /// Torch can't read the weights.
    #[snafu(display("Unable to load weights from {path}"))]
    Weights {
        /// Path to the weights.
        path: camino::Utf8PathBuf,
        /// Source error.
        source: tch::TchError,
    },
}

struct Loaded {
    // Owns the variables the layers refer to.
    _var_store: nn::VarStore,
    model: LstmClassifier,
}

/// A trained [`LstmClassifier`] that can be shared between threads.
///
/// Torch tensors can be sent between threads but not shared, so forward
/// passes are serialized.
pub struct TchClassifier {
    inner: Mutex<Loaded>,
    config: ModelConfig,
}

impl TchClassifier {
    /// Loads the weights for the given configuration.
    pub fn load(
        config: ModelConfig,
        weights: &camino::Utf8Path,
        device: tch::Device,
    ) -> Result<Self, LoadError> {
        config.validate()?;
        let mut var_store = nn::VarStore::new(device);
        let model = LstmClassifier::new(&var_store.root(), &config);
        var_store
            .load(weights)
            .context(WeightsSnafu { path: weights })?;
        // Exported weights might be half-precision.
        var_store.float();
        var_store.freeze();
        tracing::debug!(%weights, ?device, "Weights loaded");
        Ok(Self {
            inner: Mutex::new(Loaded {
                _var_store: var_store,
                model,
            }),
            config,
        })
    }

    /// Wraps an already initialized model.
    pub fn from_parts(var_store: nn::VarStore, model: LstmClassifier, config: ModelConfig) -> Self {
        Self {
            inner: Mutex::new(Loaded {
                _var_store: var_store,
                model,
            }),
            config,
        }
    }

    /// The model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Classifies multiple sequences in one forward pass.
    pub fn predict_batch(&self, sequences: &[EncodedSequence]) -> Result<Vec<f32>, ClassifyError> {
        self.inner.lock().model.predict(sequences)
    }
}

impl SpamClassifier for TchClassifier {
    fn spam_probability(&self, sequence: &EncodedSequence) -> Result<f32, ClassifyError> {
        let probabilities = self.predict_batch(std::slice::from_ref(sequence))?;
        probabilities.first().copied().ok_or(ClassifyError::EmptyBatch)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: 12,
            embedding_dim: 4,
            lstm_hidden: 3,
            dense_units: 5,
            max_len: 6,
        }
    }

    #[test]
    fn output_shape_and_range() {
        tch::manual_seed(1);
        let var_store = nn::VarStore::new(tch::Device::Cpu);
        let model = LstmClassifier::new(&var_store.root(), &config());

        let batch: [[i64; 6]; 3] = [[2, 3, 4, 0, 0, 0], [11, 1, 0, 0, 0, 0], [0, 0, 0, 0, 0, 0]];
        let logits = model.forward(batch, false).unwrap();
        assert_eq!(logits.size(), [3, 1]);

        let probabilities = model.predict(batch).unwrap();
        assert_eq!(probabilities.len(), 3);
        assert!(probabilities.iter().all(|p| (0. ..=1.).contains(p)));
    }

    #[test]
    fn empty_batch() {
        let var_store = nn::VarStore::new(tch::Device::Cpu);
        let model = LstmClassifier::new(&var_store.root(), &config());
        assert!(matches!(
            model.predict(Vec::<Vec<i64>>::new()),
            Err(ClassifyError::EmptyBatch)
        ));
    }

    #[test]
    fn training_loss_is_a_finite_scalar() {
        tch::manual_seed(2);
        let var_store = nn::VarStore::new(tch::Device::Cpu);
        let model = LstmClassifier::new(&var_store.root(), &config());
        let spam = [5i64, 6, 7, 0, 0, 0];
        let ham = [2i64, 3, 0, 0, 0, 0];
        let step = model
            .train([(&spam[..], true), (&ham[..], false)], None)
            .unwrap();
        assert_eq!(step.loss.dim(), 0);
        assert!(step.loss.double_value(&[]).is_finite());
        assert!(step.correct <= 2);
    }

    #[test]
    fn assessment_matches_training_loss_and_predictions() {
        tch::manual_seed(3);
        let var_store = nn::VarStore::new(tch::Device::Cpu);
        let model = LstmClassifier::new(&var_store.root(), &config());
        let spam = [5i64, 6, 7, 0, 0, 0];
        let ham = [2i64, 3, 0, 0, 0, 0];
        let batch = [(&spam[..], true), (&ham[..], false)];

        let assessment = model.assess(batch).unwrap();
        let expected_loss = model.train(batch, None).unwrap().loss.double_value(&[]);
        let expected = model.predict([&spam[..], &ham[..]]).unwrap();

        assert!((assessment.loss - expected_loss).abs() < 1e-6);
        assert_eq!(assessment.probabilities.len(), 2);
        for (got, expected) in assessment.probabilities.iter().zip(expected) {
            assert!((got - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn config_validation() {
        assert!(config().validate().is_ok());
        assert!(matches!(
            ModelConfig { max_len: 0, ..config() }.validate(),
            Err(ConfigError::ZeroLength)
        ));
        assert!(matches!(
            ModelConfig::new(1, 51).validate(),
            Err(ConfigError::VocabSize { vocab_size: 1 })
        ));
    }

    #[test]
    fn config_defaults() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"vocab_size": 100, "max_len": 51}"#).unwrap();
        assert_eq!(config, ModelConfig::new(100, 51));
        assert_eq!(config.embedding_dim, 16);
        assert_eq!(config.lstm_hidden, 64);
    }
}
