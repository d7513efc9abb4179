//! SMS spam detection: text normalization, a word-index vocabulary, a
//! BiLSTM classifier and the inference service around them.

pub mod artifacts;
pub mod classifier;
pub mod dataset;
pub mod normalizer;
pub mod optimizer;
pub mod service;
pub mod tokenizer;
pub mod training_progress;
#[cfg(feature = "plotters")]
pub mod visualize;
pub mod vocabulary;

pub use artifacts::{LoadedModel, MobileArtifacts, ModelArtifacts};
pub use classifier::SpamClassifier;
pub use normalizer::normalize;
pub use service::{PredictError, SpamService, Verdict};
pub use tokenizer::{EncodedSequence, SequenceEncoder, Truncation};
pub use vocabulary::Vocabulary;

/// Re-export tch-rs.
pub use tch;

/// An SMS with a known class.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LabeledMessage {
    /// The raw text.
    pub text: String,
    /// Whether the message is a spam or not.
    pub is_spam: bool,
}
