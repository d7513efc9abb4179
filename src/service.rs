//! The inference request path: validate, normalize, encode, classify.

use snafu::{ResultExt, Snafu};

use crate::{
    artifacts::{LoadedModel, ModelArtifacts},
    classifier::ClassifyError,
    normalizer::normalize,
    tokenizer::Truncation,
};

/// Probabilities above this value are considered a spam.
pub const SPAM_THRESHOLD: f32 = 0.5;

/// Prediction failure.
#[derive(Debug, Snafu)]
pub enum PredictError {
    /// Nothing to classify.
    #[snafu(display("Mesaj boş olamaz"))]
    EmptyMessage,
    /// The model or the vocabulary hasn't been loaded.
    #[snafu(display("Model yüklenmedi"))]
    ModelUnavailable,
    /// The classifier failed.
    #[snafu(display("{source}"))]
    Inference {
        /// Source error.
        source: ClassifyError,
    },
}

/// Classification result of a single message.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Verdict {
    /// Whether the message is a spam.
    pub is_spam: bool,
    /// The spam probability.
    #[serde(rename = "prediction")]
    pub probability: f32,
}

impl Verdict {
    /// Applies the [`SPAM_THRESHOLD`].
    pub fn from_probability(probability: f32) -> Self {
        Self {
            is_spam: probability > SPAM_THRESHOLD,
            probability,
        }
    }

    /// Probability of the chosen class.
    pub fn confidence(&self) -> f32 {
        if self.is_spam {
            self.probability
        } else {
            1. - self.probability
        }
    }

    /// A human readable class name.
    pub fn label(&self) -> &'static str {
        if self.is_spam {
            "SPAM"
        } else {
            "NORMAL"
        }
    }
}

/// Immutable inference context shared by every request.
#[derive(Debug)]
pub struct SpamService {
    model: Option<LoadedModel>,
}

impl SpamService {
    /// A service backed by the model.
    pub fn new(model: LoadedModel) -> Self {
        Self { model: Some(model) }
    }

    /// A service that answers every request with
    /// [`PredictError::ModelUnavailable`].
    pub fn unloaded() -> Self {
        Self { model: None }
    }

    /// Loads the artifacts. Failures are logged and produce an unloaded
    /// service.
    pub fn from_artifacts(
        artifacts: &ModelArtifacts,
        truncation: Truncation,
        device: tch::Device,
    ) -> Self {
        match artifacts.load(truncation, device) {
            Ok(model) => Self::new(model),
            Err(error) => {
                tracing::error!(
                    dir = %artifacts.dir(),
                    error = %snafu::Report::from_error(&error),
                    "Unable to load the model"
                );
                Self::unloaded()
            }
        }
    }

    /// Whether a model is available.
    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// The loaded model, if any.
    pub fn model(&self) -> Option<&LoadedModel> {
        self.model.as_ref()
    }

    /// Classifies a message.
    pub fn predict(&self, message: &str) -> Result<Verdict, PredictError> {
        if message.is_empty() {
            return EmptyMessageSnafu.fail();
        }
        let model = self.model.as_ref().ok_or(PredictError::ModelUnavailable)?;

        let sequence = model.encoder.encode(&normalize(message));
        let probability = model
            .classifier
            .spam_probability(&sequence)
            .context(InferenceSnafu)?;
        Ok(Verdict::from_probability(probability))
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        classifier::SpamClassifier,
        tokenizer::{EncodedSequence, SequenceEncoder},
        vocabulary::Vocabulary,
    };

    /// Returns a fixed probability and counts the calls.
    struct Fixed {
        probability: f32,
        calls: Arc<AtomicUsize>,
        max_len: usize,
    }

    impl SpamClassifier for Fixed {
        fn spam_probability(&self, sequence: &EncodedSequence) -> Result<f32, ClassifyError> {
            assert_eq!(sequence.len(), self.max_len);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.probability)
        }
    }

    struct Broken;

    impl SpamClassifier for Broken {
        fn spam_probability(&self, _: &EncodedSequence) -> Result<f32, ClassifyError> {
            Err(ClassifyError::Backend {
                message: "device lost".into(),
            })
        }
    }

    fn encoder() -> SequenceEncoder {
        SequenceEncoder::new(
            Vocabulary::fit(["tebrikler kazandınız", "yarın görüşürüz"]),
            51,
            Truncation::Pre,
        )
    }

    fn service(probability: f32) -> (SpamService, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = SpamService::new(LoadedModel {
            encoder: encoder(),
            classifier: Box::new(Fixed {
                probability,
                calls: Arc::clone(&calls),
                max_len: 51,
            }),
        });
        (service, calls)
    }

    #[test]
    fn empty_message_does_not_touch_the_model() {
        let (service, calls) = service(0.9);
        let error = service.predict("").unwrap_err();
        assert!(matches!(error, PredictError::EmptyMessage));
        assert_eq!(error.to_string(), "Mesaj boş olamaz");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_message_is_checked_before_the_model() {
        assert!(matches!(
            SpamService::unloaded().predict(""),
            Err(PredictError::EmptyMessage)
        ));
    }

    #[test]
    fn unloaded_model() {
        let service = SpamService::unloaded();
        assert!(!service.is_loaded());
        let error = service.predict("TEBRİKLER! 1000 TL kazandınız!").unwrap_err();
        assert!(matches!(error, PredictError::ModelUnavailable));
        assert_eq!(error.to_string(), "Model yüklenmedi");
    }

    #[test]
    fn verdict() {
        let (service, calls) = service(0.93);
        let verdict = service.predict("TEBRİKLER! 1000 TL kazandınız!").unwrap();
        assert!(verdict.is_spam);
        assert_eq!(verdict.label(), "SPAM");
        assert!((verdict.confidence() - 0.93).abs() < 1e-6);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Whitespace is a message, even though nothing survives normalization.
        assert!(service.predict("   ").is_ok());
        assert!(service.predict("!!!").is_ok());
    }

    #[test]
    fn threshold_is_strict() {
        assert!(!Verdict::from_probability(0.5).is_spam);
        assert!(Verdict::from_probability(0.500_001).is_spam);
        let ham = Verdict::from_probability(0.2);
        assert_eq!(ham.label(), "NORMAL");
        assert!((ham.confidence() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn inference_errors_keep_the_cause() {
        let service = SpamService::new(LoadedModel {
            encoder: encoder(),
            classifier: Box::new(Broken),
        });
        let error = service.predict("merhaba").unwrap_err();
        assert!(matches!(error, PredictError::Inference { .. }));
        assert_eq!(error.to_string(), "device lost");
    }

    #[test]
    fn verdict_json() {
        let json = serde_json::to_value(Verdict::from_probability(0.25)).unwrap();
        assert_eq!(json, serde_json::json!({"is_spam": false, "prediction": 0.25}));
    }

    #[test]
    fn missing_artifacts_produce_an_unloaded_service() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts =
            ModelArtifacts::new(camino::Utf8Path::from_path(dir.path()).unwrap());
        let service = SpamService::from_artifacts(&artifacts, Truncation::Pre, tch::Device::Cpu);
        assert!(!service.is_loaded());
    }
}
