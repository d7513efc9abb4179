//! Fixed-length sequence encoding on top of a fitted [`Vocabulary`].

use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

use crate::vocabulary::{Vocabulary, PADDING_ID};

/// Which end of an over-long sequence is cut off.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    /// Drop the leading words, keep the last `max_len` ones.
    #[default]
    Pre,
    /// Drop the trailing words, keep the first `max_len` ones.
    Post,
}

/// A sequence of word ids of exactly `max_len` elements, right-padded with
/// [`PADDING_ID`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedSequence(Vec<i64>);

impl EncodedSequence {
    /// The ids.
    pub fn ids(&self) -> &[i64] {
        &self.0
    }

    /// The amount of ids, always equal to the encoder's `max_len`.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if `max_len` is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The amount of non-padding ids.
    pub fn words(&self) -> usize {
        self.0.iter().take_while(|id| **id != PADDING_ID).count()
    }

    /// Returns the underlying ids.
    pub fn into_inner(self) -> Vec<i64> {
        self.0
    }
}

impl AsRef<[i64]> for EncodedSequence {
    fn as_ref(&self) -> &[i64] {
        &self.0
    }
}

/// Turns normalized text into fixed-length id sequences.
#[derive(Debug, Clone)]
pub struct SequenceEncoder {
    vocabulary: Vocabulary,
    max_len: usize,
    truncation: Truncation,
}

impl SequenceEncoder {
    /// Creates an encoder producing sequences of `max_len` ids.
    pub fn new(vocabulary: Vocabulary, max_len: usize, truncation: Truncation) -> Self {
        Self {
            vocabulary,
            max_len,
            truncation,
        }
    }

    /// Maps every word of the text to its id. Unknown words map to the OOV
    /// id. The output is not padded.
    pub fn ids(&self, text: &str) -> Vec<i64> {
        text.split_whitespace()
            .map(|word| self.vocabulary.id_or_oov(word))
            .collect()
    }

    /// Encodes the text into exactly `max_len` ids.
    pub fn encode(&self, text: &str) -> EncodedSequence {
        self.pad(self.ids(text))
    }

    /// Truncates or pads raw ids to `max_len`.
    fn pad(&self, mut ids: Vec<i64>) -> EncodedSequence {
        if ids.len() > self.max_len {
            match self.truncation {
                Truncation::Pre => {
                    ids.drain(..ids.len() - self.max_len);
                }
                Truncation::Post => ids.truncate(self.max_len),
            }
        }
        ids.resize(self.max_len, PADDING_ID);
        EncodedSequence(ids)
    }

    /// The sequence length.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// The truncation side.
    pub fn truncation(&self) -> Truncation {
        self.truncation
    }

    /// The vocabulary.
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }
}

type Sentence = (EncodedSequence, bool);

/// Encodes multiple labelled sentences at once in parallel.
pub struct BatchEncoder<'a, Sentences> {
    encoder: &'a SequenceEncoder,
    batch_size: usize,
    incoming: Sentences,
    encoded: Vec<Sentence>,
}

impl<'a, Sentences> BatchEncoder<'a, Sentences> {
    /// Construct a batch encoder.
    pub fn new<I>(
        encoder: &'a SequenceEncoder,
        batch_size: usize,
        incoming: I,
    ) -> BatchEncoder<'a, Sentences>
    where
        I: IntoIterator<IntoIter = Sentences>,
        Sentences: Iterator,
    {
        BatchEncoder {
            encoder,
            batch_size: batch_size.max(1),
            incoming: incoming.into_iter(),
            encoded: Vec::with_capacity(batch_size),
        }
    }
}

impl<Sentences, W> BatchEncoder<'_, Sentences>
where
    Sentences: Iterator<Item = (W, bool)>,
    W: AsRef<str> + Send,
{
    /// Encodes the next batch, keeping the order of the sentences.
    pub fn process_parallel(&mut self) -> Option<&[Sentence]> {
        let batch = self
            .incoming
            .by_ref()
            .take(self.batch_size)
            .collect::<Vec<_>>();
        if batch.is_empty() {
            return None;
        }

        batch
            .into_par_iter()
            .map(|(sentence, class)| (self.encoder.encode(sentence.as_ref()), class))
            .collect_into_vec(&mut self.encoded);
        Some(&self.encoded)
    }

    /// Encodes everything that is left.
    pub fn collect_all(mut self) -> Vec<Sentence> {
        let mut all = Vec::new();
        while let Some(batch) = self.process_parallel() {
            all.extend_from_slice(batch);
        }
        all
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encoder(max_len: usize, truncation: Truncation) -> SequenceEncoder {
        let vocabulary = Vocabulary::fit(["bir iki iki üç üç üç"]);
        SequenceEncoder::new(vocabulary, max_len, truncation)
    }

    #[test]
    fn pads_at_the_end() {
        let encoder = encoder(6, Truncation::Pre);
        // üç = 2, iki = 3, bir = 4, unknown = 1.
        assert_eq!(encoder.encode("bir iki dört").ids(), &[4, 3, 1, 0, 0, 0]);
        assert_eq!(encoder.encode("bir iki dört").words(), 3);
    }

    #[test]
    fn length_is_always_max_len() {
        let encoder = encoder(51, Truncation::Pre);
        let long = "bir ".repeat(500);
        for text in ["", " ", "üç", long.as_str(), "tebrikler 1000 tl kazandınız"] {
            assert_eq!(encoder.encode(text).len(), 51, "text: {text:?}");
        }
    }

    #[test]
    fn empty_text_is_all_padding() {
        let encoder = encoder(4, Truncation::Post);
        assert_eq!(encoder.encode("").ids(), &[0, 0, 0, 0]);
        assert_eq!(encoder.encode("").words(), 0);
    }

    #[test]
    fn pre_truncation_keeps_the_tail() {
        let encoder = encoder(2, Truncation::Pre);
        assert_eq!(encoder.encode("bir iki üç").ids(), &[3, 2]);
    }

    #[test]
    fn post_truncation_keeps_the_head() {
        let encoder = encoder(2, Truncation::Post);
        assert_eq!(encoder.encode("bir iki üç").ids(), &[4, 3]);
    }

    #[test]
    fn zero_length_sequences() {
        let encoder = encoder(0, Truncation::Pre);
        assert!(encoder.encode("bir iki").is_empty());
    }

    #[test]
    fn batches_keep_order() {
        let encoder = encoder(3, Truncation::Pre);
        let sentences = vec![
            ("bir", false),
            ("iki", true),
            ("üç", false),
            ("bir iki", true),
            ("dört", false),
        ];
        let encoded = BatchEncoder::new(&encoder, 2, sentences).collect_all();
        let ids = encoded
            .iter()
            .map(|(sequence, is_spam)| (sequence.ids().to_vec(), *is_spam))
            .collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![
                (vec![4, 0, 0], false),
                (vec![3, 0, 0], true),
                (vec![2, 0, 0], false),
                (vec![4, 3, 0], true),
                (vec![1, 0, 0], false),
            ]
        );
    }
}
