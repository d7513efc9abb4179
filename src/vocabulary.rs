//! A fitted word index.
//!
//! The vocabulary is stored in the JSON layout of the Keras `Tokenizer`
//! (`tokenizer.to_json()`), which the mobile client reads as well. The inner
//! maps of that layout are JSON documents encoded as strings.

use std::collections::{HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

/// The token unknown words are mapped to.
pub const DEFAULT_OOV_TOKEN: &str = "<OOV>";

/// The id used to pad sequences. No word ever gets it.
pub const PADDING_ID: i64 = 0;

/// Mapping between words and integer ids, fitted once on the training texts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    /// Out-of-vocabulary token, always has the id `1`.
    oov_token: String,
    /// Words ordered by id, `words[0]` is the OOV token.
    words: Vec<String>,
    /// Word to id.
    word_index: HashMap<String, i64>,
    /// How many times each word was seen.
    word_counts: Vec<(String, u64)>,
    /// In how many documents each word was seen.
    word_docs: Vec<(String, u64)>,
    /// The amount of texts the vocabulary has been fitted on.
    document_count: u64,
}

impl Vocabulary {
    /// Fits a vocabulary on whitespace separated texts with the default OOV
    /// token.
    pub fn fit<I>(texts: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self::fit_with_oov(texts, DEFAULT_OOV_TOKEN)
    }

    /// Fits a vocabulary on whitespace separated texts.
    ///
    /// Words are ranked by their frequency, ties are resolved by the first
    /// appearance. The OOV token gets id `1`, the most frequent word gets id
    /// `2` and so on.
    pub fn fit_with_oov<I>(texts: I, oov_token: &str) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut positions = HashMap::<String, usize>::new();
        let mut word_counts = Vec::<(String, u64)>::new();
        let mut document_frequency = Vec::<u64>::new();
        let mut seen_in_document = HashSet::<usize>::new();
        let mut document_count = 0u64;

        for text in texts {
            document_count += 1;
            seen_in_document.clear();
            for word in text.as_ref().split_whitespace() {
                if word == oov_token {
                    continue;
                }
                let position = match positions.get(word) {
                    Some(position) => *position,
                    None => {
                        let position = word_counts.len();
                        positions.insert(word.to_owned(), position);
                        word_counts.push((word.to_owned(), 0));
                        document_frequency.push(0);
                        position
                    }
                };
                word_counts[position].1 += 1;
                if seen_in_document.insert(position) {
                    document_frequency[position] += 1;
                }
            }
        }

        // `sort_by` is stable, so equally frequent words keep the order of
        // their first appearance.
        let mut ranked = (0..word_counts.len()).collect::<Vec<_>>();
        ranked.sort_by(|&a, &b| word_counts[b].1.cmp(&word_counts[a].1));

        let words = std::iter::once(oov_token.to_owned())
            .chain(ranked.into_iter().map(|position| word_counts[position].0.clone()))
            .collect::<Vec<_>>();
        let word_docs = word_counts
            .iter()
            .zip(document_frequency)
            .map(|((word, _), docs)| (word.clone(), docs))
            .collect();

        let vocabulary = Self {
            oov_token: oov_token.to_owned(),
            word_index: index_words(&words),
            words,
            word_counts,
            word_docs,
            document_count,
        };
        tracing::debug!(
            words = vocabulary.len(),
            documents = document_count,
            "Vocabulary fitted"
        );
        vocabulary
    }

    /// Returns the id of the word, if it is known.
    pub fn id(&self, word: &str) -> Option<i64> {
        self.word_index.get(word).copied()
    }

    /// Returns the id of the word, or the OOV id if the word is unknown.
    pub fn id_or_oov(&self, word: &str) -> i64 {
        self.id(word).unwrap_or(self.oov_id())
    }

    /// Returns the word behind the id.
    pub fn word(&self, id: i64) -> Option<&str> {
        let position = usize::try_from(id).ok()?.checked_sub(1)?;
        self.words.get(position).map(String::as_str)
    }

    /// The id of the out-of-vocabulary token.
    pub fn oov_id(&self) -> i64 {
        1
    }

    /// The out-of-vocabulary token.
    pub fn oov_token(&self) -> &str {
        &self.oov_token
    }

    /// The amount of indexed words, including the OOV token.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Returns `true` if nothing but the OOV token is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.len() <= 1
    }

    /// The amount of rows an embedding table needs: every id plus padding.
    pub fn embedding_rows(&self) -> usize {
        self.words.len() + 1
    }

    /// The amount of texts the vocabulary has been fitted on.
    pub fn document_count(&self) -> u64 {
        self.document_count
    }

    /// How many times the word was seen while fitting.
    pub fn count(&self, word: &str) -> Option<u64> {
        self.word_counts
            .iter()
            .find_map(|(known, count)| (known == word).then_some(*count))
    }
}

fn index_words(words: &[String]) -> HashMap<String, i64> {
    words
        .iter()
        .enumerate()
        .map(|(position, word)| (word.clone(), position as i64 + 1))
        .collect()
}

/// Unable to save a vocabulary.
#[derive(Debug, Snafu)]
pub enum SaveError {
    /// Unable to create a file.
    #[snafu(display("Unable to create a file at {path}"))]
    CreateFile {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
    /// Unable to serialize the vocabulary.
    #[snafu(display("Unable to serialize the vocabulary"))]
    #[snafu(context(false))]
    Serialize {
        /// Source error.
        source: serde_json::Error,
    },
}

/// Unable to load a vocabulary.
#[derive(Debug, Snafu)]
pub enum LoadError {
    /// Unable to read a file.
    #[snafu(display("Unable to read the vocabulary at {path}"))]
    ReadFile {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
    /// The file is not a tokenizer JSON.
    #[snafu(display("Can't deserialize the tokenizer JSON"))]
    #[snafu(context(false))]
    Deserialize {
        /// Source error.
        source: serde_json::Error,
    },
    /// One of the string-encoded maps is malformed.
    #[snafu(display("The {field:?} field is not a valid JSON map"))]
    EmbeddedMap {
        /// Name of the field.
        field: &'static str,
        /// Source error.
        source: serde_json::Error,
    },
    /// The tokenizer has been fitted without an OOV token.
    #[snafu(display("The tokenizer has no OOV token"))]
    MissingOovToken,
    /// The OOV token must have the id `1`.
    #[snafu(display("The OOV token {token:?} has id {id:?} instead of 1"))]
    OovId {
        /// The OOV token.
        token: String,
        /// Its id, if any.
        id: Option<i64>,
    },
    /// Word ids must be `1..=N` without gaps.
    #[snafu(display("Word ids are not contiguous: {id} is out of 1..={max}"))]
    NonContiguousIds {
        /// The offending id.
        id: i64,
        /// The maximum expected id.
        max: usize,
    },
    /// Two words share the same id.
    #[snafu(display("Word id {id} is assigned to both {first:?} and {second:?}"))]
    DuplicateId {
        /// The shared id.
        id: i64,
        /// One of the words.
        first: String,
        /// The other one.
        second: String,
    },
    /// No word has the given id.
    #[snafu(display("No word has id {id}"))]
    MissingId {
        /// The unassigned id.
        id: usize,
    },
}

impl Vocabulary {
    /// Saves the vocabulary as a tokenizer JSON.
    pub fn save<P>(&self, output: P) -> Result<(), SaveError>
    where
        P: AsRef<Utf8Path>,
    {
        let path = output.as_ref();
        let output = std::io::BufWriter::new(
            std::fs::File::create(path).context(CreateFileSnafu { path })?,
        );
        Ok(serde_json::to_writer(output, &self.to_tokenizer_json()?)?)
    }

    /// Serializes the vocabulary into a tokenizer JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_tokenizer_json()?)
    }

    /// Loads a vocabulary from a tokenizer JSON file.
    pub fn load<P>(input: P) -> Result<Self, LoadError>
    where
        P: AsRef<Utf8Path>,
    {
        let path = input.as_ref();
        let data = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_json(&data)
    }

    /// Parses a tokenizer JSON string.
    pub fn from_json(data: &str) -> Result<Self, LoadError> {
        let TokenizerJson { config, .. } = serde_json::from_str(data)?;
        let oov_token = config.oov_token.context(MissingOovTokenSnafu)?;

        let word_index: HashMap<String, i64> =
            serde_json::from_str(&config.word_index).context(EmbeddedMapSnafu {
                field: "word_index",
            })?;
        let oov_id = word_index.get(&oov_token).copied();
        ensure!(
            oov_id == Some(1),
            OovIdSnafu {
                token: oov_token,
                id: oov_id
            }
        );

        let max = word_index.len();
        let mut slots = vec![None; max];
        for (word, &id) in &word_index {
            let slot = usize::try_from(id)
                .ok()
                .and_then(|id| id.checked_sub(1))
                .and_then(|position| slots.get_mut(position))
                .context(NonContiguousIdsSnafu { id, max })?;
            if let Some(first) = slot.replace(word.clone()) {
                return DuplicateIdSnafu {
                    id,
                    first,
                    second: word.clone(),
                }
                .fail();
            }
        }
        let words = slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| slot.context(MissingIdSnafu { id: position + 1 }))
            .collect::<Result<Vec<_>, _>>()?;

        let counts: HashMap<String, u64> = parse_optional_map(config.word_counts, "word_counts")?;
        let docs: HashMap<String, u64> = parse_optional_map(config.word_docs, "word_docs")?;
        let in_id_order = |map: &HashMap<String, u64>| {
            words
                .iter()
                .filter_map(|word| map.get(word).map(|value| (word.clone(), *value)))
                .collect::<Vec<_>>()
        };

        Ok(Self {
            word_counts: in_id_order(&counts),
            word_docs: in_id_order(&docs),
            word_index,
            words,
            oov_token,
            document_count: config.document_count,
        })
    }

    fn to_tokenizer_json(&self) -> Result<TokenizerJson, serde_json::Error> {
        let index_word = self
            .words
            .iter()
            .enumerate()
            .map(|(position, word)| ((position + 1).to_string(), word.as_str()))
            .collect::<Vec<_>>();
        let word_index = self
            .words
            .iter()
            .enumerate()
            .map(|(position, word)| (word.as_str(), position as i64 + 1))
            .collect::<Vec<_>>();
        let index_docs = self
            .word_docs
            .iter()
            .filter_map(|(word, docs)| Some((self.id(word)?.to_string(), *docs)))
            .collect::<Vec<_>>();

        Ok(TokenizerJson {
            class_name: "Tokenizer".to_owned(),
            config: TokenizerConfig {
                num_words: None,
                filters: defaults::filters(),
                lower: true,
                split: defaults::split(),
                char_level: false,
                oov_token: Some(self.oov_token.clone()),
                document_count: self.document_count,
                word_counts: Some(serde_json::to_string(&OrderedMap(&self.word_counts))?),
                word_docs: Some(serde_json::to_string(&OrderedMap(&self.word_docs))?),
                index_docs: Some(serde_json::to_string(&OrderedMap(&index_docs))?),
                index_word: Some(serde_json::to_string(&OrderedMap(&index_word))?),
                word_index: serde_json::to_string(&OrderedMap(&word_index))?,
            },
        })
    }
}

fn parse_optional_map(
    data: Option<String>,
    field: &'static str,
) -> Result<HashMap<String, u64>, LoadError> {
    match data {
        Some(data) => serde_json::from_str(&data).context(EmbeddedMapSnafu { field }),
        None => Ok(HashMap::new()),
    }
}

/// Serializes a slice of pairs as a JSON object, keeping the order.
struct OrderedMap<'a, K, V>(&'a [(K, V)]);

impl<K, V> serde::Serialize for OrderedMap<'_, K, V>
where
    K: serde::Serialize,
    V: serde::Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_map(self.0.iter().map(|(key, value)| (key, value)))
    }
}

/// The `tokenizer.to_json()` layout.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct TokenizerJson {
    #[serde(default = "defaults::class_name")]
    class_name: String,
    config: TokenizerConfig,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    num_words: Option<u64>,
    #[serde(default = "defaults::filters")]
    filters: String,
    #[serde(default = "defaults::fn_true")]
    lower: bool,
    #[serde(default = "defaults::split")]
    split: String,
    #[serde(default)]
    char_level: bool,
    #[serde(default)]
    oov_token: Option<String>,
    #[serde(default)]
    document_count: u64,
    #[serde(default)]
    word_counts: Option<String>,
    #[serde(default)]
    word_docs: Option<String>,
    #[serde(default)]
    index_docs: Option<String>,
    #[serde(default)]
    index_word: Option<String>,
    word_index: String,
}

mod defaults {
    pub fn class_name() -> String {
        "Tokenizer".to_owned()
    }

    pub fn filters() -> String {
        "!\"#$%&()*+,-./:;<=>?@[\\]^_`{|}~\t\n".to_owned()
    }

    pub fn split() -> String {
        " ".to_owned()
    }

    pub const fn fn_true() -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fitted() -> Vocabulary {
        Vocabulary::fit([
            "kampanya kazandınız hemen tıklayın",
            "yarın buluşalım mı",
            "kazandınız kazandınız hemen",
        ])
    }

    #[test]
    fn ranks_by_frequency_then_first_appearance() {
        let vocabulary = fitted();
        assert_eq!(vocabulary.id("<OOV>"), Some(1));
        assert_eq!(vocabulary.id("kazandınız"), Some(2));
        assert_eq!(vocabulary.id("hemen"), Some(3));
        // All of the following are seen once, in this order.
        assert_eq!(vocabulary.id("kampanya"), Some(4));
        assert_eq!(vocabulary.id("tıklayın"), Some(5));
        assert_eq!(vocabulary.id("yarın"), Some(6));
        assert_eq!(vocabulary.id("buluşalım"), Some(7));
        assert_eq!(vocabulary.id("mı"), Some(8));
        assert_eq!(vocabulary.len(), 8);
        assert_eq!(vocabulary.embedding_rows(), 9);
        assert_eq!(vocabulary.document_count(), 3);
        assert_eq!(vocabulary.count("kazandınız"), Some(3));
        assert_eq!(vocabulary.word(3), Some("hemen"));
        assert_eq!(vocabulary.word(0), None);
    }

    #[test]
    fn unknown_words_map_to_oov() {
        let vocabulary = fitted();
        assert_eq!(vocabulary.id("bilinmeyen"), None);
        assert_eq!(vocabulary.id_or_oov("bilinmeyen"), vocabulary.oov_id());
    }

    #[test]
    fn empty_vocabulary_has_only_oov() {
        let vocabulary = Vocabulary::fit(Vec::<String>::new());
        assert!(vocabulary.is_empty());
        assert_eq!(vocabulary.len(), 1);
        assert_eq!(vocabulary.id_or_oov("x"), 1);
    }

    #[test]
    fn oov_token_in_text_is_not_indexed_twice() {
        let vocabulary = Vocabulary::fit(["<OOV> a", "a"]);
        assert_eq!(vocabulary.id("<OOV>"), Some(1));
        assert_eq!(vocabulary.id("a"), Some(2));
        assert_eq!(vocabulary.len(), 2);
    }

    #[test]
    fn tokenizer_json_layout() {
        let json = fitted().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["class_name"], "Tokenizer");
        let config = &value["config"];
        assert_eq!(config["oov_token"], "<OOV>");
        assert_eq!(config["document_count"], 3);

        let word_index: serde_json::Value =
            serde_json::from_str(config["word_index"].as_str().unwrap()).unwrap();
        assert_eq!(word_index["kazandınız"], 2);

        let index_word: serde_json::Value =
            serde_json::from_str(config["index_word"].as_str().unwrap()).unwrap();
        assert_eq!(index_word["1"], "<OOV>");

        let word_docs: serde_json::Value =
            serde_json::from_str(config["word_docs"].as_str().unwrap()).unwrap();
        assert_eq!(word_docs["kazandınız"], 2);
    }

    #[test]
    fn reloads_from_disk() {
        let vocabulary = fitted();
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("tokenizer.json")).unwrap();
        vocabulary.save(&path).unwrap();
        let loaded = Vocabulary::load(&path).unwrap();
        assert_eq!(loaded.words, vocabulary.words);
        assert_eq!(loaded.word_index, vocabulary.word_index);
        assert_eq!(loaded.document_count(), 3);
        assert_eq!(loaded.count("hemen"), Some(2));
    }

    #[test]
    fn loads_minimal_keras_json() {
        let data = r#"{"class_name": "Tokenizer", "config": {
            "oov_token": "<OOV>",
            "word_index": "{\"<OOV>\": 1, \"tl\": 2, \"kazand\\u0131n\\u0131z\": 3}"
        }}"#;
        let vocabulary = Vocabulary::from_json(data).unwrap();
        assert_eq!(vocabulary.id("kazandınız"), Some(3));
        assert_eq!(vocabulary.word(2), Some("tl"));
    }

    #[test]
    fn rejects_broken_files() {
        let without_oov = r#"{"config": {"word_index": "{\"a\": 1}"}}"#;
        assert!(matches!(
            Vocabulary::from_json(without_oov),
            Err(LoadError::MissingOovToken)
        ));

        let misplaced_oov = r#"{"config": {"oov_token": "<OOV>", "word_index": "{\"a\": 1, \"<OOV>\": 2}"}}"#;
        assert!(matches!(
            Vocabulary::from_json(misplaced_oov),
            Err(LoadError::OovId { id: Some(2), .. })
        ));

        let gap = r#"{"config": {"oov_token": "<OOV>", "word_index": "{\"<OOV>\": 1, \"a\": 3}"}}"#;
        assert!(matches!(
            Vocabulary::from_json(gap),
            Err(LoadError::NonContiguousIds { id: 3, max: 2 })
        ));

        let duplicate = r#"{"config": {"oov_token": "<OOV>", "word_index": "{\"<OOV>\": 1, \"a\": 2, \"b\": 2}"}}"#;
        match Vocabulary::from_json(duplicate) {
            Err(LoadError::DuplicateId { id, first, second }) => {
                assert_eq!(id, 2);
                let mut words = [first, second];
                words.sort();
                assert_eq!(words, ["a", "b"]);
            }
            other => panic!("Unexpected result: {other:?}"),
        }

        let garbage = r#"{"config": {"oov_token": "<OOV>", "word_index": "not json"}}"#;
        assert!(matches!(
            Vocabulary::from_json(garbage),
            Err(LoadError::EmbeddedMap { field: "word_index", .. })
        ));
    }
}
