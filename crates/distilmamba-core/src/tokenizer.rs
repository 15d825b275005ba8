use std::path::Path;

use serde_json::Value;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

const EOS_CANDIDATES: &[&str] = &["<|endoftext|>", "</s>", "<eos>"];

/// Fixed-length encoding of one text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedEncoding {
    pub token_ids: Vec<u32>,
    /// `1` for real tokens, `0` for padding.
    pub attention_mask: Vec<u32>,
}

/// Thin wrapper around the Hugging Face `tokenizers` crate with a resolved
/// padding token: the configured `pad_token`, otherwise end-of-sequence.
#[derive(Debug)]
pub struct Tokenizer {
    inner: HfTokenizer,
    pad_token_id: u32,
    eos_token_id: Option<u32>,
}

impl Tokenizer {
    /// Load `tokenizer.json` from a model directory, honouring the
    /// `pad_token` / `eos_token` entries of `tokenizer_config.json` when
    /// that file exists.
    pub fn from_dir(dir: &Path) -> CoreResult<Self> {
        let config_path = dir.join("tokenizer_config.json");
        let config = if config_path.exists() {
            let text = std::fs::read_to_string(&config_path)?;
            Some(serde_json::from_str::<Value>(&text)?)
        } else {
            None
        };
        Self::load(&dir.join("tokenizer.json"), config.as_ref())
    }

    fn load(path: &Path, config: Option<&Value>) -> CoreResult<Self> {
        let inner = HfTokenizer::from_file(path).map_err(|e| CoreError::Tokenizer(e.to_string()))?;

        let configured = |key: &str| config.and_then(|c| special_token_content(c, key));

        let eos_token_id = configured("eos_token")
            .and_then(|t| inner.token_to_id(&t))
            .or_else(|| Self::special_token_id(&inner, EOS_CANDIDATES));

        let pad_token_id = match configured("pad_token").and_then(|t| inner.token_to_id(&t)) {
            Some(id) => id,
            None => {
                let eos = eos_token_id.ok_or_else(|| {
                    CoreError::Tokenizer("tokenizer defines neither a pad nor an end-of-sequence token".to_string())
                })?;
                warn!(eos_token_id = eos, "No pad token configured; padding with the end-of-sequence token");
                eos
            }
        };

        debug!(
            pad_token_id,
            eos_token_id,
            vocab_size = inner.get_vocab_size(true),
            "Tokenizer loaded from file"
        );

        Ok(Self { inner, pad_token_id, eos_token_id })
    }

    /// Encode a text with no padding or truncation.
    pub fn encode(&self, text: &str) -> CoreResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode, truncate to `max_length`, and right-pad with the pad token.
    pub fn encode_padded(&self, text: &str, max_length: usize) -> CoreResult<PaddedEncoding> {
        let mut token_ids = self.encode(text)?;
        token_ids.truncate(max_length);
        let real = token_ids.len();
        token_ids.resize(max_length, self.pad_token_id);

        let mut attention_mask = vec![1u32; real];
        attention_mask.resize(max_length, 0);
        Ok(PaddedEncoding { token_ids, attention_mask })
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn special_token_id(tokenizer: &HfTokenizer, candidates: &[&str]) -> Option<u32> {
        let vocab = tokenizer.get_vocab(true);
        candidates.iter().find_map(|c| vocab.get(*c).copied())
    }
}

/// `tokenizer_config.json` stores special tokens either as a plain string or
/// as an `AddedToken` object with a `content` field.
fn special_token_content(config: &Value, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("content")?.as_str().map(String::from),
        _ => None,
    }
}
