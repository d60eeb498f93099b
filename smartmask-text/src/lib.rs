//! The tokenizer collaborator: `encode`/`decode` only, backed by the
//! [`tokenizers`] crate's Hugging Face `tokenizer.json` pipeline.
//!
//! Everything else about a tokenizer — vocabulary, merges, normalizers,
//! pre-tokenizers, special-token handling — is delegated to that crate.
//! This module only adds the narrow `add_bos`/`parse_special` surface the
//! generation loop needs and converts token ids to the `i32` width the
//! accelerator's token-input tensor expects.

use std::fmt;
use std::path::Path;

use tokenizers::Tokenizer as HfTokenizer;

/// Errors from loading a tokenizer or encoding/decoding text.
#[derive(Debug)]
pub enum Error {
    Load(String),
    Encode(String),
    Decode(String),
    /// `add_bos` was requested but the tokenizer has no configured BOS token.
    NoBosToken,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Load(detail) => write!(f, "failed to load tokenizer: {detail}"),
            Error::Encode(detail) => write!(f, "failed to encode text: {detail}"),
            Error::Decode(detail) => write!(f, "failed to decode token ids: {detail}"),
            Error::NoBosToken => write!(f, "add_bos requested but tokenizer has no BOS token"),
        }
    }
}

impl std::error::Error for Error {}

/// Thin wrapper over a loaded Hugging Face tokenizer, exposing only the
/// `encode`/`decode` contract the generation loop depends on.
pub struct Tokenizer {
    inner: HfTokenizer,
    bos_token_id: Option<u32>,
}

impl Tokenizer {
    /// Load a tokenizer from a Hugging Face `tokenizer.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let inner = HfTokenizer::from_file(path.as_ref())
            .map_err(|e| Error::Load(format!("{}: {e}", path.as_ref().display())))?;
        let bos_token_id = find_bos_token_id(&inner);
        Ok(Tokenizer { inner, bos_token_id })
    }

    /// Load a tokenizer from an in-memory `tokenizer.json` document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let inner = HfTokenizer::from_bytes(json.as_bytes()).map_err(|e| Error::Load(e.to_string()))?;
        let bos_token_id = find_bos_token_id(&inner);
        Ok(Tokenizer { inner, bos_token_id })
    }

    /// Encode `text` into an ordered sequence of token ids.
    ///
    /// `parse_special` controls whether special-token strings embedded in
    /// `text` (e.g. `<|im_start|>`) are recognized and encoded to their
    /// dedicated ids, rather than split and encoded as ordinary text --
    /// this is the `tokenizers` crate's `add_special_tokens` flag threaded
    /// through the encode call. `add_bos` additionally prepends the
    /// tokenizer's configured BOS token id, if one is not already the
    /// first id produced.
    pub fn encode(&self, text: &str, add_bos: bool, parse_special: bool) -> Result<Vec<i32>, Error> {
        let encoding = self
            .inner
            .encode(text, parse_special)
            .map_err(|e| Error::Encode(e.to_string()))?;
        let mut ids: Vec<i32> = encoding.get_ids().iter().map(|&id| id as i32).collect();

        if add_bos {
            let bos = self.bos_token_id.ok_or(Error::NoBosToken)?;
            if ids.first() != Some(&(bos as i32)) {
                ids.insert(0, bos as i32);
            }
        }

        Ok(ids)
    }

    /// Decode a sequence of token ids back into text.
    pub fn decode(&self, ids: &[i32]) -> Result<String, Error> {
        let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        self.inner
            .decode(&ids, /* skip_special_tokens = */ false)
            .map_err(|e| Error::Decode(e.to_string()))
    }

    /// The vocabulary size reported by the tokenizer itself, useful as a
    /// cross-check against [`smartmask::ModelShape::vocab_size`] (which is
    /// instead derived from the logits tensor's shape).
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Hugging Face tokenizers don't have a single canonical "BOS token"
/// field; the closest proxy available through the public API is a token
/// named `<s>` or `<bos>`, which covers the SentencePiece/BPE tokenizers
/// this crate is expected to see in practice.
fn find_bos_token_id(tokenizer: &HfTokenizer) -> Option<u32> {
    ["<s>", "<bos>", "<|begin_of_text|>"]
        .iter()
        .find_map(|candidate| tokenizer.token_to_id(candidate))
}
