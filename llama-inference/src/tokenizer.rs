//! Tokenizer for byte-level BPE language models.
//!
//! - Builds the vocabulary, merge ranks and special tokens from GGUF `tokenizer.ggml.*` metadata.
//! - Encodes text by matching special tokens verbatim, splitting the rest with the Llama 3
//!   pre-tokenizer pattern and applying rank-ordered BPE merges over GPT-2 style byte symbols.
//! - Decodes token IDs back to text, replacing invalid UTF-8 sequences.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tokenizer_test;

use crate::gguf::GgufFile;
use anyhow::{Context, Result};
use fancy_regex::Regex;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};

const GPT2_MODEL: &str = "gpt2";
const CONTROL_TOKEN_TYPE: i64 = 3;
const USER_DEFINED_TOKEN_TYPE: i64 = 4;
/// Vocabulary entries from this id on are special when the file carries no token types.
const BASE_TOKENS: usize = 128000;
/// Splits text into contractions, words, numbers of up to three digits, punctuation and whitespace.
const LLAMA_3_PATTERN: &str = concat!(
    r"(?i:'s|'t|'re|'ve|'m|'ll|'d)",
    r"|[^\r\n\p{L}\p{N}]?\p{L}+",
    r"|\p{N}{1,3}",
    r"| ?[^\s\p{L}\p{N}]+[\r\n]*",
    r"|\s*[\r\n]+",
    r"|\s+(?!\S)",
    r"|\s+",
);

/// Text to token conversion used by the chat formatter and the generation loop.
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Vec<usize>;

    fn decode(&self, tokens: &[usize]) -> String;

    fn special_tokens(&self) -> &HashMap<String, usize>;

    fn is_special_token(&self, token: usize) -> bool;
}

/// Byte-level BPE tokenizer with rank-based merges.
pub struct BpeTokenizer {
    /// Vocabulary: token strings over the byte-to-unicode alphabet
    vocab: Vec<String>,
    token_ids: HashMap<String, usize>,
    /// (left, right) → (rank, merged token)
    merges: HashMap<(usize, usize), (usize, usize)>,
    special_tokens: HashMap<String, usize>,
    special_ids: HashSet<usize>,
    byte_tokens: [Option<usize>; 256],
    byte_decoder: HashMap<char, u8>,
    pre_tokenizer: Regex,
}

impl BpeTokenizer {
    pub fn new(vocab: Vec<String>, merges: &[&str], special_ids: impl IntoIterator<Item = usize>) -> Result<Self> {
        let token_ids = vocab.iter().enumerate().map(|(id, token)| (token.clone(), id)).collect::<HashMap<_, _>>();

        let lookup = |token: &str| token_ids.get(token).copied().with_context(|| format!("Unknown token '{token}'"));
        let merges = merges
            .iter()
            .enumerate()
            .map(|(rank, line)| {
                let (left, right) = line.split_once(' ').with_context(|| format!("Malformed merge: '{line}'"))?;
                let merged = lookup(&format!("{left}{right}"))?;
                Ok(((lookup(left)?, lookup(right)?), (rank, merged)))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let special_ids = special_ids.into_iter().collect::<HashSet<_>>();
        let special_tokens = special_ids
            .iter()
            .map(|&id| {
                let token = vocab.get(id).with_context(|| format!("Special token {id} is out of range"))?;
                Ok((token.clone(), id))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let byte_encoder = bytes_to_unicode();
        let mut byte_tokens = [None; 256];
        for (byte, &ch) in byte_encoder.iter().enumerate() {
            byte_tokens[byte] = token_ids.get(ch.to_string().as_str()).copied();
        }
        let byte_decoder = byte_encoder.iter().enumerate().map(|(byte, &ch)| (ch, byte as u8)).collect();
        let pre_tokenizer = Regex::new(LLAMA_3_PATTERN).context("Failed to compile pre-tokenizer pattern")?;

        Ok(Self { vocab, token_ids, merges, special_tokens, special_ids, byte_tokens, byte_decoder, pre_tokenizer })
    }

    /// Builds the tokenizer from `tokenizer.ggml.*` metadata.
    pub fn from_gguf(file: &GgufFile) -> Result<Self> {
        let model = file.get_str("tokenizer.ggml.model")?;
        if model != GPT2_MODEL {
            anyhow::bail!("Unsupported tokenizer model: '{model}', expected '{GPT2_MODEL}'");
        }

        let vocab = file.get_string_array("tokenizer.ggml.tokens")?.into_iter().map(str::to_string).collect::<Vec<_>>();

        let merges = match file.get("tokenizer.ggml.merges") {
            Some(_) => file.get_string_array("tokenizer.ggml.merges")?,
            None => {
                warn!("Tokenizer has no merges, every byte becomes a token");
                Vec::new()
            }
        };

        let special_ids = match file.get("tokenizer.ggml.token_type").and_then(|value| value.as_array()) {
            Some(types) => types
                .iter()
                .enumerate()
                .filter(|(_, kind)| matches!(kind.as_i64(), Some(CONTROL_TOKEN_TYPE | USER_DEFINED_TOKEN_TYPE)))
                .map(|(id, _)| id)
                .collect::<Vec<_>>(),
            None => (BASE_TOKENS..vocab.len()).collect(),
        };

        let tokenizer = Self::new(vocab, &merges, special_ids).context("Failed to build tokenizer")?;
        debug!("{tokenizer:#?}");

        Ok(tokenizer)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn token_id(&self, token: &str) -> Option<usize> {
        self.token_ids.get(token).copied()
    }

    /// Encodes text that contains no special tokens.
    pub fn encode_ordinary(&self, text: &str, tokens: &mut Vec<usize>) {
        for piece in self.pre_tokenize(text) {
            self.encode_piece(piece, tokens);
        }
    }

    /// Splits text into the pieces that are merged independently.
    ///
    /// When the matcher gives up on a pathological input the unmatched tail becomes one piece.
    pub fn pre_tokenize<'t>(&self, text: &'t str) -> Vec<&'t str> {
        let mut pieces = Vec::new();
        let mut end = 0;

        for found in self.pre_tokenizer.find_iter(text) {
            match found {
                Ok(piece) => {
                    pieces.push(piece.as_str());
                    end = piece.end();
                }
                Err(err) => {
                    warn!("Pre-tokenizer failed at byte {end}: {err}");
                    break;
                }
            }
        }
        if end < text.len() {
            pieces.push(&text[end..]);
        }

        pieces
    }

    fn encode_piece(&self, piece: &str, tokens: &mut Vec<usize>) {
        let mut symbols = Vec::with_capacity(piece.len());
        for byte in piece.bytes() {
            match self.byte_tokens[byte as usize] {
                Some(id) => symbols.push(id),
                None => warn!("Byte {byte:#04x} has no token, skipping"),
            }
        }

        // Repeatedly merge the adjacent pair with the lowest rank until no merges remain.
        loop {
            let best = symbols
                .windows(2)
                .enumerate()
                .filter_map(|(idx, pair)| self.merges.get(&(pair[0], pair[1])).map(|&(rank, id)| (rank, idx, id)))
                .min_by_key(|&(rank, idx, _)| (rank, idx));

            let Some((_, idx, id)) = best else {
                break;
            };

            symbols[idx] = id;
            symbols.remove(idx + 1);
        }

        tokens.extend(symbols);
    }

    fn match_special_token(&self, text: &str) -> Option<(&str, usize)> {
        self.special_tokens
            .iter()
            .filter(|(token, _)| !token.is_empty() && text.starts_with(token.as_str()))
            .max_by_key(|(token, _)| token.len())
            .map(|(token, &id)| (token.as_str(), id))
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<usize> {
        let mut tokens = Vec::new();
        let mut start = 0;
        let mut i = 0;

        while i < text.len() {
            let rest = &text[i..];
            if rest.starts_with('<') {
                if let Some((token, id)) = self.match_special_token(rest) {
                    self.encode_ordinary(&text[start..i], &mut tokens);
                    tokens.push(id);
                    i += token.len();
                    start = i;
                    continue;
                }
            }
            i += rest.chars().next().map_or(1, char::len_utf8);
        }
        self.encode_ordinary(&text[start..], &mut tokens);

        tokens
    }

    fn decode(&self, tokens: &[usize]) -> String {
        let mut bytes = Vec::new();
        for &token in tokens {
            let Some(text) = self.vocab.get(token) else {
                continue;
            };

            for ch in text.chars() {
                match self.byte_decoder.get(&ch) {
                    Some(&byte) => bytes.push(byte),
                    None => bytes.extend_from_slice(ch.encode_utf8(&mut [0; 4]).as_bytes()),
                }
            }
        }

        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn special_tokens(&self) -> &HashMap<String, usize> {
        &self.special_tokens
    }

    fn is_special_token(&self, token: usize) -> bool {
        self.special_ids.contains(&token)
    }
}

impl std::fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenizer")
            .field("vocab_size", &self.vocab.len())
            .field("merges", &self.merges.len())
            .field("special_tokens", &self.special_tokens.len())
            .finish_non_exhaustive()
    }
}

/// GPT-2 mapping of every byte to a printable unicode character.
fn bytes_to_unicode() -> [char; 256] {
    let printable = |b: u8| (b'!'..=b'~').contains(&b) || (0xA1..=0xAC).contains(&b) || (0xAE..=0xFF).contains(&b);

    let mut table = ['\0'; 256];
    let mut next = 0u32;
    for byte in 0..=255u8 {
        table[byte as usize] = if printable(byte) {
            char::from(byte)
        } else {
            let ch = char::from_u32(256 + next).unwrap_or(char::REPLACEMENT_CHARACTER);
            next += 1;
            ch
        };
    }
    table
}

/// Escapes control characters other than newline as `\uXXXX`.
pub fn replace_control_characters(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_control() && ch != '\n' {
            result.push_str(&format!("\\u{:04x}", ch as u32));
        } else {
            result.push(ch);
        }
    }
    result
}
