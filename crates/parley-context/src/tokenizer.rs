//! Token counting

use parley_runtime::TokenizerFamily;
use tiktoken_rs::CoreBPE;

use crate::error::{ContextError, ContextResult};

/// Deterministic token counter for a tokenizer family.
pub trait Tokenizer: Send + Sync {
    fn count(&self, family: TokenizerFamily, text: &str) -> usize;
}

/// Exact counts using the BPE vocabularies shipped with `tiktoken-rs`.
pub struct TiktokenTokenizer {
    cl100k: CoreBPE,
    o200k: CoreBPE,
    p50k: CoreBPE,
}

impl TiktokenTokenizer {
    pub fn new() -> ContextResult<Self> {
        Ok(Self {
            cl100k: load(tiktoken_rs::cl100k_base())?,
            o200k: load(tiktoken_rs::o200k_base())?,
            p50k: load(tiktoken_rs::p50k_base())?,
        })
    }

    fn bpe(&self, family: TokenizerFamily) -> &CoreBPE {
        match family {
            TokenizerFamily::Cl100kBase => &self.cl100k,
            TokenizerFamily::O200kBase => &self.o200k,
            TokenizerFamily::P50kBase => &self.p50k,
        }
    }
}

fn load<E: std::fmt::Display>(result: Result<CoreBPE, E>) -> ContextResult<CoreBPE> {
    result.map_err(|err| ContextError::Tokenizer(err.to_string()))
}

impl Tokenizer for TiktokenTokenizer {
    fn count(&self, family: TokenizerFamily, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe(family).encode_ordinary(text).len()
    }
}

/// Cheap approximation (about 4 bytes per token), family-agnostic.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateTokenizer;

impl Tokenizer for EstimateTokenizer {
    fn count(&self, _family: TokenizerFamily, text: &str) -> usize {
        if text.is_empty() {
            0
        } else {
            (text.len() / 4).max(1)
        }
    }
}
