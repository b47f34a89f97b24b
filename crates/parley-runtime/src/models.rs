//! Model Registry
//!
//! Static table of the chat models the proxy can address: wire name,
//! token ceiling, pricing and tokenizer family.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// BPE vocabulary a model tokenizes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerFamily {
    Cl100kBase,
    O200kBase,
    P50kBase,
}

/// Price in US dollars per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Selector name, e.g. `GPT4`.
    pub key: String,
    /// Numeric selector kept for clients that address models by number.
    pub code: u32,
    /// Model name sent to the provider.
    pub wire_name: String,
    /// Maximum tokens (system + turns) accepted in one request.
    pub token_limit: usize,
    pub pricing: Pricing,
    pub tokenizer: TokenizerFamily,
}

impl ModelSpec {
    pub fn new(
        key: impl Into<String>,
        code: u32,
        wire_name: impl Into<String>,
        token_limit: usize,
        pricing: Pricing,
        tokenizer: TokenizerFamily,
    ) -> Self {
        Self {
            key: key.into(),
            code,
            wire_name: wire_name.into(),
            token_limit,
            pricing,
            tokenizer,
        }
    }

    pub fn estimate_cost(&self, tokens: usize, direction: Direction) -> f64 {
        let per_1k = match direction {
            Direction::Input => self.pricing.input_per_1k,
            Direction::Output => self.pricing.output_per_1k,
        };
        (tokens as f64 / 1000.0) * per_1k
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model '{0}' is not valid")]
    Unknown(String),
    #[error("model '{0}' must have a non-zero token limit")]
    InvalidLimit(String),
}

/// Lookup table from selector to [`ModelSpec`].
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<ModelSpec>,
}

const fn pricing(input_per_1k: f64, output_per_1k: f64) -> Pricing {
    Pricing {
        input_per_1k,
        output_per_1k,
    }
}

impl ModelRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the models the proxy ships with.
    pub fn builtin() -> Self {
        use TokenizerFamily::{Cl100kBase, O200kBase};

        let models = vec![
            ModelSpec::new("GPT3_5", 0, "gpt-3.5-turbo", 4096, pricing(0.0015, 0.002), Cl100kBase),
            ModelSpec::new("GPT3_5_0301", 1, "gpt-3.5-turbo-0301", 4096, pricing(0.0015, 0.002), Cl100kBase),
            ModelSpec::new("GPT4", 2, "gpt-4", 8192, pricing(0.03, 0.06), Cl100kBase),
            ModelSpec::new("GPT4_0314", 3, "gpt-4-0314", 8192, pricing(0.03, 0.06), Cl100kBase),
            ModelSpec::new("GPT4_32K", 4, "gpt-4-32k", 32768, pricing(0.06, 0.12), Cl100kBase),
            ModelSpec::new("GPT4_32K_0314", 5, "gpt-4-32k-0314", 32768, pricing(0.06, 0.12), Cl100kBase),
            ModelSpec::new("GPT4O", 6, "gpt-4o", 128_000, pricing(0.0025, 0.01), O200kBase),
            ModelSpec::new("GPT4O_MINI", 7, "gpt-4o-mini", 128_000, pricing(0.000_15, 0.0006), O200kBase),
            ModelSpec::new("DEEPSEEK_CHAT", 8, "deepseek-chat", 65_536, pricing(0.000_27, 0.0011), Cl100kBase),
            ModelSpec::new("DEEPSEEK_REASONER", 9, "deepseek-reasoner", 65_536, pricing(0.000_55, 0.002_19), Cl100kBase),
        ];

        Self { models }
    }

    /// Add a model, replacing any entry with the same key.
    pub fn register(&mut self, spec: ModelSpec) -> Result<(), ModelError> {
        if spec.token_limit == 0 {
            return Err(ModelError::InvalidLimit(spec.key));
        }
        self.models.retain(|existing| existing.key != spec.key);
        self.models.push(spec);
        Ok(())
    }

    /// Resolve a selector: key (`GPT4`, case-insensitive), numeric code (`2`)
    /// or wire name (`gpt-4`).
    pub fn resolve(&self, selector: &str) -> Result<&ModelSpec, ModelError> {
        let selector = selector.trim();
        let by_code = selector
            .parse::<u32>()
            .ok()
            .and_then(|code| self.models.iter().find(|m| m.code == code));

        by_code
            .or_else(|| {
                self.models
                    .iter()
                    .find(|m| m.key.eq_ignore_ascii_case(selector))
            })
            .or_else(|| self.models.iter().find(|m| m.wire_name == selector))
            .ok_or_else(|| ModelError::Unknown(selector.to_string()))
    }

    /// List all registered model keys
    pub fn keys(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.key.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
