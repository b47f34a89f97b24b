//! Completion client implementations for concrete chat APIs.

pub mod openai;

pub use openai::OpenAIClient;
