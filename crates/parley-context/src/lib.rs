//! Parley conversation sessions
//!
//! This crate provides:
//! - Chained conversation sessions with an inherited system instruction
//! - Token-budgeted context windows that drop the oldest exchanges first
//! - Session storage in a directory of JSON documents

pub mod error;
pub mod persist;
pub mod session;
pub mod store;
pub mod tokenizer;
pub mod window;

pub use error::{ContextError, ContextResult, ErrorKind};
pub use persist::{JsonDirRepository, MemoryRepository, SessionRepository};
pub use session::{CallOutcome, Session, SessionId, SessionRecord};
pub use store::{CallRequest, SessionStore};
pub use tokenizer::{EstimateTokenizer, TiktokenTokenizer, Tokenizer};
pub use window::{Conversation, Window};

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{ContextError, ContextResult, ErrorKind};
    pub use crate::persist::{JsonDirRepository, SessionRepository};
    pub use crate::session::{CallOutcome, SessionId};
    pub use crate::store::{CallRequest, SessionStore};
    pub use crate::tokenizer::{TiktokenTokenizer, Tokenizer};
}
