//! Conversation session nodes
//!
//! A conversation is a chain of [`Session`] nodes, each pointing at its
//! predecessor. Only the root carries the system instruction; every other
//! node inherits it by walking `previous` links back to the root.

use std::collections::HashMap;

use parley_runtime::{
    Completion, CompletionClient, Direction, ModelSpec, TokenizerFamily, Turn,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ContextError, ContextResult};
use crate::store::SessionStore;
use crate::tokenizer::Tokenizer;
use crate::window::{Conversation, Window};

pub type SessionId = u64;

/// Persisted form of a session, one JSON document per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub system_msg: Option<String>,
    pub previous: Option<SessionId>,
    pub user_message: String,
    pub assistant_message: Option<String>,
    pub user_name: Option<String>,
    pub assistant_name: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

impl SessionRecord {
    pub fn root(
        id: SessionId,
        system_msg: impl Into<String>,
        user_message: impl Into<String>,
        user_name: Option<String>,
        assistant_name: Option<String>,
    ) -> Self {
        Self {
            id,
            system_msg: Some(system_msg.into()),
            previous: None,
            user_message: user_message.into(),
            assistant_message: None,
            user_name,
            assistant_name,
            reasoning_content: None,
        }
    }

    pub fn continuation(
        id: SessionId,
        previous: SessionId,
        user_message: impl Into<String>,
        reply: Completion,
        user_name: Option<String>,
        assistant_name: Option<String>,
    ) -> Self {
        Self {
            id,
            system_msg: None,
            previous: Some(previous),
            user_message: user_message.into(),
            assistant_message: Some(reply.content),
            user_name,
            assistant_name,
            reasoning_content: reply.reasoning_content,
        }
    }
}

/// Result of one successful conversation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub reply: String,
    pub reasoning_content: Option<String>,
    /// Tokens of the window the provider accepted.
    pub token_in: usize,
    pub token_out: usize,
    /// Node holding this turn; pass it back to continue the conversation.
    pub session_id: SessionId,
    /// Whether the node reached durable storage.
    pub persisted: bool,
}

#[derive(Debug, Default)]
struct CachedCounts {
    system: Option<usize>,
    turns: Vec<Option<usize>>,
}

/// Token counts memoized per tokenizer family, aligned with the node's turns.
#[derive(Debug, Default)]
struct TokenCache {
    families: HashMap<TokenizerFamily, CachedCounts>,
}

impl TokenCache {
    fn system(&mut self, family: TokenizerFamily, text: &str, tokenizer: &dyn Tokenizer) -> usize {
        let counts = self.families.entry(family).or_default();
        *counts
            .system
            .get_or_insert_with(|| tokenizer.count(family, text))
    }

    fn turn(
        &mut self,
        family: TokenizerFamily,
        index: usize,
        text: &str,
        tokenizer: &dyn Tokenizer,
    ) -> usize {
        let counts = self.families.entry(family).or_default();
        if counts.turns.len() <= index {
            counts.turns.resize(index + 1, None);
        }
        *counts.turns[index].get_or_insert_with(|| tokenizer.count(family, text))
    }

    fn seed_turns(&mut self, family: TokenizerFamily, known: &[usize]) {
        let counts = self.families.entry(family).or_default();
        counts.turns = known.iter().copied().map(Some).collect();
    }

    fn seed_system(&mut self, family: TokenizerFamily, tokens: usize) {
        self.families.entry(family).or_default().system = Some(tokens);
    }

    fn invalidate_system(&mut self) {
        for counts in self.families.values_mut() {
            counts.system = None;
        }
    }
}

struct SessionState {
    system_instruction: Option<String>,
    assistant_message: Option<String>,
    reasoning_content: Option<String>,
    tokens: TokenCache,
}

/// Input of one continuation.
pub(crate) struct Continuation<'a> {
    pub text: String,
    pub model: &'a ModelSpec,
    pub override_system: Option<String>,
    pub user_name: Option<String>,
    pub assistant_name: Option<String>,
}

/// One node of a conversation chain.
///
/// Identity and the user turn never change after construction. Everything
/// that does change lives behind the node's own lock, which is held for the
/// whole of a call so one node never serves two requests at once.
pub struct Session {
    id: SessionId,
    previous: Option<SessionId>,
    user_message: String,
    user_name: Option<String>,
    assistant_name: Option<String>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build a node from its record.
    ///
    /// Exactly one of `system_msg` and `previous` must be set; anything else
    /// is corrupt data and fails as an invariant violation.
    pub fn from_record(record: SessionRecord) -> ContextResult<Self> {
        if record.system_msg.is_some() == record.previous.is_some() {
            return Err(ContextError::invariant(format!(
                "session {}: previous and system_msg are exclusive and exactly one must be set",
                record.id
            )));
        }

        Ok(Self {
            id: record.id,
            previous: record.previous,
            user_message: record.user_message,
            user_name: record.user_name,
            assistant_name: record.assistant_name,
            state: Mutex::new(SessionState {
                system_instruction: record.system_msg,
                assistant_message: record.assistant_message,
                reasoning_content: record.reasoning_content,
                tokens: TokenCache::default(),
            }),
        })
    }

    fn with_cached_turns(mut self, family: TokenizerFamily, counts: &[usize]) -> Self {
        self.state.get_mut().tokens.seed_turns(family, counts);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn previous(&self) -> Option<SessionId> {
        self.previous
    }

    pub fn is_root(&self) -> bool {
        self.previous.is_none()
    }

    pub async fn is_answered(&self) -> bool {
        self.state.lock().await.assistant_message.is_some()
    }

    /// This node's turns: the user message and, once answered, the reply.
    pub async fn turns(&self) -> Vec<Turn> {
        let state = self.state.lock().await;
        let mut turns = vec![Turn::user(self.user_message.clone(), self.user_name.clone())];
        if let Some(reply) = &state.assistant_message {
            turns.push(Turn::assistant(reply.clone(), self.assistant_name.clone()));
        }
        turns
    }

    pub async fn record(&self) -> SessionRecord {
        let state = self.state.lock().await;
        self.record_from(&state)
    }

    fn record_from(&self, state: &SessionState) -> SessionRecord {
        SessionRecord {
            id: self.id,
            system_msg: state.system_instruction.clone(),
            previous: self.previous,
            user_message: self.user_message.clone(),
            assistant_message: state.assistant_message.clone(),
            user_name: self.user_name.clone(),
            assistant_name: self.assistant_name.clone(),
            reasoning_content: state.reasoning_content.clone(),
        }
    }

    fn system_part(
        &self,
        state: &mut SessionState,
        family: TokenizerFamily,
        tokenizer: &dyn Tokenizer,
    ) -> ContextResult<(String, usize)> {
        let system = state.system_instruction.clone().ok_or_else(|| {
            ContextError::invariant(format!("root session {} has no system instruction", self.id))
        })?;
        let tokens = state.tokens.system(family, &system, tokenizer);
        Ok((system, tokens))
    }

    /// Unanswered nodes contribute nothing, so history is always whole pairs.
    fn append_pair(
        &self,
        state: &mut SessionState,
        family: TokenizerFamily,
        tokenizer: &dyn Tokenizer,
        conversation: &mut Conversation,
    ) {
        let Some(reply) = state.assistant_message.clone() else {
            return;
        };

        let user_tokens = state.tokens.turn(family, 0, &self.user_message, tokenizer);
        let reply_tokens = state.tokens.turn(family, 1, &reply, tokenizer);
        conversation.turns.push(Turn::user(
            self.user_message.clone(),
            self.user_name.clone(),
        ));
        conversation
            .turns
            .push(Turn::assistant(reply, self.assistant_name.clone()));
        conversation.turn_tokens.extend([user_tokens, reply_tokens]);
    }

    /// Materialize the chain ending at this node, root first.
    ///
    /// Ancestors are locked one at a time, always after this node's lock.
    async fn history(
        &self,
        store: &SessionStore,
        state: &mut SessionState,
        family: TokenizerFamily,
    ) -> ContextResult<Conversation> {
        let tokenizer = store.tokenizer();
        let ancestors = store.ancestors(self).await?;

        let mut conversation = Conversation {
            system: String::new(),
            system_tokens: 0,
            turns: Vec::new(),
            turn_tokens: Vec::new(),
        };
        let mut system = None;

        for ancestor in &ancestors {
            let mut ancestor_state = ancestor.state.lock().await;
            if ancestor.is_root() {
                system = Some(ancestor.system_part(&mut ancestor_state, family, tokenizer)?);
            }
            ancestor.append_pair(&mut ancestor_state, family, tokenizer, &mut conversation);
        }
        if self.is_root() {
            system = Some(self.system_part(state, family, tokenizer)?);
        }
        self.append_pair(state, family, tokenizer, &mut conversation);

        let (system, system_tokens) = system.ok_or_else(|| {
            ContextError::invariant(format!("session {} has no root in its chain", self.id))
        })?;
        conversation.system = system;
        conversation.system_tokens = system_tokens;
        Ok(conversation)
    }

    async fn prepare(
        &self,
        store: &SessionStore,
        state: &mut SessionState,
        text: &str,
        user_name: Option<String>,
        model: &ModelSpec,
    ) -> ContextResult<Conversation> {
        let mut conversation = self.history(store, state, model.tokenizer).await?;
        let tokens = store.tokenizer().count(model.tokenizer, text);
        conversation.turns.push(Turn::user(text, user_name));
        conversation.turn_tokens.push(tokens);
        Ok(conversation)
    }

    /// Window that a continuation with `text` would send, without calling out.
    pub(crate) async fn plan(
        &self,
        store: &SessionStore,
        text: &str,
        model: &ModelSpec,
    ) -> ContextResult<Window> {
        let mut state = self.state.lock().await;
        let conversation = self
            .prepare(store, &mut state, text, self.user_name.clone(), model)
            .await?;
        Ok(conversation.fit(model.token_limit))
    }

    /// Continue the conversation at this node. The reply is stored in a new
    /// child node; this node is left untouched apart from an optional
    /// system-instruction override, which is only kept once the call succeeds.
    pub(crate) async fn continue_with(
        &self,
        store: &SessionStore,
        request: Continuation<'_>,
    ) -> ContextResult<CallOutcome> {
        let mut state = self.state.lock().await;
        let model = request.model;
        let family = model.tokenizer;

        if !store.is_registered(self).await {
            return Err(ContextError::NotFound(self.id));
        }
        if self.is_root() && state.assistant_message.is_none() && !self.user_message.is_empty() {
            return Err(ContextError::InvalidRequest(format!(
                "session {} is still waiting for its first reply",
                self.id
            )));
        }
        if request.override_system.is_some() {
            self.check_override(store).await?;
        }

        let user_name = request.user_name.or_else(|| self.user_name.clone());
        let assistant_name = request
            .assistant_name
            .or_else(|| self.assistant_name.clone());
        let mut conversation = self
            .prepare(store, &mut state, &request.text, user_name.clone(), model)
            .await?;
        if let Some(system) = &request.override_system {
            conversation.system_tokens = store.tokenizer().count(family, system);
            conversation.system = system.clone();
        }

        let (reply, window) =
            complete_within_budget(store.client(), self.id, &conversation, model).await?;
        let user_tokens = conversation.turn_tokens.last().copied().unwrap_or_default();
        let token_out = store.tokenizer().count(family, &reply.content);
        log_usage(self.id, model, window.input_tokens, Direction::Input);
        log_usage(self.id, model, token_out, Direction::Output);

        let mut persisted = true;
        if let Some(system) = request.override_system {
            state.system_instruction = Some(system);
            state.tokens.invalidate_system();
            state
                .tokens
                .seed_system(family, conversation.system_tokens);
            persisted = store.persist(&self.record_from(&state)).await;
            info!(session_id = self.id, "system instruction overridden");
        }

        let outcome_reply = reply.clone();
        let (child, record) = store
            .insert_with(|id| {
                let record = SessionRecord::continuation(
                    id,
                    self.id,
                    request.text,
                    reply,
                    user_name,
                    assistant_name,
                );
                let session = Session::from_record(record.clone())?
                    .with_cached_turns(family, &[user_tokens, token_out]);
                Ok((session, record))
            })
            .await?;
        persisted &= store.persist(&record).await;
        debug!(session_id = self.id, child = child.id(), "conversation continued");

        Ok(CallOutcome {
            reply: outcome_reply.content,
            reasoning_content: outcome_reply.reasoning_content,
            token_in: window.input_tokens,
            token_out,
            session_id: child.id(),
            persisted,
        })
    }

    /// First call on a fresh root: its own user message is the request and the
    /// reply is filled in place. A failed first call unregisters the root
    /// before its lock is released.
    pub(crate) async fn answer(
        &self,
        store: &SessionStore,
        model: &ModelSpec,
    ) -> ContextResult<CallOutcome> {
        let mut state = self.state.lock().await;
        let result = self.answer_locked(store, &mut state, model).await;
        if result.is_err() {
            store.discard(self).await;
        }
        result
    }

    async fn answer_locked(
        &self,
        store: &SessionStore,
        state: &mut SessionState,
        model: &ModelSpec,
    ) -> ContextResult<CallOutcome> {
        let tokenizer = store.tokenizer();
        let family = model.tokenizer;

        if state.assistant_message.is_some() {
            return Err(ContextError::InvalidRequest(format!(
                "session {} is already answered",
                self.id
            )));
        }
        let (system, system_tokens) = self.system_part(state, family, tokenizer)?;
        let user_tokens = state.tokens.turn(family, 0, &self.user_message, tokenizer);
        let conversation = Conversation {
            system,
            system_tokens,
            turns: vec![Turn::user(self.user_message.clone(), self.user_name.clone())],
            turn_tokens: vec![user_tokens],
        };

        let (reply, window) =
            complete_within_budget(store.client(), self.id, &conversation, model).await?;
        let token_out = state.tokens.turn(family, 1, &reply.content, tokenizer);
        log_usage(self.id, model, window.input_tokens, Direction::Input);
        log_usage(self.id, model, token_out, Direction::Output);

        state.assistant_message = Some(reply.content.clone());
        state.reasoning_content = reply.reasoning_content.clone();
        let record = self.record_from(state);
        let persisted = store.persist(&record).await;

        Ok(CallOutcome {
            reply: reply.content,
            reasoning_content: reply.reasoning_content,
            token_in: window.input_tokens,
            token_out,
            session_id: self.id,
            persisted,
        })
    }

    /// Only a root without continuations may replace its system instruction.
    async fn check_override(&self, store: &SessionStore) -> ContextResult<()> {
        if !self.is_root() {
            return Err(ContextError::InvalidRequest(format!(
                "session {} inherits its system instruction and cannot override it",
                self.id
            )));
        }
        if store.has_children(self.id).await {
            return Err(ContextError::InvalidRequest(format!(
                "session {} already has continuations; its system instruction is fixed",
                self.id
            )));
        }
        Ok(())
    }
}

/// Call the client, dropping the oldest pair each time the provider reports
/// the context as too long, until the window cannot shrink any further.
async fn complete_within_budget(
    client: &dyn CompletionClient,
    session_id: SessionId,
    conversation: &Conversation,
    model: &ModelSpec,
) -> ContextResult<(Completion, Window)> {
    let mut window = conversation.fit(model.token_limit);
    debug!(
        session_id,
        provider = client.name(),
        cut = window.cut,
        kept = window.kept(),
        tokens = window.input_tokens,
        ceiling = model.token_limit,
        "context window selected"
    );

    loop {
        match client
            .complete(&conversation.system, conversation.kept(&window), model)
            .await
        {
            Ok(reply) => return Ok((reply, window)),
            Err(err) if err.is_context_length() => {
                let Some(next) = conversation.shrink(window) else {
                    warn!(session_id, error = %err, "context too long even for the newest turn alone");
                    return Err(err.into());
                };
                warn!(
                    session_id,
                    cut = next.cut,
                    kept = next.kept(),
                    "content too long, discarding history"
                );
                window = next;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn log_usage(session_id: SessionId, model: &ModelSpec, tokens: usize, direction: Direction) {
    info!(
        session_id,
        model = %model.wire_name,
        direction = direction.as_str(),
        tokens,
        cost_usd = model.estimate_cost(tokens, direction),
        "token usage"
    );
}
