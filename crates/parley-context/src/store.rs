//! Session registry and conversation entry points

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parley_runtime::{CompletionClient, ModelSpec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{ContextError, ContextResult};
use crate::persist::SessionRepository;
use crate::session::{CallOutcome, Continuation, Session, SessionId, SessionRecord};
use crate::tokenizer::Tokenizer;
use crate::window::Window;

/// One conversation call.
///
/// Start a conversation with a system instruction and no session id, or
/// continue one with a session id and no system instruction.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub session_id: Option<SessionId>,
    pub text: String,
    pub model: ModelSpec,
    pub system_instruction: Option<String>,
    pub user_name: Option<String>,
    pub assistant_name: Option<String>,
}

impl CallRequest {
    pub fn new(text: impl Into<String>, model: ModelSpec) -> Self {
        Self {
            session_id: None,
            text: text.into(),
            model,
            system_instruction: None,
            user_name: None,
            assistant_name: None,
        }
    }

    pub fn in_session(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn with_system(mut self, system_instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(system_instruction.into());
        self
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_assistant_name(mut self, name: impl Into<String>) -> Self {
        self.assistant_name = Some(name.into());
        self
    }
}

struct Registry {
    sessions: HashMap<SessionId, Arc<Session>>,
    rng: StdRng,
}

impl Registry {
    fn allocate(&mut self, hint: Option<SessionId>) -> SessionId {
        if let Some(hint) = hint.filter(|id| !self.sessions.contains_key(id)) {
            return hint;
        }
        loop {
            let candidate: SessionId = self.rng.gen();
            if !self.sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn insert(&mut self, session: Session) -> ContextResult<Arc<Session>> {
        match self.sessions.entry(session.id()) {
            Entry::Occupied(_) => Err(ContextError::DuplicateSession(session.id())),
            Entry::Vacant(slot) => Ok(slot.insert(Arc::new(session)).clone()),
        }
    }
}

/// Owns every session of the process.
///
/// The registry lock only guards membership and id allocation. It is never
/// held while a session lock is awaited or while the completion client runs,
/// so unrelated conversations proceed in parallel.
pub struct SessionStore {
    registry: Mutex<Registry>,
    client: Arc<dyn CompletionClient>,
    tokenizer: Arc<dyn Tokenizer>,
    repository: Arc<dyn SessionRepository>,
}

impl SessionStore {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        tokenizer: Arc<dyn Tokenizer>,
        repository: Arc<dyn SessionRepository>,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                rng: StdRng::from_entropy(),
            }),
            client,
            tokenizer,
            repository,
        }
    }

    /// Make id allocation reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.registry.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Build a store and populate it from the repository.
    pub async fn open(
        client: Arc<dyn CompletionClient>,
        tokenizer: Arc<dyn Tokenizer>,
        repository: Arc<dyn SessionRepository>,
    ) -> ContextResult<Self> {
        let store = Self::new(client, tokenizer, repository);
        store.load().await?;
        Ok(store)
    }

    pub(crate) fn client(&self) -> &dyn CompletionClient {
        self.client.as_ref()
    }

    pub(crate) fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    /// Register every stored record. Meant to run once, before serving.
    pub async fn load(&self) -> ContextResult<usize> {
        let records = self.repository.load_all().await?;
        let mut registry = self.registry.lock().await;
        let count = records.len();
        for record in records {
            registry.insert(Session::from_record(record)?)?;
        }
        info!(sessions = count, "sessions loaded");
        Ok(count)
    }

    /// Write every session to the repository.
    pub async fn save(&self) -> ContextResult<usize> {
        let sessions: Vec<Arc<Session>> =
            self.registry.lock().await.sessions.values().cloned().collect();
        for session in &sessions {
            self.repository.save(&session.record().await).await?;
        }
        info!(sessions = sessions.len(), "sessions saved");
        Ok(sessions.len())
    }

    /// An id no registered session uses; `hint` when it is free.
    pub async fn new_id(&self, hint: Option<SessionId>) -> SessionId {
        self.registry.lock().await.allocate(hint)
    }

    /// Register a bare root carrying only a system instruction.
    pub async fn create(
        &self,
        id: SessionId,
        system_instruction: impl Into<String>,
    ) -> ContextResult<()> {
        let record = SessionRecord::root(id, system_instruction, String::new(), None, None);
        self.registry
            .lock()
            .await
            .insert(Session::from_record(record.clone())?)?;
        self.repository.save(&record).await?;
        info!(session_id = id, "session created");
        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.registry.lock().await.sessions.get(&id).cloned()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.registry.lock().await.sessions.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.lock().await.sessions.is_empty()
    }

    /// Start or continue a conversation.
    pub async fn call(&self, request: CallRequest) -> ContextResult<CallOutcome> {
        validate_text(&request.text)?;
        let CallRequest {
            session_id,
            text,
            model,
            system_instruction,
            user_name,
            assistant_name,
        } = request;

        let result = match (session_id, system_instruction) {
            (None, Some(system)) => {
                let root = {
                    let mut registry = self.registry.lock().await;
                    let id = registry.allocate(None);
                    let record = SessionRecord::root(id, system, text, user_name, assistant_name);
                    registry.insert(Session::from_record(record)?)?
                };
                info!(session_id = root.id(), model = %model.key, "conversation started");
                root.answer(self, &model).await
            }
            (Some(id), None) => {
                let session = self.get(id).await.ok_or(ContextError::NotFound(id))?;
                session
                    .continue_with(
                        self,
                        Continuation {
                            text,
                            model: &model,
                            override_system: None,
                            user_name,
                            assistant_name,
                        },
                    )
                    .await
            }
            (None, None) => Err(ContextError::InvalidRequest(
                "a system instruction is required to start a conversation".to_string(),
            )),
            (Some(id), Some(_)) => Err(ContextError::InvalidRequest(format!(
                "session {id} is being continued; a system instruction only applies to new conversations"
            ))),
        };
        report(result)
    }

    /// Continue `request.session_id` when it exists, otherwise start a
    /// conversation under exactly that id with `request.system_instruction`.
    pub async fn call_or_create(&self, request: CallRequest) -> ContextResult<CallOutcome> {
        validate_text(&request.text)?;
        let CallRequest {
            session_id,
            text,
            model,
            system_instruction,
            user_name,
            assistant_name,
        } = request;
        let id = session_id.ok_or_else(|| {
            ContextError::InvalidRequest("a session id is required".to_string())
        })?;

        let (existing, created) = {
            let mut registry = self.registry.lock().await;
            match registry.sessions.get(&id) {
                Some(session) => (Some(session.clone()), None),
                None => {
                    let system = system_instruction.ok_or_else(|| {
                        ContextError::InvalidRequest(format!(
                            "session {id} does not exist and no system instruction was given"
                        ))
                    })?;
                    let record = SessionRecord::root(
                        id,
                        system,
                        text.clone(),
                        user_name.clone(),
                        assistant_name.clone(),
                    );
                    (None, Some(registry.insert(Session::from_record(record)?)?))
                }
            }
        };

        let result = match (existing, created) {
            (_, Some(root)) => {
                info!(session_id = id, model = %model.key, "conversation started");
                root.answer(self, &model).await
            }
            (Some(session), None) => {
                session
                    .continue_with(
                        self,
                        Continuation {
                            text,
                            model: &model,
                            override_system: None,
                            user_name,
                            assistant_name,
                        },
                    )
                    .await
            }
            (None, None) => Err(ContextError::invariant(format!(
                "session {id} neither found nor created"
            ))),
        };
        report(result)
    }

    /// Continue session `id`, optionally replacing its system instruction
    /// first (roots without continuations only).
    pub async fn continue_session(
        &self,
        id: SessionId,
        text: impl Into<String>,
        model: &ModelSpec,
        override_system: Option<String>,
    ) -> ContextResult<CallOutcome> {
        let text = text.into();
        validate_text(&text)?;
        let session = self.get(id).await.ok_or(ContextError::NotFound(id))?;
        let result = session
            .continue_with(
                self,
                Continuation {
                    text,
                    model,
                    override_system,
                    user_name: None,
                    assistant_name: None,
                },
            )
            .await;
        report(result)
    }

    /// The window a continuation of `id` with `text` would send.
    pub async fn plan(
        &self,
        id: SessionId,
        text: &str,
        model: &ModelSpec,
    ) -> ContextResult<Window> {
        validate_text(text)?;
        let session = self.get(id).await.ok_or(ContextError::NotFound(id))?;
        report(session.plan(self, text, model).await)
    }

    /// Whether `session` is still the node registered under its id.
    pub(crate) async fn is_registered(&self, session: &Session) -> bool {
        self.registry
            .lock()
            .await
            .sessions
            .get(&session.id())
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), session))
    }

    /// Unregister `session`, leaving any other node under the same id alone.
    pub(crate) async fn discard(&self, session: &Session) {
        let mut registry = self.registry.lock().await;
        if let Entry::Occupied(slot) = registry.sessions.entry(session.id()) {
            if std::ptr::eq(Arc::as_ptr(slot.get()), session) {
                slot.remove();
                debug!(session_id = session.id(), "unanswered session discarded");
            }
        }
    }

    /// Ancestors of `session`, root first, excluding the session itself.
    pub(crate) async fn ancestors(&self, session: &Session) -> ContextResult<Vec<Arc<Session>>> {
        let registry = self.registry.lock().await;
        let mut seen = HashSet::from([session.id()]);
        let mut chain = Vec::new();
        let mut next = session.previous();

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(ContextError::invariant(format!(
                    "circular reference in the chain of session {} at {id}",
                    session.id()
                )));
            }
            let ancestor = registry.sessions.get(&id).cloned().ok_or_else(|| {
                ContextError::invariant(format!(
                    "cannot find previous session {id} of session {}",
                    session.id()
                ))
            })?;
            next = ancestor.previous();
            chain.push(ancestor);
        }

        chain.reverse();
        Ok(chain)
    }

    pub(crate) async fn has_children(&self, id: SessionId) -> bool {
        self.registry
            .lock()
            .await
            .sessions
            .values()
            .any(|session| session.previous() == Some(id))
    }

    pub(crate) async fn insert_with<F, T>(&self, build: F) -> ContextResult<(Arc<Session>, T)>
    where
        F: FnOnce(SessionId) -> ContextResult<(Session, T)>,
    {
        let mut registry = self.registry.lock().await;
        let id = registry.allocate(None);
        let (session, extra) = build(id)?;
        Ok((registry.insert(session)?, extra))
    }

    /// Best-effort write after a call; failure is logged and reported, not raised.
    pub(crate) async fn persist(&self, record: &SessionRecord) -> bool {
        match self.repository.save(record).await {
            Ok(()) => true,
            Err(err) => {
                error!(session_id = record.id, error = %err, "failed to persist session");
                false
            }
        }
    }
}

fn validate_text(text: &str) -> ContextResult<()> {
    if text.trim().is_empty() {
        return Err(ContextError::InvalidRequest(
            "user text must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn report<T>(result: ContextResult<T>) -> ContextResult<T> {
    if let Err(err) = &result {
        if err.is_fatal() {
            error!(error = %err, "session invariant violated");
        }
    }
    result
}
