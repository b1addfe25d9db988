use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AdvisorResult;
use crate::models::ChatTurn;
use crate::pipeline::{AdvisorBackend, Reply};

/// Sessions untouched for this long are dropped by the HTTP surface.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// One student's conversation. History is append-only until cleared.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: Uuid,
    history: Vec<ChatTurn>,
    previous_response_id: Option<String>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            history: Vec::new(),
            previous_response_id: None,
        }
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    /// Continuity id for the hosted backend, from the last answered turn.
    pub fn previous_response_id(&self) -> Option<&str> {
        self.previous_response_id.as_deref()
    }

    /// Records a completed exchange. Both turns are appended together or not at all.
    pub fn record(&mut self, question: &str, answer: &str) {
        self.history.push(ChatTurn::user(question.trim()));
        self.history.push(ChatTurn::assistant(answer));
    }

    pub fn record_reply(&mut self, question: &str, reply: &Reply) {
        self.record(question, &reply.text);
        if let Some(id) = &reply.response_id {
            self.previous_response_id = Some(id.clone());
        }
    }

    /// Asks the backend and records the exchange on success.
    pub async fn ask(&mut self, backend: &AdvisorBackend, question: &str) -> AdvisorResult<String> {
        let reply = backend.reply(question, self.previous_response_id()).await?;
        self.record_reply(question, &reply);
        Ok(reply.text)
    }

    /// Starts over: history and hosted continuity are both dropped.
    pub fn clear(&mut self) {
        self.history.clear();
        self.previous_response_id = None;
    }
}

struct Entry {
    session: ChatSession,
    last_active: Instant,
}

/// Process-local sessions for the HTTP surface. Sessions are never shared
/// between students, and idle ones are swept on every access.
pub struct SessionStore {
    sessions: Mutex<HashMap<Uuid, Entry>>,
    idle_ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_idle_ttl(DEFAULT_IDLE_TTL)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_ttl,
        }
    }

    fn sweep(&self, sessions: &mut HashMap<Uuid, Entry>) {
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|_, entry| now.duration_since(entry.last_active) < self.idle_ttl);
        let expired = before - sessions.len();
        if expired > 0 {
            tracing::debug!("Expired {} idle sessions", expired);
        }
    }

    pub fn create(&self) -> Uuid {
        let session = ChatSession::new();
        let id = session.id;
        let mut sessions = self.sessions.lock();
        self.sweep(&mut sessions);
        sessions.insert(
            id,
            Entry {
                session,
                last_active: Instant::now(),
            },
        );
        tracing::debug!("Created session {}", id);
        id
    }

    pub fn exists(&self, id: Uuid) -> bool {
        let mut sessions = self.sessions.lock();
        self.sweep(&mut sessions);
        sessions.contains_key(&id)
    }

    pub fn history(&self, id: Uuid) -> Option<Vec<ChatTurn>> {
        let mut sessions = self.sessions.lock();
        self.sweep(&mut sessions);
        sessions.get_mut(&id).map(|entry| {
            entry.last_active = Instant::now();
            entry.session.history().to_vec()
        })
    }

    pub fn previous_response_id(&self, id: Uuid) -> Option<String> {
        let mut sessions = self.sessions.lock();
        self.sweep(&mut sessions);
        sessions
            .get(&id)
            .and_then(|entry| entry.session.previous_response_id().map(str::to_string))
    }

    /// Returns false if the session no longer exists.
    pub fn record(&self, id: Uuid, question: &str, reply: &Reply) -> bool {
        let mut sessions = self.sessions.lock();
        self.sweep(&mut sessions);
        match sessions.get_mut(&id) {
            Some(entry) => {
                entry.session.record_reply(question, reply);
                entry.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn end(&self, id: Uuid) -> bool {
        let removed = self.sessions.lock().remove(&id).is_some();
        if removed {
            tracing::debug!("Ended session {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        let mut sessions = self.sessions.lock();
        self.sweep(&mut sessions);
        sessions.len()
    }
}
