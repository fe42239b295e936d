//! In-memory session registry.
//!
//! Sessions are keyed by the id of their alarm message. Any message the relay
//! sends on behalf of a session is recorded as a response pointing back at
//! that alarm id, so a reply to either kind of message resolves to the same
//! owner. All state sits behind one mutex; callers only get clones.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{chat::MessageId, session::Session};

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<MessageId, Session>,
    responses: HashMap<MessageId, MessageId>,
    active: Option<MessageId>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: MessageId, session: Session) {
        self.inner.lock().sessions.insert(id, session);
    }

    pub fn get(&self, id: MessageId) -> Option<Session> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    /// Point the active marker at `id`, or clear it with `None`.
    pub fn set_active(&self, id: Option<MessageId>) {
        self.inner.lock().active = id;
    }

    pub fn get_active(&self) -> Option<Session> {
        let inner = self.inner.lock();
        inner.active.and_then(|id| inner.sessions.get(&id).cloned())
    }

    pub fn map_response(&self, response_id: MessageId, owner_id: MessageId) {
        self.inner.lock().responses.insert(response_id, owner_id);
    }

    /// Resolve an alarm id or a relay-sent response id to the owning alarm id.
    pub fn resolve_owner(&self, any_id: MessageId) -> Option<MessageId> {
        let inner = self.inner.lock();
        if inner.sessions.contains_key(&any_id) {
            return Some(any_id);
        }
        inner.responses.get(&any_id).copied()
    }

    pub fn evict(&self, id: MessageId) -> Option<Session> {
        let mut inner = self.inner.lock();
        if inner.active == Some(id) {
            inner.active = None;
        }
        inner.sessions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }
}
