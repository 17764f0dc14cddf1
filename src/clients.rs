//! Directory of currently connected, named sessions
//!
//! Used to enforce unique names at handshake time and to reach an owner's
//! connection for NOTIFY pushes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use uuid::Uuid;

/// Writes to one connection. Every reply unit and every NOTIFY push holds this
/// lock for its whole duration so frames from different tasks never interleave.
pub type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub name: String,
    pub writer: SharedWriter,
}

#[derive(Default)]
pub struct ConnectedClients {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl ConnectedClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session unless its name is already taken.
    pub fn try_register(&self, handle: SessionHandle) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&handle.name) {
            return false;
        }
        sessions.insert(handle.name.clone(), handle);
        true
    }

    /// Remove `name` only if it still belongs to session `id`.
    pub fn unregister(&self, name: &str, id: Uuid) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(name) {
            Some(h) if h.id == id => {
                sessions.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: &str) -> SessionHandle {
        let sink: Box<dyn AsyncWrite + Send + Unpin> = Box::new(tokio::io::sink());
        SessionHandle {
            id: Uuid::new_v4(),
            name: name.to_string(),
            writer: Arc::new(tokio::sync::Mutex::new(sink)),
        }
    }

    #[test]
    fn test_names_are_unique() {
        let clients = ConnectedClients::new();
        assert!(clients.try_register(handle("alice")));
        assert!(!clients.try_register(handle("alice")));
        assert!(clients.try_register(handle("bob")));
        assert_eq!(clients.names(), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_unregister_only_own_session() {
        let clients = ConnectedClients::new();
        let first = handle("alice");
        let first_id = first.id;
        assert!(clients.try_register(first));
        assert!(!clients.unregister("alice", Uuid::new_v4()));
        assert!(clients.contains("alice"));
        assert!(clients.unregister("alice", first_id));
        assert!(clients.is_empty());
        assert!(clients.lookup("alice").is_none());
    }
}
