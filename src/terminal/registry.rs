//! Session registry: name → session mapping with an active pointer.
//!
//! Insertion order is display order. The active name always resolves; if it
//! ever does not, that is an internal bug surfaced as `BridgeError::Internal`
//! rather than silently falling back to some other session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{BridgeError, BridgeResult};

use super::TerminalSession;

pub const DEFAULT_SESSION: &str = "default";

pub struct SessionRegistry {
    sessions: HashMap<String, Arc<TerminalSession>>,
    order: Vec<String>,
    active: String,
    max_sessions: usize,
}

/// 1-32 chars drawn from letters, digits, hyphen, underscore.
pub fn is_valid_session_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl SessionRegistry {
    /// Create a registry with the bootstrap `default` session rooted at
    /// `initial_cwd`.
    pub fn new(initial_cwd: PathBuf, max_sessions: usize) -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(
            DEFAULT_SESSION.to_string(),
            Arc::new(TerminalSession::new(initial_cwd)),
        );
        Self {
            sessions,
            order: vec![DEFAULT_SESSION.to_string()],
            active: DEFAULT_SESSION.to_string(),
            max_sessions,
        }
    }

    /// Create a named session inheriting the active session's cwd.
    /// Name syntax is checked before existence or the ceiling.
    pub fn create(&mut self, name: &str) -> BridgeResult<Arc<TerminalSession>> {
        if !is_valid_session_name(name) {
            return Err(BridgeError::InvalidSessionName);
        }
        if self.sessions.contains_key(name) {
            return Err(BridgeError::SessionExists(name.to_string()));
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(BridgeError::SessionLimit(self.max_sessions));
        }

        let cwd = self.active()?.cwd();
        let session = Arc::new(TerminalSession::new(cwd));
        self.sessions.insert(name.to_string(), session.clone());
        self.order.push(name.to_string());
        Ok(session)
    }

    pub fn switch_to(&mut self, name: &str) -> BridgeResult<Arc<TerminalSession>> {
        match self.sessions.get(name) {
            Some(session) => {
                self.active = name.to_string();
                Ok(session.clone())
            }
            None => Err(BridgeError::SessionNotFound(name.to_string())),
        }
    }

    pub fn active(&self) -> BridgeResult<Arc<TerminalSession>> {
        self.sessions
            .get(&self.active)
            .cloned()
            .ok_or_else(|| BridgeError::Internal(format!("active session missing: {}", self.active)))
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    /// Ordered (name, running, is_active) triples for display.
    pub fn list(&self) -> Vec<(String, bool, bool)> {
        self.order
            .iter()
            .filter_map(|name| {
                self.sessions.get(name).map(|session| {
                    (
                        name.clone(),
                        session.is_running(),
                        *name == self.active,
                    )
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}
