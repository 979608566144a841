// Copyright 2024 WinMux Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The process-wide session table: a concurrent `id -> Session` map and a
//! `name -> id` index, kept mutually consistent across `create`/`remove`.
//!
//! `libshpool`'s equivalent (`daemon::server::Server`) keeps its session
//! table behind a single `Mutex<HashMap<...>>`; here we use `dashmap`'s
//! sharded concurrent maps instead, since the external interface promises
//! per-key operations without a global lock (grounded in how the pack's
//! `VibeAround`/`maestro` session tables are built).

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use winmux_protocol::SessionSummary;

use crate::config::Config;
use crate::pty::PtyError;
use crate::session::{CreateSessionRequest, Session};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session limit of {0} reached")]
    LimitReached(usize),
    #[error(transparent)]
    Pty(#[from] PtyError),
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    names: DashMap<String, String>,
    config: Config,
}

impl SessionRegistry {
    pub fn new(config: Config) -> Self {
        SessionRegistry { sessions: DashMap::new(), names: DashMap::new(), config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Summaries ordered by `created_at` ascending, per the `List` request
    /// contract.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> =
            self.sessions.iter().map(|entry| entry.value().summary()).collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Look up by id first, then by name.
    pub fn get(&self, id_or_name: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.sessions.get(id_or_name) {
            return Some(session.clone());
        }
        let id = self.names.get(id_or_name)?.clone();
        self.sessions.get(&id).map(|entry| entry.clone())
    }

    pub fn create(&self, request: CreateSessionRequest) -> Result<Arc<Session>, RegistryError> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(RegistryError::LimitReached(self.config.max_sessions));
        }
        let session = Session::create(request, &self.config)?;
        self.insert(session.clone());
        Ok(session)
    }

    fn insert(&self, session: Arc<Session>) {
        self.names.insert(session.name().to_string(), session.id().to_string());
        self.sessions.insert(session.id().to_string(), session);
    }

    /// Remove a session from both maps. A no-op if it's already gone.
    pub fn remove(&self, session: &Session) {
        self.sessions.remove(session.id());
        self.names.remove(session.name());
    }
}

#[cfg(test)]
impl SessionRegistry {
    /// Bypasses `Session::create`'s PTY spawn so interleaved create/remove
    /// consistency (Testable Property 5) can be exercised without a real
    /// pseudoconsole.
    fn insert_bare_for_test(&self, id: &str, name: &str) -> Arc<Session> {
        let session = Session::new_bare_for_test(id, name, self.config.buffer_size);
        self.insert(session.clone());
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_lists_nothing() {
        let registry = SessionRegistry::new(Config::default());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn lookup_by_unknown_id_or_name_is_none() {
        let registry = SessionRegistry::new(Config::default());
        assert!(registry.get("nope").is_none());
    }

    fn names_are_consistent(registry: &SessionRegistry) {
        for entry in registry.names.iter() {
            let id = entry.value();
            assert!(
                registry.sessions.contains_key(id),
                "name {:?} points at missing session {:?}",
                entry.key(),
                id
            );
        }
    }

    /// Testable Property 5: after any interleaving of `create` and
    /// `remove`, every key in the name index points to a key in the
    /// session map.
    #[test]
    fn interleaved_create_and_remove_keeps_name_index_consistent() {
        let registry = SessionRegistry::new(Config::default());

        let s0 = registry.insert_bare_for_test("id-0", "s0");
        let s1 = registry.insert_bare_for_test("id-1", "s1");
        registry.remove(&s0);
        let s2 = registry.insert_bare_for_test("id-2", "s2");
        let _s3 = registry.insert_bare_for_test("id-3", "s3");
        registry.remove(&s1);
        registry.remove(&s2);
        let _s4 = registry.insert_bare_for_test("id-4", "s4");

        names_are_consistent(&registry);
        assert_eq!(registry.list().len(), 2);
        assert!(registry.get("s0").is_none());
        assert!(registry.get("id-4").is_some());
    }
}
