//! Session registry
//!
//! Owns every session the endpoint knows about. Client sessions form a
//! multimap per identity because a client rebuilding its path briefly
//! holds two; the per-identity "chosen" view is recomputed each tick
//! and stores stable path ids, never references into the containers.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use veilnet_crypto::{PathId, RouterId};

use crate::link::PathSink;
use crate::session::{ExitSession, SnodeSession};
use crate::Timestamp;

/// All live sessions, keyed by identity
#[derive(Default)]
pub struct SessionRegistry {
    active_exits: HashMap<RouterId, Vec<ExitSession>>,
    snode_sessions: HashMap<RouterId, SnodeSession>,
    paths: HashMap<PathId, RouterId>,
    /// Derived per-tick view: best session per identity, by path id
    chosen_exits: HashMap<RouterId, PathId>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a client session, binding its path to the identity
    pub fn insert_exit(&mut self, session: ExitSession) {
        self.paths.insert(session.path_id(), session.remote());
        self.active_exits
            .entry(session.remote())
            .or_default()
            .push(session);
    }

    /// Bind a renegotiated path to an identity.
    ///
    /// Refuses when the path id is already bound; the caller must drop
    /// the old binding first. This keeps one path from being silently
    /// re-pointed at another identity.
    pub fn update_path(&mut self, pk: RouterId, next: PathId) -> bool {
        if self.paths.contains_key(&next) {
            return false;
        }
        self.paths.insert(next, pk);
        true
    }

    /// Drop a path binding
    pub fn unbind_path(&mut self, path: &PathId) {
        self.paths.remove(path);
    }

    /// Identity bound to a path
    pub fn key_for_path(&self, path: &PathId) -> Option<RouterId> {
        self.paths.get(path).copied()
    }

    /// Find the session serving a path.
    ///
    /// Prefers the session actually riding the path; falls back to any
    /// session for the bound identity (the path may have been rebound
    /// mid-renegotiation).
    pub fn find_by_path(&self, path: &PathId) -> Option<&ExitSession> {
        let pk = self.paths.get(path)?;
        let sessions = self.active_exits.get(pk)?;
        sessions
            .iter()
            .find(|s| s.path_id() == *path)
            .or_else(|| sessions.first())
    }

    /// Remove the one session matching (identity, path)
    pub fn remove_exit(&mut self, pk: &RouterId, path: PathId) -> bool {
        let Some(sessions) = self.active_exits.get_mut(pk) else {
            return false;
        };
        let before = sessions.len();
        sessions.retain(|s| s.path_id() != path);
        let removed = sessions.len() < before;
        if sessions.is_empty() {
            self.active_exits.remove(pk);
        }
        if removed {
            self.paths.remove(&path);
            if self.chosen_exits.get(pk) == Some(&path) {
                self.chosen_exits.remove(pk);
            }
        }
        removed
    }

    /// Remove every client session for an identity (LRU kick path)
    pub fn remove_all_for(&mut self, pk: &RouterId) -> usize {
        let Some(sessions) = self.active_exits.remove(pk) else {
            return 0;
        };
        for session in &sessions {
            self.paths.remove(&session.path_id());
        }
        self.chosen_exits.remove(pk);
        sessions.len()
    }

    /// Register an outbound service-node session
    pub fn insert_snode(&mut self, session: SnodeSession) {
        self.snode_sessions.insert(session.remote(), session);
    }

    /// True if we hold an outbound session to this service node
    pub fn has_snode(&self, pk: &RouterId) -> bool {
        self.snode_sessions.contains_key(pk)
    }

    /// Mutable access to a service-node session
    pub fn snode_session_mut(&mut self, pk: &RouterId) -> Option<&mut SnodeSession> {
        self.snode_sessions.get_mut(pk)
    }

    /// Resolve the chosen session for an identity.
    ///
    /// The chosen view stores path ids; resolution re-checks that the
    /// session still exists.
    pub fn chosen_for_mut(&mut self, pk: &RouterId) -> Option<&mut ExitSession> {
        let path = *self.chosen_exits.get(pk)?;
        self.active_exits
            .get_mut(pk)?
            .iter_mut()
            .find(|s| s.path_id() == path)
    }

    /// Remove expired sessions of both kinds
    pub fn expire(&mut self, now: Timestamp) {
        self.snode_sessions.retain(|pk, s| {
            if s.is_expired(now) {
                info!("removing expired snode session with {}", pk);
                false
            } else {
                true
            }
        });

        let paths = &mut self.paths;
        self.active_exits.retain(|pk, sessions| {
            sessions.retain(|s| {
                if s.is_expired(now) {
                    info!("removing expired exit session with {}", pk);
                    paths.remove(&s.path_id());
                    false
                } else {
                    true
                }
            });
            !sessions.is_empty()
        });
    }

    /// Recompute the chosen session per identity: the most recently
    /// established one that does not look dead. Identities whose
    /// sessions all look dead get no entry.
    pub fn rebuild_chosen(&mut self, now: Timestamp) {
        self.chosen_exits.clear();
        for (pk, sessions) in &self.active_exits {
            let mut best: Option<&ExitSession> = None;
            for session in sessions {
                if session.looks_dead(now) {
                    continue;
                }
                let newer = match best {
                    None => true,
                    Some(b) => session.created_at() > b.created_at(),
                };
                if newer {
                    best = Some(session);
                }
            }
            if let Some(best) = best {
                self.chosen_exits.insert(*pk, best.path_id());
            } else if !sessions.is_empty() {
                debug!("no live exit session for {}", pk);
            }
        }
    }

    /// Per-tick upkeep on every client session
    pub fn tick_sessions(&mut self, now: Timestamp) {
        for sessions in self.active_exits.values_mut() {
            for session in sessions {
                session.tick(now);
            }
        }
    }

    /// Flush every client session to the link layer
    pub fn flush_exits(&mut self, links: &dyn PathSink) {
        for (pk, sessions) in &mut self.active_exits {
            for session in sessions {
                if !session.flush(links) {
                    warn!("exit session with {} dropped packets", pk);
                }
            }
        }
    }

    /// Flush every service-node session
    pub fn flush_snodes(&mut self) {
        for (pk, session) in &mut self.snode_sessions {
            if !session.flush() {
                warn!("failed to flush snode traffic to {} via outbound session", pk);
            }
        }
    }

    /// Ask every service-node session to stop
    pub fn stop_snodes(&mut self) {
        for session in self.snode_sessions.values_mut() {
            session.stop();
        }
    }

    /// True once every service-node session has stopped
    pub fn snodes_stopped(&self) -> bool {
        self.snode_sessions.values().all(|s| s.is_stopped())
    }

    /// Total number of client sessions
    pub fn exit_count(&self) -> usize {
        self.active_exits.values().map(Vec::len).sum()
    }

    /// Number of service-node sessions
    pub fn snode_count(&self) -> usize {
        self.snode_sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pk(n: u8) -> RouterId {
        RouterId::from_bytes([n; 32])
    }

    fn path(n: u8) -> PathId {
        PathId::from_bytes([n; 16])
    }

    fn exit_session(k: u8, p: u8, created: Timestamp) -> ExitSession {
        ExitSession::new(pk(k), path(p), false, Ipv4Addr::new(10, 0, 0, k), created)
    }

    #[test]
    fn test_find_by_path() {
        let mut reg = SessionRegistry::new();
        reg.insert_exit(exit_session(1, 10, 0));
        reg.insert_exit(exit_session(1, 11, 5));

        let found = reg.find_by_path(&path(11)).unwrap();
        assert_eq!(found.path_id(), path(11));
        assert!(reg.find_by_path(&path(99)).is_none());
    }

    #[test]
    fn test_update_path_refuses_known_id() {
        let mut reg = SessionRegistry::new();
        reg.insert_exit(exit_session(1, 10, 0));

        assert!(reg.update_path(pk(1), path(11)));
        // second attempt with the same id fails and changes nothing
        assert!(!reg.update_path(pk(2), path(11)));
        assert_eq!(reg.key_for_path(&path(11)), Some(pk(1)));
    }

    #[test]
    fn test_remove_exit_unbinds_path() {
        let mut reg = SessionRegistry::new();
        reg.insert_exit(exit_session(1, 10, 0));
        reg.insert_exit(exit_session(1, 11, 5));

        assert!(reg.remove_exit(&pk(1), path(10)));
        assert!(reg.key_for_path(&path(10)).is_none());
        assert_eq!(reg.exit_count(), 1);

        assert!(!reg.remove_exit(&pk(1), path(10)));
    }

    #[test]
    fn test_remove_all_for() {
        let mut reg = SessionRegistry::new();
        reg.insert_exit(exit_session(1, 10, 0));
        reg.insert_exit(exit_session(1, 11, 5));
        reg.insert_exit(exit_session(2, 20, 0));

        assert_eq!(reg.remove_all_for(&pk(1)), 2);
        assert_eq!(reg.exit_count(), 1);
        assert!(reg.key_for_path(&path(10)).is_none());
        assert!(reg.key_for_path(&path(11)).is_none());
        assert_eq!(reg.key_for_path(&path(20)), Some(pk(2)));
    }

    #[test]
    fn test_chosen_prefers_newest_alive() {
        let mut reg = SessionRegistry::new();
        reg.insert_exit(exit_session(1, 10, 10));
        reg.insert_exit(exit_session(1, 11, 20));

        reg.rebuild_chosen(30);
        let chosen = reg.chosen_for_mut(&pk(1)).unwrap();
        assert_eq!(chosen.created_at(), 20);
        assert_eq!(chosen.path_id(), path(11));
    }

    #[test]
    fn test_chosen_skips_dead_sessions() {
        let mut reg = SessionRegistry::new();
        let mut newer = exit_session(1, 11, 20);
        // make the newer session alive far in the future, older one dead
        newer.record_remote_activity(100_000, 1);
        reg.insert_exit(exit_session(1, 10, 10));
        reg.insert_exit(newer);

        reg.rebuild_chosen(100_000);
        let chosen = reg.chosen_for_mut(&pk(1)).unwrap();
        assert_eq!(chosen.path_id(), path(11));
    }

    #[test]
    fn test_chosen_empty_when_all_dead() {
        let mut reg = SessionRegistry::new();
        reg.insert_exit(exit_session(1, 10, 0));

        reg.rebuild_chosen(1_000_000);
        assert!(reg.chosen_for_mut(&pk(1)).is_none());
    }

    #[test]
    fn test_expire_removes_sessions_and_paths() {
        let mut reg = SessionRegistry::new();
        reg.insert_exit(exit_session(1, 10, 0));
        reg.insert_exit(exit_session(2, 20, 500_000));

        reg.expire(crate::SESSION_LIFETIME_MS + 1);
        assert_eq!(reg.exit_count(), 1);
        assert!(reg.key_for_path(&path(10)).is_none());
        assert_eq!(reg.key_for_path(&path(20)), Some(pk(2)));
    }
}
