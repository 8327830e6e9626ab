use std::collections::{HashMap, HashSet};

use crate::{ConnId, UserId};

/// Connection registry (user ↔ connection).
/// A user is present in `user_conns` only while it has at least one connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    user_conns: HashMap<UserId, HashSet<ConnId>>,
    conn_users: HashMap<ConnId, UserId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `conn_id` for `user_id`. Returns true when this made the user come online.
    pub fn register(&mut self, conn_id: &ConnId, user_id: &UserId) -> bool {
        // A connection id belongs to exactly one user.
        if let Some(previous) = self.conn_users.get(conn_id) {
            if previous == user_id {
                return false;
            }
            self.unregister(conn_id);
        }

        let came_online = !self.user_conns.contains_key(user_id);
        self.user_conns
            .entry(user_id.clone())
            .or_insert_with(HashSet::new)
            .insert(conn_id.clone());
        self.conn_users.insert(conn_id.clone(), user_id.clone());
        came_online
    }

    /// Removes `conn_id`. Returns the owning user when it was that user's last connection.
    pub fn unregister(&mut self, conn_id: &ConnId) -> Option<UserId> {
        let user_id = self.conn_users.remove(conn_id)?;

        if let Some(conns) = self.user_conns.get_mut(&user_id) {
            conns.remove(conn_id);
            if conns.is_empty() {
                self.user_conns.remove(&user_id);
                return Some(user_id);
            }
        }
        // User still has another connection; keep online.
        None
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.user_conns.contains_key(user_id)
    }

    pub fn connections_for(&self, user_id: &str) -> Vec<ConnId> {
        self.user_conns
            .get(user_id)
            .map(|conns| conns.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn user_of(&self, conn_id: &str) -> Option<&UserId> {
        self.conn_users.get(conn_id)
    }

    pub fn online_count(&self) -> usize {
        self.user_conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn register_then_unregister_goes_offline() {
        let mut reg = ConnectionRegistry::new();
        assert!(reg.register(&id("c1"), &id("alice")));
        assert!(reg.is_online("alice"));

        assert_eq!(reg.unregister(&id("c1")), Some(id("alice")));
        assert!(!reg.is_online("alice"));
        assert!(reg.connections_for("alice").is_empty());
    }

    #[test]
    fn second_connection_keeps_user_online() {
        let mut reg = ConnectionRegistry::new();
        assert!(reg.register(&id("a1"), &id("alice")));
        assert!(!reg.register(&id("a2"), &id("alice")));

        assert_eq!(reg.unregister(&id("a1")), None);
        assert!(reg.is_online("alice"));
        assert_eq!(reg.connections_for("alice"), vec![id("a2")]);

        assert_eq!(reg.unregister(&id("a2")), Some(id("alice")));
        assert!(!reg.is_online("alice"));
    }

    #[test]
    fn register_is_idempotent_per_connection() {
        let mut reg = ConnectionRegistry::new();
        reg.register(&id("c1"), &id("bob"));
        reg.register(&id("c1"), &id("bob"));
        assert_eq!(reg.connections_for("bob").len(), 1);

        assert_eq!(reg.unregister(&id("c1")), Some(id("bob")));
        assert_eq!(reg.online_count(), 0);
    }

    #[test]
    fn unknown_connection_is_a_noop() {
        let mut reg = ConnectionRegistry::new();
        reg.register(&id("c1"), &id("bob"));
        assert_eq!(reg.unregister(&id("nope")), None);
        assert!(reg.is_online("bob"));
    }

    #[test]
    fn reregistering_under_another_user_moves_the_connection() {
        let mut reg = ConnectionRegistry::new();
        reg.register(&id("c1"), &id("bob"));
        assert!(reg.register(&id("c1"), &id("carol")));

        assert!(!reg.is_online("bob"));
        assert_eq!(reg.user_of("c1"), Some(&id("carol")));
    }
}
