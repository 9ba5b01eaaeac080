//! In-memory session table tying each registered client to its current token.
//!
//! The store is owned by the dispatcher that serves both channels, so it needs
//! no interior locking. Nothing is persisted; sessions live as long as the
//! server process.

use std::collections::HashMap;

use crate::protocol::{ClientIdentity, Token};

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<ClientIdentity, Token>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh token for `identity`, replacing any previous one.
    ///
    /// The replacement is guaranteed to differ from the token it supersedes,
    /// so a stale token can never validate again.
    pub fn register(&mut self, identity: ClientIdentity) -> Token {
        let previous = self.sessions.get(&identity).copied();
        let token = loop {
            let candidate = Token::generate();
            if Some(candidate) != previous {
                break candidate;
            }
        };
        self.sessions.insert(identity, token);
        token
    }

    /// True iff `identity` is registered and currently holds exactly `token`.
    pub fn validate(&self, identity: &ClientIdentity, token: &Token) -> bool {
        self.sessions.get(identity) == Some(token)
    }

    pub fn token_for(&self, identity: &ClientIdentity) -> Option<&Token> {
        self.sessions.get(identity)
    }

    pub fn contains(&self, identity: &ClientIdentity) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_registration_replaces_the_token() {
        let mut store = SessionStore::new();
        let identity = ClientIdentity::generate();

        let first = store.register(identity);
        let second = store.register(identity);

        assert_ne!(first, second);
        assert_eq!(store.token_for(&identity), Some(&second));
        assert!(!store.validate(&identity, &first));
        assert!(store.validate(&identity, &second));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_identity_never_validates() {
        let mut store = SessionStore::new();
        let known = ClientIdentity::generate();
        let token = store.register(known);

        let stranger = ClientIdentity::generate();
        assert!(!store.contains(&stranger));
        assert!(!store.validate(&stranger, &token));
    }

    #[test]
    fn tokens_are_bound_to_their_identity() {
        let mut store = SessionStore::new();
        let alice = ClientIdentity::generate();
        let bob = ClientIdentity::generate();
        let alice_token = store.register(alice);
        let bob_token = store.register(bob);

        assert!(store.validate(&alice, &alice_token));
        assert!(!store.validate(&alice, &bob_token));
        assert!(!store.validate(&bob, &alice_token));
    }
}
