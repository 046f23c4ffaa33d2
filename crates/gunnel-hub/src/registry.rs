//! Subdomain registry: which agent session owns which subdomains.
//!
//! The collection is small and scanned linearly; mutation is serialised by
//! the manager's lock. The client type is abstracted behind a trait so the
//! supersede rules can be exercised without a live QUIC session.

use thiserror::Error;
use tracing::warn;

/// The registry's view of an agent session.
pub trait ClientHandle {
    fn connected(&self) -> bool;
    /// Identity, not equality: two handles to the same session.
    fn same_as(&self, other: &Self) -> bool;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client already exists for subdomain {0}")]
    AlreadyExists(String),
}

struct Entry<C> {
    subdomains: Vec<String>,
    client: C,
}

/// Ordered collection of `{subdomains, client}` records.
pub struct Registry<C> {
    entries: Vec<Entry<C>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<C: ClientHandle> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subdomain: &str) -> Option<&C> {
        self.entries
            .iter()
            .find(|e| e.subdomains.iter().any(|s| s == subdomain))
            .map(|e| &e.client)
    }

    /// Claim `subdomain` for `client`.
    ///
    /// - unowned subdomain: a new record is appended
    /// - owned by the same session: the subdomain joins its list
    /// - owned by a disconnected session: the old record is removed
    ///   atomically and the new session takes over
    /// - owned by a live session: rejected
    pub fn add_or_replace(&mut self, subdomain: String, client: C) -> Result<(), RegistryError> {
        let existing = self
            .entries
            .iter()
            .position(|e| e.subdomains.iter().any(|s| s == &subdomain));

        match existing {
            None => {
                self.entries.push(Entry {
                    subdomains: vec![subdomain],
                    client,
                });
                Ok(())
            }
            Some(idx) if self.entries[idx].client.same_as(&client) => {
                let subs = &mut self.entries[idx].subdomains;
                if !subs.contains(&subdomain) {
                    subs.push(subdomain);
                }
                Ok(())
            }
            Some(idx) if !self.entries[idx].client.connected() => {
                warn!(subdomain, "superseding disconnected client");
                self.entries.remove(idx);
                self.entries.push(Entry {
                    subdomains: vec![subdomain],
                    client,
                });
                Ok(())
            }
            Some(_) => Err(RegistryError::AlreadyExists(subdomain)),
        }
    }

    /// Remove every record owned by `client`.
    pub fn remove_client(&mut self, client: &C) {
        self.entries.retain(|e| !e.client.same_as(client));
    }

    /// Visit every `(subdomain, client)` pair.
    pub fn for_each(&self, mut f: impl FnMut(&str, &C)) {
        for entry in &self.entries {
            for subdomain in &entry.subdomains {
                f(subdomain, &entry.client);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct FakeClient(Arc<AtomicBool>);

    impl FakeClient {
        fn new() -> Self {
            Self(Arc::new(AtomicBool::new(true)))
        }

        fn disconnect(&self) {
            self.0.store(false, Ordering::SeqCst);
        }
    }

    impl ClientHandle for FakeClient {
        fn connected(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn same_as(&self, other: &Self) -> bool {
            Arc::ptr_eq(&self.0, &other.0)
        }
    }

    #[test]
    fn registers_and_looks_up() {
        let mut registry = Registry::new();
        let client = FakeClient::new();

        registry
            .add_or_replace("test".to_string(), client.clone())
            .unwrap();

        assert!(registry.get("test").is_some());
        assert!(registry.get("ghost").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_session_collects_subdomains() {
        let mut registry = Registry::new();
        let client = FakeClient::new();

        registry
            .add_or_replace("web".to_string(), client.clone())
            .unwrap();
        registry
            .add_or_replace("api".to_string(), client.clone())
            .unwrap();

        // Both subdomains, one record.
        assert_eq!(registry.len(), 1);
        assert!(registry.get("web").is_some());
        assert!(registry.get("api").is_some());
    }

    #[test]
    fn live_owner_blocks_newcomer() {
        let mut registry = Registry::new();
        let owner = FakeClient::new();
        let newcomer = FakeClient::new();

        registry
            .add_or_replace("test".to_string(), owner)
            .unwrap();

        let err = registry
            .add_or_replace("test".to_string(), newcomer)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyExists("test".to_string())
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn disconnected_owner_is_superseded() {
        let mut registry = Registry::new();
        let old = FakeClient::new();
        let new = FakeClient::new();

        registry
            .add_or_replace("test".to_string(), old.clone())
            .unwrap();
        old.disconnect();

        registry
            .add_or_replace("test".to_string(), new.clone())
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("test").unwrap().same_as(&new));
    }

    #[test]
    fn supersede_drops_all_subdomains_of_the_old_session() {
        let mut registry = Registry::new();
        let old = FakeClient::new();
        let new = FakeClient::new();

        registry
            .add_or_replace("web".to_string(), old.clone())
            .unwrap();
        registry
            .add_or_replace("api".to_string(), old.clone())
            .unwrap();
        old.disconnect();

        registry
            .add_or_replace("web".to_string(), new.clone())
            .unwrap();

        // The old record went away wholesale; "api" is free again.
        assert!(registry.get("api").is_none());
        assert!(registry.get("web").unwrap().same_as(&new));
    }

    #[test]
    fn remove_client_clears_its_records() {
        let mut registry = Registry::new();
        let a = FakeClient::new();
        let b = FakeClient::new();

        registry.add_or_replace("a".to_string(), a.clone()).unwrap();
        registry.add_or_replace("b".to_string(), b.clone()).unwrap();

        registry.remove_client(&a);

        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn for_each_visits_every_subdomain() {
        let mut registry = Registry::new();
        let client = FakeClient::new();

        registry
            .add_or_replace("web".to_string(), client.clone())
            .unwrap();
        registry
            .add_or_replace("api".to_string(), client.clone())
            .unwrap();

        let mut seen = Vec::new();
        registry.for_each(|sub, _| seen.push(sub.to_string()));
        seen.sort();
        assert_eq!(seen, vec!["api".to_string(), "web".to_string()]);
    }
}
