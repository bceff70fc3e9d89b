//! Usage: Memoized identity id resolution with change notifications.
//!
//! The identity id is fetched once per login snapshot and cached; changing the
//! login map invalidates the cache. Every write of the id funnels through one
//! place so registered listeners see each transition exactly once.

use crate::shared::error::{AuthError, AuthResult};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Exchanges a login map for an identity id. Implemented against whatever
/// identity service backs the deployment; tests use an in-process stub.
pub trait IdentityExchange: Send + Sync {
    fn resolve(
        &self,
        logins: HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = AuthResult<String>> + Send + '_>>;
}

/// Notified whenever the cached identity id transitions to a new value.
pub trait IdentityChangedListener: Send + Sync {
    fn identity_changed(&self, old_identity_id: Option<&str>, new_identity_id: &str);
}

#[derive(Default)]
struct IdentityRecord {
    identity_id: Option<String>,
    /// Survives cache invalidation so the next transition can report the id
    /// it replaced.
    last_identity_id: Option<String>,
    logins: HashMap<String, String>,
}

pub struct IdentityResolver {
    exchange: Arc<dyn IdentityExchange>,
    record: Mutex<IdentityRecord>,
    listeners: Mutex<Vec<Arc<dyn IdentityChangedListener>>>,
    /// Serializes concurrent resolution so the exchange runs once per miss.
    gate: tokio::sync::Mutex<()>,
}

impl IdentityResolver {
    pub fn new(exchange: Arc<dyn IdentityExchange>) -> Self {
        Self {
            exchange,
            record: Mutex::new(IdentityRecord::default()),
            listeners: Mutex::new(Vec::new()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// The identity id for the current login map, resolving and caching it on
    /// first use. Concurrent callers share one resolution.
    pub async fn identity_id(&self) -> AuthResult<String> {
        if let Some(id) = self.cached_identity_id() {
            return Ok(id);
        }

        let _guard = self.gate.lock().await;
        if let Some(id) = self.cached_identity_id() {
            return Ok(id);
        }

        let logins = self.lock_record().logins.clone();
        let resolved = self.exchange.resolve(logins).await?;
        if resolved.trim().is_empty() {
            return Err(AuthError::Transport(
                "identity service returned an empty identity id".to_string(),
            ));
        }
        self.install_identity_id(&resolved);
        Ok(resolved)
    }

    pub fn cached_identity_id(&self) -> Option<String> {
        self.lock_record().identity_id.clone()
    }

    pub fn logins(&self) -> HashMap<String, String> {
        self.lock_record().logins.clone()
    }

    /// Replace the login map. A changed map drops the cached id so the next
    /// `identity_id` call resolves against the new logins.
    pub fn set_logins(&self, logins: HashMap<String, String>) {
        let mut record = self.lock_record();
        if record.logins == logins {
            return;
        }
        record.logins = logins;
        if let Some(id) = record.identity_id.take() {
            record.last_identity_id = Some(id);
        }
    }

    pub fn register_identity_changed_listener(&self, listener: Arc<dyn IdentityChangedListener>) {
        self.lock_listeners().push(listener);
    }

    pub fn clear_listeners(&self) {
        self.lock_listeners().clear();
    }

    /// Drop the cached id and logins. Listeners stay registered.
    pub fn clear(&self) {
        let mut record = self.lock_record();
        record.identity_id = None;
        record.last_identity_id = None;
        record.logins.clear();
    }

    /// The single write path for the id. Listeners fire only on an actual
    /// transition, outside the record lock; `old` is the last id this
    /// resolver ever held, even when the cache was invalidated in between.
    fn install_identity_id(&self, new_id: &str) {
        let old = {
            let mut record = self.lock_record();
            if record.identity_id.as_deref() == Some(new_id) {
                return;
            }
            let old = record
                .identity_id
                .take()
                .or_else(|| record.last_identity_id.take());
            record.identity_id = Some(new_id.to_string());
            old
        };
        if old.as_deref() == Some(new_id) {
            return;
        }

        let listeners = self.lock_listeners().clone();
        for listener in listeners {
            listener.identity_changed(old.as_deref(), new_id);
        }
    }

    fn lock_record(&self) -> std::sync::MutexGuard<'_, IdentityRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listeners(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<Arc<dyn IdentityChangedListener>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExchange {
        calls: AtomicUsize,
        id: Mutex<String>,
    }

    impl CountingExchange {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                id: Mutex::new(id.to_string()),
            })
        }

        fn set_id(&self, id: &str) {
            *self.id.lock().unwrap() = id.to_string();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl IdentityExchange for CountingExchange {
        fn resolve(
            &self,
            _logins: HashMap<String, String>,
        ) -> Pin<Box<dyn Future<Output = AuthResult<String>> + Send + '_>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(self.id.lock().unwrap().clone())
            })
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        transitions: Mutex<Vec<(Option<String>, String)>>,
    }

    impl IdentityChangedListener for RecordingListener {
        fn identity_changed(&self, old: Option<&str>, new: &str) {
            self.transitions
                .lock()
                .unwrap()
                .push((old.map(str::to_string), new.to_string()));
        }
    }

    fn logins(provider: &str, token: &str) -> HashMap<String, String> {
        HashMap::from([(provider.to_string(), token.to_string())])
    }

    #[tokio::test]
    async fn identity_id_is_resolved_once_and_memoized() {
        let exchange = CountingExchange::new("id-alpha");
        let resolver = IdentityResolver::new(exchange.clone());

        assert_eq!(resolver.identity_id().await.unwrap(), "id-alpha");
        assert_eq!(resolver.identity_id().await.unwrap(), "id-alpha");
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn changing_logins_invalidates_the_cached_id() {
        let exchange = CountingExchange::new("id-alpha");
        let resolver = IdentityResolver::new(exchange.clone());

        resolver.set_logins(logins("idp.example.com", "token-1"));
        assert_eq!(resolver.identity_id().await.unwrap(), "id-alpha");

        exchange.set_id("id-beta");
        resolver.set_logins(logins("idp.example.com", "token-2"));
        assert!(resolver.cached_identity_id().is_none());
        assert_eq!(resolver.identity_id().await.unwrap(), "id-beta");
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn setting_an_identical_login_map_keeps_the_cache() {
        let exchange = CountingExchange::new("id-alpha");
        let resolver = IdentityResolver::new(exchange.clone());

        resolver.set_logins(logins("idp.example.com", "token-1"));
        resolver.identity_id().await.unwrap();
        resolver.set_logins(logins("idp.example.com", "token-1"));

        assert_eq!(resolver.cached_identity_id().as_deref(), Some("id-alpha"));
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn listeners_see_each_transition_once() {
        let exchange = CountingExchange::new("id-alpha");
        let resolver = IdentityResolver::new(exchange.clone());
        let listener = Arc::new(RecordingListener::default());
        resolver.register_identity_changed_listener(listener.clone());

        resolver.identity_id().await.unwrap();
        resolver.identity_id().await.unwrap();

        exchange.set_id("id-beta");
        resolver.set_logins(logins("idp.example.com", "token-2"));
        resolver.identity_id().await.unwrap();

        let transitions = listener.transitions.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![
                (None, "id-alpha".to_string()),
                (Some("id-alpha".to_string()), "id-beta".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn re_resolving_the_same_id_after_invalidation_does_not_notify() {
        let exchange = CountingExchange::new("id-alpha");
        let resolver = IdentityResolver::new(exchange.clone());
        let listener = Arc::new(RecordingListener::default());
        resolver.register_identity_changed_listener(listener.clone());

        resolver.set_logins(logins("idp.example.com", "token-1"));
        resolver.identity_id().await.unwrap();

        // Fresh token, same principal: the id resolves unchanged.
        resolver.set_logins(logins("idp.example.com", "token-1b"));
        assert!(resolver.cached_identity_id().is_none());
        resolver.identity_id().await.unwrap();

        let transitions = listener.transitions.lock().unwrap().clone();
        assert_eq!(transitions, vec![(None, "id-alpha".to_string())]);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_resolution() {
        let exchange = CountingExchange::new("id-alpha");
        let resolver = Arc::new(IdentityResolver::new(exchange.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move { resolver.identity_id().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "id-alpha");
        }
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn clear_drops_cache_and_logins() {
        let exchange = CountingExchange::new("id-alpha");
        let resolver = IdentityResolver::new(exchange.clone());

        resolver.set_logins(logins("idp.example.com", "token-1"));
        resolver.identity_id().await.unwrap();
        resolver.clear();

        assert!(resolver.cached_identity_id().is_none());
        assert!(resolver.logins().is_empty());
    }
}
