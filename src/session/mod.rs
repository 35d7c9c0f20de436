//! Subscriber sessions
//!
//! - [`subscriber`] - a single live consumer with its message stream
//! - [`SessionManager`] - activation by name or filter, and bulk cancellation
//!
//! Membership of the active set changes under a short-lived lock that is
//! never held across an await, so overlapping `subscribe_all` and
//! `unsubscribe_all` calls cannot corrupt it.

pub mod subscriber;

pub use subscriber::SubscriberSession;

use crate::error::{BrokerError, BrokerResult};
use crate::observability::BrokerMetrics;
use crate::registry::{ResolvedSubscription, SubscriptionRegistry};
use crate::transport::ConnectionManager;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Sessions that have been opened and not yet cancelled, in opening order
#[derive(Default)]
pub(crate) struct ActiveSessions {
    sessions: Mutex<BTreeMap<u64, SubscriberSession>>,
}

impl ActiveSessions {
    fn insert(&self, session: SubscriberSession) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(session.id(), session);
        }
    }

    pub(crate) fn remove(&self, id: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&id);
        }
    }

    fn drain(&self) -> Vec<SubscriberSession> {
        self.sessions
            .lock()
            .map(|mut sessions| std::mem::take(&mut *sessions).into_values().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<SubscriberSession> {
        self.sessions
            .lock()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Opens and tracks subscriber sessions
pub struct SessionManager {
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    active: Arc<ActiveSessions>,
    next_id: AtomicU64,
    /// Set once the broker shuts down; no session may open afterwards
    closed: AtomicBool,
    metrics: Arc<BrokerMetrics>,
}

impl SessionManager {
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            connections,
            registry,
            active: Arc::new(ActiveSessions::default()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Activate the named subscription
    pub async fn subscribe(&self, name: &str) -> BrokerResult<SubscriberSession> {
        let subscription = self.registry.resolve(name)?.clone();
        self.start(subscription).await
    }

    async fn start(&self, subscription: ResolvedSubscription) -> BrokerResult<SubscriberSession> {
        if self.is_closed() {
            return Err(BrokerError::ShutDown);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = SubscriberSession::open(
            id,
            subscription,
            &self.connections,
            Arc::downgrade(&self.active),
            Arc::clone(&self.metrics),
        )
        .await?;
        self.active.insert(session.clone());

        // A close that drained the active set before the insert above
        if self.is_closed() {
            debug!("Session {} opened during shutdown, cancelling", session.name());
            session.cancel().await?;
            return Err(BrokerError::ShutDown);
        }
        Ok(session)
    }

    /// Activate every subscription accepted by `filter`, in registry order
    ///
    /// If any activation fails, the sessions already opened by this call are
    /// cancelled and the first error is returned.
    pub async fn subscribe_all<F>(&self, filter: F) -> BrokerResult<Vec<SubscriberSession>>
    where
        F: Fn(&ResolvedSubscription) -> bool,
    {
        let selected: Vec<ResolvedSubscription> =
            self.registry.select(filter).into_iter().cloned().collect();
        let results = join_all(selected.into_iter().map(|s| self.start(s))).await;

        let mut sessions = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(error) = first_error {
            warn!("subscribe_all failed, cancelling {} sessions: {}", sessions.len(), error);
            join_all(sessions.iter().map(SubscriberSession::cancel)).await;
            return Err(error);
        }
        Ok(sessions)
    }

    /// Cancel every active session and wait for each broker acknowledgment
    pub async fn unsubscribe_all(&self) -> BrokerResult<()> {
        let sessions = self.active.drain();
        if sessions.is_empty() {
            return Ok(());
        }

        info!("Cancelling {} subscriber sessions", sessions.len());
        let results = join_all(sessions.iter().map(SubscriberSession::cancel)).await;
        results.into_iter().collect()
    }

    /// Refuse new sessions, then cancel every active one
    ///
    /// Sessions whose activation overlaps the close are cancelled by the
    /// activating call, which then fails with `ShutDown`.
    pub async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.unsubscribe_all().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> Vec<SubscriberSession> {
        self.active.snapshot()
    }

    pub fn active_count(&self) -> usize {
        self.active.snapshot().len()
    }
}
