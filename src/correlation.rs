//! Process-wide table of pending live requests, keyed by correlation token.
//!
//! Supervisors insert an entry when they publish a live command with global
//! dispatch; the inbound response listener takes it when the matching
//! response arrives. Every entry carries a deadline and is treated as absent
//! once it has passed, whether or not it was purged yet.
//!
//! Construct one cache at process start and inject it into the store. It is
//! cheap to clone; clones share the same table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::FailureKind;
use crate::response::CommandResponse;

/// The reply channel of the caller waiting for a live response.
pub type Requester = oneshot::Sender<CommandResponse>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// Another pending request already owns this token.
    #[error("correlation id '{0}' is already pending")]
    Collision(String),
}

impl CorrelationError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Conflict
    }

    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct Entry {
    requester: Requester,
    deadline: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorrelationCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl CorrelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `requester` under `token` until `deadline`.
    ///
    /// An expired entry under the same token is replaced, so a token whose
    /// previous owner timed out can be reused. Other expired entries are
    /// left for [`purge_expired`](CorrelationCache::purge_expired).
    ///
    /// # Errors
    ///
    /// [`CorrelationError::Collision`] if a live entry already holds
    /// `token`. The pending requester is left untouched and `requester` is
    /// dropped.
    pub fn put(
        &self,
        token: impl Into<String>,
        requester: Requester,
        deadline: Instant,
    ) -> Result<(), CorrelationError> {
        let token = token.into();
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(&token).is_some_and(|entry| !entry.is_expired(now)) {
            return Err(CorrelationError::Collision(token));
        }
        entries.insert(
            token,
            Entry {
                requester,
                deadline,
            },
        );
        Ok(())
    }

    /// Remove and return the requester for `token`.
    ///
    /// Returns `None` for unknown tokens, tokens already taken, and tokens
    /// past their deadline. At most one call per token ever returns `Some`.
    pub fn take(&self, token: &str) -> Option<Requester> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.remove(token)?;
        (!entry.is_expired(now)).then_some(entry.requester)
    }

    /// Drop the entry for `token` if its requester stopped waiting.
    ///
    /// A timed-out caller calls this after dropping its receiver. An entry
    /// that a newer request registered under the same token is kept.
    pub fn release(&self, token: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(token) {
            Some(entry) if entry.requester.is_closed() => entries.remove(token).is_some(),
            _ => false,
        }
    }

    /// Drop every entry past its deadline and return how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn contains(&self, token: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(token)
    }

    /// Number of entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
