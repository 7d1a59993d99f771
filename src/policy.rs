//! Client side of the policy subsystem.
//!
//! Policy evaluation lives elsewhere. This crate only needs to fetch a
//! policy by id and render its public fields for enrichment.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::Headers;
use crate::error::FailureKind;

/// A policy document as returned by the policy subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub policy_id: String,
    /// Top-level fields of the policy document.
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Field names that must never leave the policy subsystem.
    #[serde(default)]
    pub hidden: BTreeSet<String>,
}

impl Policy {
    pub fn new(policy_id: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.into(),
            fields: Map::new(),
            hidden: BTreeSet::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_hidden_field(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        self.hidden.insert(name.clone());
        self.fields.insert(name, value);
        self
    }

    /// The policy as embedded in a thing response: every non-hidden field
    /// plus `policyId`.
    pub fn to_inlined_json(&self) -> Value {
        let mut object: Map<String, Value> = self
            .fields
            .iter()
            .filter(|(name, _)| !self.hidden.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        object.insert("policyId".to_owned(), Value::String(self.policy_id.clone()));
        Value::Object(object)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("policy '{0}' not found")]
    NotFound(String),

    #[error("policy subsystem unavailable: {0}")]
    Unavailable(String),
}

impl PolicyError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PolicyError::NotFound(_) => FailureKind::NotFound,
            PolicyError::Unavailable(_) => FailureKind::Unavailable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PolicyError::Unavailable(_))
    }
}

#[async_trait]
pub trait PolicyClient: Send + Sync + 'static {
    /// Fetch a policy on behalf of the request described by `headers`.
    ///
    /// # Errors
    ///
    /// [`PolicyError::NotFound`] if no such policy exists,
    /// [`PolicyError::Unavailable`] on transport trouble.
    async fn retrieve_policy(&self, policy_id: &str, headers: &Headers)
    -> Result<Policy, PolicyError>;
}

/// Policy client backed by a shared in-process map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPolicyStore {
    policies: Arc<RwLock<HashMap<String, Policy>>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, policy: Policy) {
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        policies.insert(policy.policy_id.clone(), policy);
    }

    pub fn remove(&self, policy_id: &str) -> Option<Policy> {
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        policies.remove(policy_id)
    }
}

#[async_trait]
impl PolicyClient for InMemoryPolicyStore {
    async fn retrieve_policy(
        &self,
        policy_id: &str,
        _headers: &Headers,
    ) -> Result<Policy, PolicyError> {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        policies
            .get(policy_id)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(policy_id.to_owned()))
    }
}

#[cfg(test)]
pub(crate) mod test_doubles {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    /// Fails with `Unavailable` for the first `failures` calls, then
    /// delegates to `inner`.
    #[derive(Debug)]
    pub(crate) struct FlakyPolicyClient {
        pub(crate) inner: InMemoryPolicyStore,
        pub(crate) failures: AtomicU32,
        pub(crate) calls: AtomicU32,
    }

    impl FlakyPolicyClient {
        pub(crate) fn failing(inner: InMemoryPolicyStore, failures: u32) -> Self {
            Self {
                inner,
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PolicyClient for FlakyPolicyClient {
        async fn retrieve_policy(
            &self,
            policy_id: &str,
            headers: &Headers,
        ) -> Result<Policy, PolicyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(PolicyError::Unavailable("connection reset".into()));
            }
            self.inner.retrieve_policy(policy_id, headers).await
        }
    }

    /// Never answers.
    #[derive(Debug)]
    pub(crate) struct StalledPolicyClient;

    #[async_trait]
    impl PolicyClient for StalledPolicyClient {
        async fn retrieve_policy(
            &self,
            _policy_id: &str,
            _headers: &Headers,
        ) -> Result<Policy, PolicyError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(PolicyError::Unavailable("stalled".into()))
        }
    }
}
