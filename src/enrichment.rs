//! Inlines a thing's policy into retrieve-thing responses.
//!
//! A retrieve-thing request whose field selector names `_policy` gets the
//! public part of the thing's policy merged into its payload. Enrichment is
//! best effort: when the policy cannot be fetched in time the response is
//! returned as the worker produced it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::command::{Command, CommandEnvelope, Headers};
use crate::config::EnrichmentConfig;
use crate::error::StateError;
use crate::policy::{PolicyClient, PolicyError};
use crate::response::CommandResponse;
use crate::retry::ask_with_retry;
use crate::worker::WorkerHandle;

/// Payload key the policy is inlined under.
pub const POLICY_FIELD: &str = "_policy";

#[derive(Debug, thiserror::Error)]
enum EnrichError {
    #[error("could not read thing state: {0}")]
    State(#[from] StateError),

    #[error("thing has no policy id")]
    NoPolicyId,

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("policy fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Clone)]
pub struct PolicyEnricher {
    client: Arc<dyn PolicyClient>,
    config: EnrichmentConfig,
}

impl fmt::Debug for PolicyEnricher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEnricher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PolicyEnricher {
    pub fn new(client: Arc<dyn PolicyClient>, config: EnrichmentConfig) -> Self {
        Self { client, config }
    }

    /// Whether `envelope` asks for an inlined policy.
    pub fn wants_policy(envelope: &CommandEnvelope) -> bool {
        matches!(
            &envelope.command,
            Command::RetrieveThing { selected_fields: Some(selector) }
                if selector.selects_root(POLICY_FIELD)
        )
    }

    /// Merge the policy of the thing owned by `worker` into `response`.
    ///
    /// The policy id is read straight from the worker's state. The whole
    /// lookup is bounded by the configured timeout or by `remaining`,
    /// whichever is shorter. Any failure is logged and `response` is
    /// returned unchanged.
    pub async fn enrich(
        &self,
        worker: &WorkerHandle,
        headers: &Headers,
        response: CommandResponse,
        remaining: Duration,
    ) -> CommandResponse {
        let budget = self.config.timeout.min(remaining);
        let fetched = tokio::time::timeout(budget, self.fetch_policy(worker, headers))
            .await
            .unwrap_or(Err(EnrichError::Timeout(budget)));

        match fetched {
            Ok(policy) => merge_policy(response, policy),
            Err(e) => {
                tracing::warn!(
                    thing_id = %worker.thing_id(),
                    error = %e,
                    "policy enrichment failed, returning thing without policy"
                );
                response
            }
        }
    }

    async fn fetch_policy(
        &self,
        worker: &WorkerHandle,
        headers: &Headers,
    ) -> Result<Value, EnrichError> {
        let state = worker.state().await?;
        let policy_id = state
            .thing
            .and_then(|thing| thing.policy_id)
            .ok_or(EnrichError::NoPolicyId)?;

        let policy = ask_with_retry(&self.config.retry, PolicyError::is_retryable, |_| {
            let client = Arc::clone(&self.client);
            let policy_id = policy_id.clone();
            let headers = headers.clone();
            async move { client.retrieve_policy(&policy_id, &headers).await }
        })
        .await?;
        Ok(policy.to_inlined_json())
    }
}

fn merge_policy(mut response: CommandResponse, policy: Value) -> CommandResponse {
    match response.payload.as_mut() {
        Some(Value::Object(object)) => {
            object.insert(POLICY_FIELD.to_owned(), policy);
        }
        Some(_) => {
            tracing::warn!(thing_id = %response.thing_id, "payload is not an object, policy not inlined");
        }
        None => {
            let mut object = serde_json::Map::new();
            object.insert(POLICY_FIELD.to_owned(), policy);
            response.payload = Some(Value::Object(object));
        }
    }
    response
}
