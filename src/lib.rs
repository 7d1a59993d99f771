//! Entity-lifecycle core for digital twins.
//!
//! Every thing is owned by one event-sourced worker, supervised with
//! exponential backoff, and reachable over a persisted channel (through the
//! worker) or a live channel (over pub/sub, correlated back to the caller).

mod backoff;
mod clock;
mod command;
mod config;
mod correlation;
mod enrichment;
mod error;
mod event;
mod event_log;
mod live;
mod pointer;
mod policy;
mod pubsub;
mod response;
mod retry;
mod storage;
mod store;
pub mod strategy;
mod supervisor;
mod telemetry;
mod thing;
mod worker;

pub use backoff::{BackoffConfig, ExponentialBackoff, RestartDecision};
pub use clock::{Clock, FixedClock, SystemClock};
pub use command::{Channel, Command, CommandEnvelope, CommandKind, Headers};
pub use config::{EnrichmentConfig, LiveConfig, TwinConfig, WorkerConfig};
pub use correlation::{CorrelationCache, CorrelationError, Requester};
pub use enrichment::{POLICY_FIELD, PolicyEnricher};
pub use error::{ExecuteError, FailureKind, StateError, ThingError};
pub use event::{EventMetadata, StoredEvent, ThingEvent};
pub use event_log::{AppendError, EventLog, EventLogError, InMemoryEventLog, Snapshot};
pub use live::{
    LiveDispatcher, ResponseListener, deliver_response, dispatch_globally, effective_live_timeout,
};
pub use pointer::{FieldSelector, JsonPointer};
pub use policy::{InMemoryPolicyStore, Policy, PolicyClient, PolicyError};
pub use pubsub::{
    InMemoryPubSub, LiveEvent, LiveMessage, PubSub, PubSubError, PublishAck, PublishedSignal,
    Signal, StreamingType,
};
pub use response::{CommandResponse, Resource, ResponseStatus};
pub use retry::{RetryConfig, ask_with_retry};
pub use storage::{FileEventLog, StreamLayout};
pub use store::{ThingStore, ThingStoreBuilder};
pub use strategy::{Strategy, StrategyContext, StrategyRegistry, StrategyResult, Unhandled};
pub use supervisor::{
    SupervisorDeps, SupervisorExit, SupervisorHandle, SupervisorStatus, spawn_supervisor,
};
pub use telemetry::init_tracing;
pub use thing::{Feature, Thing, ThingId, ThingIdError, apply_event};
pub use worker::{
    ExecuteResult, ExitReason, ThingState, WorkerDeps, WorkerHandle, WorkerStatus, spawn_worker,
};
