//! The entity worker: a tokio task that owns one thing's state.
//!
//! The worker recovers its state from the event log, then processes its
//! mailbox one message at a time. Commands go through the strategy
//! registry; produced events are appended conditioned on the current
//! revision before they are folded into state and answered.
//!
//! The worker never restarts itself. It reports how it ended through the
//! [`ExitReason`] returned from its task, and the supervisor decides what
//! happens next.
//!
//! Public API: [`WorkerHandle`] (cloneable handle) and [`spawn_worker`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::clock::Clock;
use crate::command::CommandEnvelope;
use crate::config::WorkerConfig;
use crate::error::{ExecuteError, StateError};
use crate::event::StoredEvent;
use crate::event_log::{AppendError, EventLog, EventLogError, Snapshot};
use crate::response::CommandResponse;
use crate::retry::ask_with_retry;
use crate::strategy::{StrategyContext, StrategyRegistry, StrategyResult};
use crate::thing::{Thing, ThingId, apply_event};

/// Result sent back through the `Execute` reply channel.
pub type ExecuteResult = Result<CommandResponse, ExecuteError>;

/// Lifecycle of a worker, observable through [`WorkerHandle::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Recovering,
    Active,
    Applying,
    Terminating,
    Terminated,
}

/// Why a worker task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Asked to passivate.
    Passivated,
    /// No traffic for the configured idle timeout.
    Idle,
    /// Every handle was dropped.
    Stopped,
    /// An append found the log ahead of this worker's revision.
    Stale { expected: u64, actual: u64 },
    /// A strategy reported a programmer error.
    Fatal(String),
    /// Recovery failed or timed out.
    Crashed(String),
}

impl ExitReason {
    /// Whether the supervisor should restart the worker with backoff.
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self,
            ExitReason::Stale { .. } | ExitReason::Fatal(_) | ExitReason::Crashed(_)
        )
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Passivated => f.write_str("passivated"),
            ExitReason::Idle => f.write_str("idle"),
            ExitReason::Stopped => f.write_str("stopped"),
            ExitReason::Stale { expected, actual } => {
                write!(f, "stale: expected revision {expected}, log at {actual}")
            }
            ExitReason::Fatal(reason) => write!(f, "fatal: {reason}"),
            ExitReason::Crashed(reason) => write!(f, "crashed: {reason}"),
        }
    }
}

/// A thing's state together with its revision.
#[derive(Debug, Clone, PartialEq)]
pub struct ThingState {
    /// `None` if the thing was never created or has been deleted.
    pub thing: Option<Thing>,
    pub revision: u64,
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub event_log: Arc<dyn EventLog>,
    pub strategies: Arc<StrategyRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for WorkerDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDeps")
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}

/// Messages sent from [`WorkerHandle`] to the worker loop.
pub(crate) enum WorkerMessage {
    Execute {
        envelope: CommandEnvelope,
        reply: oneshot::Sender<ExecuteResult>,
    },
    GetState {
        reply: oneshot::Sender<ThingState>,
    },
    Passivate,
}

/// What the loop does after one command.
enum Step {
    Continue(ExecuteResult),
    Exit(ExecuteResult, ExitReason),
}

struct ThingWorker {
    thing_id: ThingId,
    deps: WorkerDeps,
    config: WorkerConfig,
    thing: Option<Thing>,
    revision: u64,
    since_snapshot: u64,
}

impl ThingWorker {
    /// Load the latest snapshot and fold every later event.
    ///
    /// Events must follow each other with no gaps; anything else means the
    /// stream is corrupt.
    async fn recover(&mut self) -> Result<usize, EventLogError> {
        let log = self.deps.event_log.as_ref();
        if let Some(snapshot) = log.load_snapshot(&self.thing_id).await? {
            self.thing = snapshot.thing;
            self.revision = snapshot.revision;
        }

        let events = log.load_events(&self.thing_id, self.revision).await?;
        let replayed = events.len();
        for stored in events {
            if stored.revision != self.revision + 1 {
                return Err(EventLogError::Corrupt {
                    thing_id: self.thing_id.clone(),
                    message: format!(
                        "expected revision {}, found {}",
                        self.revision + 1,
                        stored.revision
                    ),
                });
            }
            self.fold(&stored);
        }
        Ok(replayed)
    }

    fn fold(&mut self, stored: &StoredEvent) {
        self.thing = apply_event(self.thing.take(), &self.thing_id, &stored.event);
        self.revision = stored.revision;
    }

    fn state(&self) -> ThingState {
        ThingState {
            thing: self.thing.clone(),
            revision: self.revision,
        }
    }

    async fn execute(&mut self, envelope: CommandEnvelope) -> Step {
        if envelope.thing_id != self.thing_id {
            let message = format!(
                "command for '{}' routed to worker of '{}'",
                envelope.thing_id, self.thing_id
            );
            tracing::error!(thing_id = %self.thing_id, "{message}");
            return Step::Exit(
                Err(ExecuteError::internal(message.clone())),
                ExitReason::Fatal(message),
            );
        }

        let ctx = StrategyContext {
            thing_id: &self.thing_id,
            thing: self.thing.as_ref(),
            revision: self.revision,
            clock: self.deps.clock.as_ref(),
            headers: &envelope.headers,
        };
        let result = self.deps.strategies.apply(&ctx, &envelope.command);

        match result {
            Err(unhandled) => {
                tracing::error!(
                    thing_id = %self.thing_id,
                    error = %unhandled,
                    "strategy could not handle command"
                );
                let reason = unhandled.to_string();
                Step::Exit(
                    Err(ExecuteError::internal_with(
                        "strategy could not handle command",
                        unhandled,
                    )),
                    ExitReason::Fatal(reason),
                )
            }
            Ok(StrategyResult::Failure(e)) => {
                tracing::debug!(thing_id = %self.thing_id, error = %e, "command rejected");
                Step::Continue(Err(ExecuteError::Domain(e)))
            }
            Ok(StrategyResult::Response(response)) => Step::Continue(Ok(response)),
            Ok(StrategyResult::Mutation { event, response }) => {
                self.persist(event, response).await
            }
        }
    }

    async fn persist(&mut self, event: StoredEvent, response: CommandResponse) -> Step {
        let expected = self.revision;
        let log = Arc::clone(&self.deps.event_log);
        let thing_id = self.thing_id.clone();
        let appended = ask_with_retry(&self.config.append_retry, AppendError::is_retryable, |_| {
            let log = Arc::clone(&log);
            let thing_id = thing_id.clone();
            let event = event.clone();
            async move { log.append(&thing_id, expected, &event).await }
        })
        .await;

        match appended {
            Ok(()) => {
                self.fold(&event);
                tracing::debug!(
                    thing_id = %self.thing_id,
                    event_type = event.event_type(),
                    revision = self.revision,
                    "event appended"
                );
                self.maybe_snapshot().await;
                Step::Continue(Ok(response))
            }
            Err(AppendError::RevisionConflict { expected, actual }) => {
                tracing::warn!(
                    thing_id = %self.thing_id,
                    expected,
                    actual,
                    "append conflict, worker state is stale"
                );
                Step::Exit(
                    Err(ExecuteError::RevisionConflict {
                        thing_id: self.thing_id.clone(),
                        expected,
                        actual,
                    }),
                    ExitReason::Stale { expected, actual },
                )
            }
            Err(e) => {
                tracing::warn!(thing_id = %self.thing_id, error = %e, "append failed");
                Step::Continue(Err(ExecuteError::internal_with("append failed", e)))
            }
        }
    }

    async fn maybe_snapshot(&mut self) {
        self.since_snapshot += 1;
        let every = self.config.snapshot_every;
        if every == 0 || self.since_snapshot < every {
            return;
        }
        self.since_snapshot = 0;
        let snapshot = Snapshot {
            thing: self.thing.clone(),
            revision: self.revision,
        };
        match self
            .deps
            .event_log
            .save_snapshot(&self.thing_id, &snapshot)
            .await
        {
            Ok(()) => {
                tracing::debug!(thing_id = %self.thing_id, revision = self.revision, "snapshot saved")
            }
            Err(e) => {
                tracing::warn!(thing_id = %self.thing_id, error = %e, "failed to save snapshot")
            }
        }
    }
}

/// Runs the worker loop until passivation, idle timeout, or a stop
/// condition, then answers everything still queued with "unavailable".
async fn run_worker(
    mut worker: ThingWorker,
    mut rx: mpsc::Receiver<WorkerMessage>,
    status: watch::Sender<WorkerStatus>,
) -> ExitReason {
    status.send_replace(WorkerStatus::Recovering);
    let recovery_timeout = worker.config.recovery_timeout;
    let reason = match tokio::time::timeout(recovery_timeout, worker.recover()).await {
        Ok(Ok(replayed)) => {
            tracing::info!(
                thing_id = %worker.thing_id,
                events_replayed = replayed,
                revision = worker.revision,
                "worker recovered"
            );
            process(&mut worker, &mut rx, &status).await
        }
        Ok(Err(e)) => {
            tracing::error!(thing_id = %worker.thing_id, error = %e, "recovery failed");
            ExitReason::Crashed(e.to_string())
        }
        Err(_elapsed) => {
            tracing::error!(thing_id = %worker.thing_id, timeout = ?recovery_timeout, "recovery timed out");
            ExitReason::Crashed(format!("recovery timed out after {recovery_timeout:?}"))
        }
    };

    status.send_replace(WorkerStatus::Terminating);
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        if let WorkerMessage::Execute { reply, .. } = msg {
            let _ = reply.send(Err(ExecuteError::unavailable(
                &worker.thing_id,
                "worker is shutting down",
            )));
        }
    }
    status.send_replace(WorkerStatus::Terminated);
    tracing::debug!(thing_id = %worker.thing_id, %reason, "worker terminated");
    reason
}

async fn process(
    worker: &mut ThingWorker,
    rx: &mut mpsc::Receiver<WorkerMessage>,
    status: &watch::Sender<WorkerStatus>,
) -> ExitReason {
    status.send_replace(WorkerStatus::Active);
    let idle_timeout = worker.config.idle_timeout;
    let mut idle = false;
    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(WorkerMessage::Execute { envelope, reply })) => {
                status.send_replace(WorkerStatus::Applying);
                let span = tracing::info_span!(
                    "execute",
                    thing_id = %worker.thing_id,
                    command = envelope.kind().name(),
                );
                match worker.execute(envelope).instrument(span).await {
                    Step::Continue(result) => {
                        // The caller may have given up; nothing to do then.
                        let _ = reply.send(result);
                        status.send_replace(WorkerStatus::Active);
                    }
                    Step::Exit(result, reason) => {
                        let _ = reply.send(result);
                        return reason;
                    }
                }
            }
            Ok(Some(WorkerMessage::GetState { reply })) => {
                let _ = reply.send(worker.state());
            }
            Ok(Some(WorkerMessage::Passivate)) => return ExitReason::Passivated,
            Ok(None) if idle => return ExitReason::Idle,
            Ok(None) => return ExitReason::Stopped,
            Err(_elapsed) => {
                // Stop accepting, but still serve what was queued before the
                // mailbox closed.
                tracing::info!(thing_id = %worker.thing_id, "worker idle, passivating");
                rx.close();
                idle = true;
            }
        }
    }
}

pub(crate) enum EnqueueError {
    Full,
    /// The worker stopped taking messages. Carries the rejected command.
    Closed(CommandEnvelope),
}

/// Cloneable handle to a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    thing_id: ThingId,
    sender: mpsc::Sender<WorkerMessage>,
    status: watch::Receiver<WorkerStatus>,
}

impl WorkerHandle {
    pub fn thing_id(&self) -> &ThingId {
        &self.thing_id
    }

    /// Queue a command without waiting for its result.
    ///
    /// Commands are processed in the order they were queued.
    ///
    /// # Errors
    ///
    /// [`ExecuteError::Unavailable`] if the mailbox is full or the worker
    /// has stopped.
    pub fn enqueue(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<oneshot::Receiver<ExecuteResult>, ExecuteError> {
        self.try_enqueue(envelope).map_err(|e| match e {
            EnqueueError::Full => {
                ExecuteError::unavailable(&self.thing_id, "worker mailbox is full")
            }
            EnqueueError::Closed(_) => {
                ExecuteError::unavailable(&self.thing_id, "worker is not running")
            }
        })
    }

    /// Like [`enqueue`](WorkerHandle::enqueue), but a closed mailbox hands
    /// the command back so it can go to a fresh worker.
    pub(crate) fn try_enqueue(
        &self,
        envelope: CommandEnvelope,
    ) -> Result<oneshot::Receiver<ExecuteResult>, EnqueueError> {
        use mpsc::error::TrySendError;

        let (tx, rx) = oneshot::channel();
        let msg = WorkerMessage::Execute {
            envelope,
            reply: tx,
        };
        match self.sender.try_send(msg) {
            Ok(()) => Ok(rx),
            Err(TrySendError::Closed(WorkerMessage::Execute { envelope, .. })) => {
                Err(EnqueueError::Closed(envelope))
            }
            // Only `Execute` is sent above, so this is a full mailbox.
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => Err(EnqueueError::Full),
        }
    }

    /// Send a command and wait for the result.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- a strategy rejected the command.
    /// * [`ExecuteError::RevisionConflict`] -- the log moved on without this worker.
    /// * [`ExecuteError::Unavailable`] -- the worker stopped before answering.
    /// * [`ExecuteError::Internal`] -- the append failed after retries, or a
    ///   strategy could not handle the command.
    pub async fn execute(&self, envelope: CommandEnvelope) -> ExecuteResult {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Execute {
                envelope,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::unavailable(&self.thing_id, "worker is not running"))?;
        rx.await
            .map_err(|_| ExecuteError::unavailable(&self.thing_id, "worker stopped"))?
    }

    /// Read the current state without going through a command.
    ///
    /// # Errors
    ///
    /// [`StateError::WorkerGone`] if the worker has stopped.
    pub async fn state(&self) -> Result<ThingState, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::WorkerGone)?;
        rx.await.map_err(|_| StateError::WorkerGone)
    }

    /// Ask the worker to stop once it has finished what it is doing.
    ///
    /// Returns `false` if the request could not be queued.
    pub fn passivate(&self) -> bool {
        self.sender.try_send(WorkerMessage::Passivate).is_ok()
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.borrow()
    }

    /// Whether the worker task is still accepting messages.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn a worker for `thing_id` on the current tokio runtime.
///
/// The worker starts in [`WorkerStatus::Recovering`]. Messages sent before
/// recovery completes are queued and processed afterwards.
///
/// # Returns
///
/// The handle, and the task's join handle which resolves to the
/// [`ExitReason`].
pub fn spawn_worker(
    thing_id: ThingId,
    deps: WorkerDeps,
    config: WorkerConfig,
) -> (WorkerHandle, JoinHandle<ExitReason>) {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let (status_tx, status_rx) = watch::channel(WorkerStatus::Recovering);
    let worker = ThingWorker {
        thing_id: thing_id.clone(),
        deps,
        config,
        thing: None,
        revision: 0,
        since_snapshot: 0,
    };
    let join = tokio::spawn(run_worker(worker, rx, status_tx));
    (
        WorkerHandle {
            thing_id,
            sender: tx,
            status: status_rx,
        },
        join,
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::SystemClock;
    use crate::event_log::InMemoryEventLog;

    pub(crate) fn deps(log: impl EventLog) -> WorkerDeps {
        WorkerDeps {
            event_log: Arc::new(log),
            strategies: Arc::new(StrategyRegistry::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub(crate) fn memory_deps() -> (InMemoryEventLog, WorkerDeps) {
        let log = InMemoryEventLog::new();
        let deps = deps(log.clone());
        (log, deps)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    use super::test_support::{deps, memory_deps};
    use super::*;
    use crate::command::{Command, Headers};
    use crate::error::ThingError;
    use crate::event::ThingEvent;
    use crate::event_log::test_doubles::FlakyEventLog;
    use crate::pointer::JsonPointer;
    use crate::response::ResponseStatus;
    use crate::storage::FileEventLog;
    use crate::thing::test_fixtures::{room, room_id, thermostat};

    fn envelope(command: Command) -> CommandEnvelope {
        CommandEnvelope::new(room_id(), command)
    }

    fn modify_thermostat() -> CommandEnvelope {
        envelope(Command::ModifyFeature {
            feature_id: "thermostat".into(),
            feature: thermostat(),
        })
    }

    #[tokio::test]
    async fn room_scenario() {
        let (log, deps) = memory_deps();
        let (handle, _join) = spawn_worker(room_id(), deps, WorkerConfig::default());

        let result = handle
            .execute(envelope(Command::DeleteAttribute {
                pointer: JsonPointer::parse("/temperature"),
            }))
            .await;
        assert!(
            matches!(
                result,
                Err(ExecuteError::Domain(ThingError::AttributeNotFound { .. }))
            ),
            "expected AttributeNotFound, got: {result:?}"
        );
        assert_eq!(handle.state().await.unwrap().revision, 0);

        let created = handle.execute(modify_thermostat()).await.unwrap();
        assert_eq!(created.status, ResponseStatus::Created);
        assert_eq!(handle.state().await.unwrap().revision, 1);

        let modified = handle.execute(modify_thermostat()).await.unwrap();
        assert_eq!(modified.status, ResponseStatus::Modified);
        assert_eq!(handle.state().await.unwrap().revision, 2);

        let types: Vec<_> = log
            .events(&room_id())
            .iter()
            .map(StoredEvent::event_type)
            .collect();
        assert_eq!(types, ["FeatureCreated", "FeatureModified"]);
    }

    #[tokio::test]
    async fn state_recovers_after_respawn() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let expected = {
            let (handle, join) = spawn_worker(
                room_id(),
                deps(FileEventLog::new(tmp.path())),
                WorkerConfig::default(),
            );
            handle
                .execute(envelope(Command::CreateThing { thing: room() }))
                .await
                .expect("create should succeed");
            handle
                .execute(modify_thermostat())
                .await
                .expect("modify should succeed");
            handle
                .execute(envelope(Command::ModifyAttribute {
                    pointer: JsonPointer::parse("/floor"),
                    value: json!(3),
                }))
                .await
                .expect("modify attribute should succeed");
            let state = handle.state().await.unwrap();
            drop(handle);
            assert_eq!(join.await.unwrap(), ExitReason::Stopped);
            state
        };

        let (handle, _join) = spawn_worker(
            room_id(),
            deps(FileEventLog::new(tmp.path())),
            WorkerConfig::default(),
        );
        let recovered = handle.state().await.unwrap();
        assert_eq!(recovered, expected);
        assert_eq!(recovered.revision, 3);
    }

    #[tokio::test]
    async fn recovers_from_snapshot_and_tail() {
        let (log, worker_deps) = memory_deps();
        let config = WorkerConfig {
            snapshot_every: 2,
            ..WorkerConfig::default()
        };
        let (handle, _join) = spawn_worker(room_id(), worker_deps.clone(), config.clone());
        handle
            .execute(envelope(Command::CreateThing { thing: room() }))
            .await
            .unwrap();
        handle.execute(modify_thermostat()).await.unwrap();
        handle.execute(modify_thermostat()).await.unwrap();
        let before = handle.state().await.unwrap();
        assert!(handle.passivate());

        let snapshot = log.snapshot(&room_id()).expect("snapshot after two events");
        assert_eq!(snapshot.revision, 2);

        let (handle, _join) = spawn_worker(room_id(), worker_deps, config);
        assert_eq!(handle.state().await.unwrap(), before);
    }

    #[tokio::test]
    async fn gap_in_stream_crashes_recovery() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = FileEventLog::new(tmp.path());
        let id = room_id();

        let event = |revision| {
            StoredEvent::new(
                id.clone(),
                revision,
                Utc::now(),
                &Headers::default(),
                ThingEvent::AttributesDeleted,
            )
        };
        let lines: Vec<String> = [event(1), event(3)]
            .iter()
            .map(|e| serde_json::to_string(e).unwrap())
            .collect();
        std::fs::create_dir_all(log.layout().stream_dir(&id)).unwrap();
        std::fs::write(log.layout().events_path(&id), lines.join("\n")).unwrap();

        let (handle, join) = spawn_worker(id, deps(log), WorkerConfig::default());
        let reason = join.await.unwrap();
        assert!(
            matches!(reason, ExitReason::Crashed(ref msg) if msg.contains("expected revision 2")),
            "expected Crashed, got: {reason:?}"
        );
        assert!(reason.is_abnormal());
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn stale_worker_fails_with_conflict_and_exits() {
        let (log, deps) = memory_deps();
        let id = room_id();
        let (handle, join) = spawn_worker(id.clone(), deps, WorkerConfig::default());
        handle.execute(modify_thermostat()).await.unwrap();

        // Another writer takes revision 2 behind the worker's back.
        log.append(
            &id,
            1,
            &StoredEvent::new(
                id.clone(),
                2,
                Utc::now(),
                &Headers::default(),
                ThingEvent::AttributesDeleted,
            ),
        )
        .await
        .unwrap();

        let result = handle.execute(modify_thermostat()).await;
        assert!(
            matches!(
                result,
                Err(ExecuteError::RevisionConflict {
                    expected: 1,
                    actual: 2,
                    ..
                })
            ),
            "expected RevisionConflict, got: {result:?}"
        );
        assert_eq!(
            join.await.unwrap(),
            ExitReason::Stale {
                expected: 1,
                actual: 2
            }
        );
        assert_eq!(log.head(&id), 2);
    }

    #[tokio::test]
    async fn create_with_foreign_id_is_fatal() {
        let (log, deps) = memory_deps();
        let (handle, join) = spawn_worker(room_id(), deps, WorkerConfig::default());
        let foreign = Thing::new(ThingId::parse("org.example:room-2").unwrap());

        let result = handle
            .execute(envelope(Command::CreateThing { thing: foreign }))
            .await;
        assert!(
            matches!(result, Err(ExecuteError::Internal { .. })),
            "expected Internal, got: {result:?}"
        );
        assert!(matches!(join.await.unwrap(), ExitReason::Fatal(_)));
        assert!(log.events(&room_id()).is_empty());
    }

    #[tokio::test]
    async fn conflict_on_existing_thing_keeps_worker_running() {
        let (_log, deps) = memory_deps();
        let (handle, _join) = spawn_worker(room_id(), deps, WorkerConfig::default());
        handle
            .execute(envelope(Command::CreateThing { thing: room() }))
            .await
            .unwrap();
        let result = handle
            .execute(envelope(Command::CreateThing { thing: room() }))
            .await;
        assert!(matches!(
            result,
            Err(ExecuteError::Domain(ThingError::ThingConflict { .. }))
        ));
        assert!(handle.is_alive());
        assert_eq!(handle.state().await.unwrap().revision, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_append_failures_are_retried() {
        let log = FlakyEventLog::failing(2);
        let inner = log.inner.clone();
        let (handle, _join) = spawn_worker(room_id(), deps(log), WorkerConfig::default());

        let response = handle.execute(modify_thermostat()).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Created);
        assert_eq!(inner.head(&room_id()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_append_retries_are_internal() {
        let log = FlakyEventLog::failing(5);
        let (handle, _join) = spawn_worker(room_id(), deps(log), WorkerConfig::default());

        let result = handle.execute(modify_thermostat()).await;
        assert!(
            matches!(result, Err(ExecuteError::Internal { .. })),
            "expected Internal, got: {result:?}"
        );
        assert!(handle.is_alive());
        assert_eq!(handle.state().await.unwrap().revision, 0);
    }

    #[tokio::test]
    async fn passivation_drains_queued_commands() {
        let (log, deps) = memory_deps();
        let (handle, join) = spawn_worker(room_id(), deps, WorkerConfig::default());

        // Both are queued before the worker task gets to run.
        assert!(handle.passivate());
        let pending = handle.enqueue(modify_thermostat()).unwrap();

        assert_eq!(join.await.unwrap(), ExitReason::Passivated);
        let result = pending.await.expect("queued command must be answered");
        assert!(
            matches!(result, Err(ExecuteError::Unavailable { .. })),
            "expected Unavailable, got: {result:?}"
        );
        assert!(!handle.is_alive());
        assert_eq!(handle.status(), WorkerStatus::Terminated);
        assert!(log.events(&room_id()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_passivates_worker() {
        let (_log, deps) = memory_deps();
        let config = WorkerConfig {
            idle_timeout: Duration::from_millis(200),
            ..WorkerConfig::default()
        };
        let (handle, join) = spawn_worker(room_id(), deps, config);
        handle.execute(modify_thermostat()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!handle.is_alive(), "worker should be gone after idle timeout");
        assert_eq!(join.await.unwrap(), ExitReason::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_traffic_prevents_idle_passivation() {
        let (_log, deps) = memory_deps();
        let config = WorkerConfig {
            idle_timeout: Duration::from_millis(300),
            ..WorkerConfig::default()
        };
        let (handle, _join) = spawn_worker(room_id(), deps, config);
        for _ in 0..5 {
            handle.execute(modify_thermostat()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(handle.is_alive());
        assert_eq!(handle.state().await.unwrap().revision, 5);
    }

    #[tokio::test]
    async fn enqueue_on_stopped_worker_is_unavailable() {
        let (_log, deps) = memory_deps();
        let (handle, join) = spawn_worker(room_id(), deps, WorkerConfig::default());
        assert!(handle.passivate());
        join.await.unwrap();

        let err = handle.enqueue(modify_thermostat()).unwrap_err();
        assert!(matches!(err, ExecuteError::Unavailable { .. }));
        assert!(matches!(handle.state().await, Err(StateError::WorkerGone)));
    }
}
