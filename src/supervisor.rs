//! Per-thing supervisor: owns the worker's lifecycle and routes signals.
//!
//! One supervisor task runs per active thing. It starts the worker lazily
//! on the first persisted command, restarts it with exponential backoff
//! after an abnormal exit, and answers "unavailable" without queueing while
//! a restart is pending. Live signals bypass the worker and go through the
//! [`LiveDispatcher`].
//!
//! Worker exits reach the supervisor through the worker's join handle,
//! never through the command path.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::backoff::{BackoffConfig, ExponentialBackoff, RestartDecision};
use crate::clock::deadline_after;
use crate::command::CommandEnvelope;
use crate::config::{TwinConfig, WorkerConfig};
use crate::enrichment::PolicyEnricher;
use crate::error::{ExecuteError, ThingError};
use crate::live::LiveDispatcher;
use crate::pubsub::Signal;
use crate::thing::ThingId;
use crate::worker::{
    EnqueueError, ExecuteResult, ExitReason, WorkerDeps, WorkerHandle, spawn_worker,
};

/// Lifecycle of a supervisor, observable through
/// [`SupervisorHandle::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    /// No worker running; the next persisted command starts one.
    Idle,
    /// A worker is recovering or serving.
    Running,
    /// The worker stopped abnormally and a restart is scheduled.
    BackingOff,
    /// Too many restarts; the supervisor gave up.
    Escalated,
    /// The supervisor task has ended.
    Stopped,
}

/// Why a supervisor task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Passivated,
    /// Every handle was dropped.
    Stopped,
    /// The restart budget ran out. Carries the last worker exit reason.
    Escalated(ExitReason),
}

/// Collaborators shared by every supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorDeps {
    pub worker: WorkerDeps,
    pub live: LiveDispatcher,
    /// `None` disables policy enrichment.
    pub enricher: Option<PolicyEnricher>,
}

pub(crate) enum SupervisorMessage {
    Signal {
        signal: Signal,
        received_at: Instant,
        reply: oneshot::Sender<ExecuteResult>,
    },
    Passivate,
}

enum Child {
    Absent,
    Running {
        handle: WorkerHandle,
        join: JoinHandle<ExitReason>,
    },
    BackingOff {
        until: Instant,
    },
}

impl Child {
    fn handle(&self) -> Option<WorkerHandle> {
        match self {
            Child::Running { handle, .. } => Some(handle.clone()),
            Child::Absent | Child::BackingOff { .. } => None,
        }
    }
}

enum ChildEvent {
    Exited(Result<ExitReason, JoinError>),
    BackoffElapsed,
}

/// Resolves when the running worker exits or the backoff delay ends.
/// Never resolves while no worker is running and no restart is pending.
async fn next_child_event(child: &mut Child) -> ChildEvent {
    match child {
        Child::Running { join, .. } => ChildEvent::Exited(join.await),
        Child::BackingOff { until } => {
            tokio::time::sleep_until(*until).await;
            ChildEvent::BackoffElapsed
        }
        Child::Absent => std::future::pending().await,
    }
}

struct ThingSupervisor {
    thing_id: ThingId,
    deps: SupervisorDeps,
    worker_config: WorkerConfig,
    backoff: ExponentialBackoff,
    child: Child,
    /// Incremented on every worker start.
    generation: u64,
    served_tx: mpsc::UnboundedSender<u64>,
    status: watch::Sender<SupervisorStatus>,
}

impl ThingSupervisor {
    fn start_child(&mut self) -> WorkerHandle {
        self.generation += 1;
        tracing::debug!(thing_id = %self.thing_id, generation = self.generation, "starting worker");
        let (handle, join) = spawn_worker(
            self.thing_id.clone(),
            self.deps.worker.clone(),
            self.worker_config.clone(),
        );
        self.child = Child::Running {
            handle: handle.clone(),
            join,
        };
        self.status.send_replace(SupervisorStatus::Running);
        handle
    }

    /// Route one signal. Returns `Some` when the supervisor must stop.
    async fn handle_signal(
        &mut self,
        signal: Signal,
        received_at: Instant,
        reply: oneshot::Sender<ExecuteResult>,
    ) -> Option<SupervisorExit> {
        if signal.headers().is_live() {
            let live = self.deps.live.clone();
            tokio::spawn(async move {
                let _ = reply.send(live.dispatch(signal, received_at).await);
            });
            return None;
        }

        match signal {
            Signal::Command(envelope) => self.forward(envelope, received_at, reply).await,
            other => {
                tracing::debug!(thing_id = %self.thing_id, signal = %other.name(), "signal rejected on twin channel");
                let _ = reply.send(Err(ExecuteError::Domain(ThingError::UnsupportedSignal {
                    signal: other.name(),
                })));
                None
            }
        }
    }

    /// Queue `envelope` on the worker and answer `reply` from a separate
    /// task, so the supervisor keeps serving while the worker works.
    ///
    /// A worker that closed its mailbox (idle passivation) is reaped and
    /// replaced before the command is queued. Returns `Some` when reaping
    /// it escalated.
    async fn forward(
        &mut self,
        mut envelope: CommandEnvelope,
        received_at: Instant,
        reply: oneshot::Sender<ExecuteResult>,
    ) -> Option<SupervisorExit> {
        let timeout = envelope
            .headers
            .timeout
            .unwrap_or(self.worker_config.command_timeout);
        let deadline = deadline_after(received_at, timeout);
        let enrichment = self
            .deps
            .enricher
            .clone()
            .filter(|_| PolicyEnricher::wants_policy(&envelope))
            .map(|enricher| (enricher, envelope.headers.clone()));

        let (handle, result_rx) = loop {
            if let Child::BackingOff { until } = self.child {
                let retry_in = until.saturating_duration_since(Instant::now());
                let _ = reply.send(Err(ExecuteError::unavailable(
                    &self.thing_id,
                    format!("worker is restarting, retry in {retry_in:?}"),
                )));
                return None;
            }
            let handle = match self.child.handle() {
                Some(handle) => handle,
                None => self.start_child(),
            };
            match handle.try_enqueue(envelope) {
                Ok(rx) => break (handle, rx),
                Err(EnqueueError::Closed(rejected)) => {
                    envelope = rejected;
                    if let Some(exit) = self.reap_child().await {
                        let _ = reply.send(Err(ExecuteError::unavailable(
                            &self.thing_id,
                            "restart budget exhausted",
                        )));
                        return Some(exit);
                    }
                }
                Err(EnqueueError::Full) => {
                    let _ = reply.send(Err(ExecuteError::unavailable(
                        &self.thing_id,
                        "worker mailbox is full",
                    )));
                    return None;
                }
            }
        };

        let thing_id = self.thing_id.clone();
        let served_tx = self.served_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = match tokio::time::timeout_at(deadline, result_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ExecuteError::unavailable(
                    &thing_id,
                    "worker stopped before answering",
                )),
                Err(_) => Err(ExecuteError::Timeout {
                    thing_id: thing_id.clone(),
                    timeout,
                }),
            };

            let served = match &result {
                Ok(_) => true,
                Err(e) => e.is_domain(),
            };
            if served {
                let _ = served_tx.send(generation);
            }

            let result = match (result, enrichment) {
                (Ok(response), Some((enricher, headers))) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    Ok(enricher.enrich(&handle, &headers, response, remaining).await)
                }
                (result, _) => result,
            };
            let _ = reply.send(result);
        });
        None
    }

    /// Wait for a worker that stopped taking messages and apply its exit.
    async fn reap_child(&mut self) -> Option<SupervisorExit> {
        match std::mem::replace(&mut self.child, Child::Absent) {
            Child::Running { handle, join } => {
                drop(handle);
                self.on_child_exit(join.await)
            }
            other => {
                self.child = other;
                None
            }
        }
    }

    /// Decide what follows a worker exit. Returns `Some` when the
    /// supervisor itself must stop.
    fn on_child_exit(&mut self, exit: Result<ExitReason, JoinError>) -> Option<SupervisorExit> {
        let reason =
            exit.unwrap_or_else(|e| ExitReason::Crashed(format!("worker task failed: {e}")));
        if !reason.is_abnormal() {
            tracing::debug!(thing_id = %self.thing_id, %reason, "worker stopped");
            self.child = Child::Absent;
            self.status.send_replace(SupervisorStatus::Idle);
            return None;
        }

        match self.backoff.record_restart(Instant::now()) {
            RestartDecision::Restart(delay) => {
                tracing::warn!(
                    thing_id = %self.thing_id,
                    %reason,
                    delay = ?delay,
                    restarts = self.backoff.restarts_in_window(),
                    "worker stopped abnormally, restarting after backoff"
                );
                self.child = Child::BackingOff {
                    until: deadline_after(Instant::now(), delay),
                };
                self.status.send_replace(SupervisorStatus::BackingOff);
                None
            }
            RestartDecision::Escalate => {
                tracing::error!(
                    thing_id = %self.thing_id,
                    %reason,
                    max_restarts = self.backoff.config().max_restarts,
                    "restart budget exhausted, escalating"
                );
                self.child = Child::Absent;
                self.status.send_replace(SupervisorStatus::Escalated);
                Some(SupervisorExit::Escalated(reason))
            }
        }
    }

    fn on_served(&mut self, generation: u64) {
        if generation == self.generation && self.backoff.current() != self.backoff.config().min_backoff
        {
            tracing::debug!(thing_id = %self.thing_id, "worker served a request, backoff reset");
            self.backoff.reset();
        }
    }

    /// Ask the worker to passivate and wait until it is gone.
    async fn stop_child(&mut self) {
        if let Child::Running { handle, join } = std::mem::replace(&mut self.child, Child::Absent) {
            handle.passivate();
            drop(handle);
            match join.await {
                Ok(reason) => tracing::debug!(thing_id = %self.thing_id, %reason, "worker stopped"),
                Err(e) => tracing::warn!(thing_id = %self.thing_id, error = %e, "worker task failed"),
            }
        }
    }
}

async fn run_supervisor(
    mut supervisor: ThingSupervisor,
    mut rx: mpsc::Receiver<SupervisorMessage>,
    mut served_rx: mpsc::UnboundedReceiver<u64>,
) -> SupervisorExit {
    let exit = loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(SupervisorMessage::Signal { signal, received_at, reply }) => {
                    if let Some(exit) = supervisor.handle_signal(signal, received_at, reply).await {
                        break exit;
                    }
                }
                Some(SupervisorMessage::Passivate) => {
                    supervisor.stop_child().await;
                    break SupervisorExit::Passivated;
                }
                None => {
                    supervisor.stop_child().await;
                    break SupervisorExit::Stopped;
                }
            },
            event = next_child_event(&mut supervisor.child) => match event {
                ChildEvent::Exited(exit) => {
                    if let Some(exit) = supervisor.on_child_exit(exit) {
                        break exit;
                    }
                }
                ChildEvent::BackoffElapsed => {
                    tracing::info!(thing_id = %supervisor.thing_id, "restarting worker");
                    supervisor.start_child();
                }
            },
            Some(generation) = served_rx.recv() => supervisor.on_served(generation),
        }
    };

    rx.close();
    while let Ok(msg) = rx.try_recv() {
        if let SupervisorMessage::Signal { reply, .. } = msg {
            let _ = reply.send(Err(ExecuteError::unavailable(
                &supervisor.thing_id,
                "supervisor is shutting down",
            )));
        }
    }
    if !matches!(exit, SupervisorExit::Escalated(_)) {
        supervisor.status.send_replace(SupervisorStatus::Stopped);
    }
    tracing::debug!(thing_id = %supervisor.thing_id, exit = ?exit, "supervisor stopped");
    exit
}

/// Cloneable handle to a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    thing_id: ThingId,
    sender: mpsc::Sender<SupervisorMessage>,
    status: watch::Receiver<SupervisorStatus>,
}

impl SupervisorHandle {
    pub fn thing_id(&self) -> &ThingId {
        &self.thing_id
    }

    /// Send a signal and wait for its answer.
    ///
    /// The live timeout clock starts when this is called.
    ///
    /// # Errors
    ///
    /// Everything [`WorkerHandle::execute`] and [`LiveDispatcher::dispatch`]
    /// return, plus [`ExecuteError::Unavailable`] while the worker is
    /// restarting or after the supervisor stopped, and
    /// [`ExecuteError::Timeout`] when the command deadline passes.
    pub async fn ask(&self, signal: Signal) -> ExecuteResult {
        let (tx, rx) = oneshot::channel();
        let msg = SupervisorMessage::Signal {
            signal,
            received_at: Instant::now(),
            reply: tx,
        };
        self.sender
            .send(msg)
            .await
            .map_err(|_| ExecuteError::unavailable(&self.thing_id, "supervisor is not running"))?;
        rx.await
            .map_err(|_| ExecuteError::unavailable(&self.thing_id, "supervisor stopped"))?
    }

    /// Passivate the worker and stop the supervisor.
    ///
    /// Returns `false` if the supervisor is already gone.
    pub fn passivate(&self) -> bool {
        self.sender.try_send(SupervisorMessage::Passivate).is_ok()
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Spawn a supervisor for `thing_id`. No worker is started until the first
/// persisted command arrives.
pub fn spawn_supervisor(
    thing_id: ThingId,
    deps: SupervisorDeps,
    config: &TwinConfig,
) -> (SupervisorHandle, JoinHandle<SupervisorExit>) {
    spawn_with(thing_id, deps, config.worker.clone(), config.backoff.clone())
}

fn spawn_with(
    thing_id: ThingId,
    deps: SupervisorDeps,
    worker_config: WorkerConfig,
    backoff: BackoffConfig,
) -> (SupervisorHandle, JoinHandle<SupervisorExit>) {
    let (tx, rx) = mpsc::channel(worker_config.mailbox_capacity.max(1));
    let (served_tx, served_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SupervisorStatus::Idle);
    let supervisor = ThingSupervisor {
        thing_id: thing_id.clone(),
        deps,
        worker_config,
        backoff: ExponentialBackoff::new(backoff),
        child: Child::Absent,
        generation: 0,
        served_tx,
        status: status_tx,
    };
    let join = tokio::spawn(run_supervisor(supervisor, rx, served_rx));
    (
        SupervisorHandle {
            thing_id,
            sender: tx,
            status: status_rx,
        },
        join,
    )
}
