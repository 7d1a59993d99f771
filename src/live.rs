//! The live channel: non-persisted request/response over pub/sub.
//!
//! A live signal never reaches a worker. [`LiveDispatcher`] publishes it on
//! the fabric and, when the sender wants an answer, waits for the matching
//! response in one of two ways:
//!
//! - **global dispatch**: the caller's reply channel is registered in the
//!   shared [`CorrelationCache`] under the signal's correlation id, and the
//!   inbound response listener resolves it;
//! - **local dispatch**: a transient forwarder task, bound to this one
//!   caller, receives the response through the `reply_to` sender attached
//!   to the published signal.
//!
//! Either way the caller waits at most the effective live timeout (see
//! [`effective_live_timeout`]).

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_stream::{Stream, StreamExt};

use crate::clock::deadline_after;
use crate::command::Headers;
use crate::config::LiveConfig;
use crate::correlation::{CorrelationCache, CorrelationError};
use crate::error::ExecuteError;
use crate::pubsub::{PubSub, PubSubError, PublishAck, PublishedSignal, Signal};
use crate::response::{CommandResponse, Resource, ResponseStatus};
use crate::retry::ask_with_retry;
use crate::worker::ExecuteResult;

/// How long a live request may still wait for its response.
///
/// The declared timeout (or the configured default) minus the time already
/// spent since the request was accepted, never below
/// [`LiveConfig::min_timeout`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use twinfold::{LiveConfig, effective_live_timeout};
///
/// let config = LiveConfig::default();
/// let timeout = effective_live_timeout(
///     Some(Duration::from_secs(10)),
///     &config,
///     Duration::from_secs(3),
/// );
/// assert_eq!(timeout, Duration::from_secs(7));
/// ```
pub fn effective_live_timeout(
    declared: Option<Duration>,
    config: &LiveConfig,
    elapsed: Duration,
) -> Duration {
    declared
        .unwrap_or(config.default_timeout)
        .saturating_sub(elapsed)
        .max(config.min_timeout)
}

/// Whether responses for this request go through the correlation cache.
/// The header wins; the config decides when it is absent.
pub fn dispatch_globally(headers: &Headers, config: &LiveConfig) -> bool {
    headers.dispatch_globally.unwrap_or(config.dispatch_globally)
}

/// Publishes live signals and waits for their responses.
///
/// Cheap to clone. Every clone shares the fabric and the correlation cache.
#[derive(Clone)]
pub struct LiveDispatcher {
    pubsub: Arc<dyn PubSub>,
    cache: CorrelationCache,
    config: LiveConfig,
}

impl fmt::Debug for LiveDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveDispatcher")
            .field("pending", &self.cache.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LiveDispatcher {
    pub fn new(pubsub: Arc<dyn PubSub>, cache: CorrelationCache, config: LiveConfig) -> Self {
        Self {
            pubsub,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &CorrelationCache {
        &self.cache
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    /// Publish `signal` and wait for its answer.
    ///
    /// `received_at` is when the request was accepted; time spent before
    /// this call counts against the live timeout.
    ///
    /// Signals that expect no response are answered with
    /// [`ResponseStatus::Accepted`] as soon as the fabric took them.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::CorrelationCollision`] -- another pending request
    ///   owns the correlation id.
    /// * [`ExecuteError::Internal`] -- publishing failed after retries.
    /// * [`ExecuteError::Timeout`] -- no response arrived in time.
    pub async fn dispatch(&self, mut signal: Signal, received_at: Instant) -> ExecuteResult {
        if !signal.expects_response() {
            let accepted = accepted(&signal);
            self.publish(PublishedSignal::new(signal)).await?;
            return Ok(accepted);
        }

        let timeout = effective_live_timeout(
            signal.headers().timeout,
            &self.config,
            received_at.elapsed(),
        );
        let headers = signal.headers_mut();
        headers.timeout = Some(timeout);
        let token = headers
            .correlation_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        if dispatch_globally(signal.headers(), &self.config) {
            self.dispatch_global(signal, token, timeout).await
        } else {
            self.dispatch_local(signal, token, timeout).await
        }
    }

    async fn dispatch_global(
        &self,
        signal: Signal,
        token: String,
        timeout: Duration,
    ) -> ExecuteResult {
        let thing_id = signal.thing_id().clone();
        let deadline = deadline_after(Instant::now(), timeout);
        let (tx, rx) = oneshot::channel();
        self.cache
            .put(token.clone(), tx, deadline)
            .map_err(|CorrelationError::Collision(correlation_id)| {
                tracing::warn!(thing_id = %thing_id, %correlation_id, "correlation id already pending");
                ExecuteError::CorrelationCollision { correlation_id }
            })?;

        let published = PublishedSignal::new(signal).with_ack(true);
        if let Err(e) = self.publish(published).await {
            self.cache.take(&token);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                self.cache.release(&token);
                tracing::debug!(thing_id = %thing_id, correlation_id = %token, "live request timed out");
                Err(ExecuteError::Timeout { thing_id, timeout })
            }
        }
    }

    async fn dispatch_local(
        &self,
        signal: Signal,
        token: String,
        timeout: Duration,
    ) -> ExecuteResult {
        let thing_id = signal.thing_id().clone();
        let (tx, rx) = oneshot::channel();
        let reply_to = spawn_forwarder(token, tx, timeout);

        let published = PublishedSignal::new(signal)
            .with_ack(true)
            .with_reply_to(reply_to);
        self.publish(published).await?;

        rx.await.map_err(|_| ExecuteError::Timeout { thing_id, timeout })
    }

    async fn publish(&self, signal: PublishedSignal) -> Result<PublishAck, ExecuteError> {
        let thing_id = signal.signal.thing_id().clone();
        let name = signal.signal.name();
        let ack = ask_with_retry(
            &self.config.publish_retry,
            PubSubError::is_retryable,
            |_| {
                let pubsub = Arc::clone(&self.pubsub);
                let signal = signal.clone();
                async move { pubsub.publish(signal).await }
            },
        )
        .await
        .map_err(|e| {
            tracing::warn!(thing_id = %thing_id, signal = %name, error = %e, "live publish failed");
            ExecuteError::internal_with("live publish failed", e)
        })?;
        tracing::debug!(
            thing_id = %thing_id,
            signal = %name,
            streaming_type = ?ack.streaming_type,
            subscribers = ack.subscribers,
            "live signal published"
        );
        Ok(ack)
    }
}

fn accepted(signal: &Signal) -> CommandResponse {
    let resource = match signal {
        Signal::Message(message) => Resource::Message(message.subject.clone()),
        Signal::Command(_) | Signal::Event(_) => Resource::Thing,
    };
    CommandResponse::new(signal.thing_id().clone(), resource, ResponseStatus::Accepted)
        .with_correlation_id(signal.headers().correlation_id.clone())
}

/// Spawn a forwarder that hands the first response it receives to
/// `caller`, then stops. It gives up after `timeout`, dropping `caller`.
///
/// Returns the sender responders use to reach it.
fn spawn_forwarder(
    token: String,
    caller: oneshot::Sender<CommandResponse>,
    timeout: Duration,
) -> mpsc::Sender<CommandResponse> {
    let (tx, mut rx) = mpsc::channel(1);
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(response)) => {
                if caller.send(response).is_err() {
                    tracing::info!(correlation_id = %token, "live caller went away, response dropped");
                }
            }
            Ok(None) | Err(_) => {
                tracing::debug!(correlation_id = %token, "forwarder finished without a response");
            }
        }
    });
    tx
}

/// Hand an inbound live response to the caller waiting for it.
///
/// Returns `false` if the response carries no correlation id, if no caller
/// is waiting under it (unknown, expired or already answered), or if the
/// caller went away. Such responses are logged and discarded.
pub fn deliver_response(cache: &CorrelationCache, response: CommandResponse) -> bool {
    let Some(token) = response.correlation_id.clone() else {
        tracing::info!(thing_id = %response.thing_id, "live response without correlation id discarded");
        return false;
    };
    let Some(requester) = cache.take(&token) else {
        tracing::info!(
            thing_id = %response.thing_id,
            correlation_id = %token,
            "live response for unknown or expired correlation id discarded"
        );
        return false;
    };
    if requester.send(response).is_err() {
        tracing::info!(correlation_id = %token, "live caller went away, response dropped");
        return false;
    }
    true
}

/// Handle for a running inbound response listener.
///
/// Dropping the handle does not stop the listener. Call
/// [`shutdown`](ResponseListener::shutdown) for that.
#[derive(Clone)]
pub struct ResponseListener {
    shutdown_tx: watch::Sender<bool>,
    delivered: Arc<AtomicU64>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl ResponseListener {
    /// Start resolving responses from `responses` against `cache`.
    ///
    /// The listener runs until the stream ends or it is shut down.
    pub fn spawn<S>(cache: CorrelationCache, responses: S) -> Self
    where
        S: Stream<Item = CommandResponse> + Send + Unpin + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let delivered = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_response_listener(
            cache,
            responses,
            Arc::clone(&delivered),
            shutdown_rx,
        ));
        Self {
            shutdown_tx,
            delivered,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Number of responses handed to a waiting caller so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    /// Stop the listener and wait for it to exit.
    ///
    /// Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the listener task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            join_handle
                .await
                .map_err(|e| io::Error::other(format!("response listener panicked: {e}")))?;
        }
        Ok(())
    }
}

/// How often the listener drops correlation entries whose caller timed out.
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

async fn run_response_listener<S>(
    cache: CorrelationCache,
    mut responses: S,
    delivered: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: Stream<Item = CommandResponse> + Unpin,
{
    let mut purge = tokio::time::interval_at(Instant::now() + PURGE_INTERVAL, PURGE_INTERVAL);
    purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            next = responses.next() => {
                let Some(response) = next else {
                    tracing::debug!("response listener: stream ended");
                    return;
                };
                if deliver_response(&cache, response) {
                    delivered.fetch_add(1, Ordering::AcqRel);
                }
            }
            _ = purge.tick() => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "response listener: dropped expired correlation entries");
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::debug!("response listener: shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;
    use crate::command::{Channel, Command, CommandEnvelope};
    use crate::event::ThingEvent;
    use crate::pubsub::{InMemoryPubSub, LiveEvent, StreamingType};
    use crate::thing::test_fixtures::room_id;

    fn live_headers() -> Headers {
        Headers::default()
            .with_channel(Channel::Live)
            .with_timeout(Duration::from_secs(5))
    }

    fn live_command(headers: Headers) -> Signal {
        Signal::Command(
            CommandEnvelope::new(room_id(), Command::RetrievePolicyId).with_headers(headers),
        )
    }

    fn dispatcher(fabric: &InMemoryPubSub, cache: &CorrelationCache) -> LiveDispatcher {
        LiveDispatcher::new(Arc::new(fabric.clone()), cache.clone(), LiveConfig::default())
    }

    fn reply_to(signal: &Signal) -> CommandResponse {
        CommandResponse::new(room_id(), Resource::PolicyId, ResponseStatus::Replied)
            .with_correlation_id(signal.headers().correlation_id.clone())
    }

    #[test]
    fn timeout_subtracts_elapsed_and_respects_floor() {
        let config = LiveConfig::default();
        assert_eq!(
            effective_live_timeout(None, &config, Duration::from_secs(10)),
            Duration::from_secs(50)
        );
        assert_eq!(
            effective_live_timeout(Some(Duration::from_secs(2)), &config, Duration::from_secs(5)),
            config.min_timeout
        );
    }

    #[test]
    fn header_overrides_dispatch_default() {
        let config = LiveConfig::default();
        assert!(dispatch_globally(&Headers::default(), &config));
        let local = Headers::default().with_dispatch_globally(false);
        assert!(!dispatch_globally(&local, &config));
    }

    #[tokio::test(start_paused = true)]
    async fn global_dispatch_resolves_through_cache() {
        let fabric = InMemoryPubSub::default();
        let cache = CorrelationCache::new();
        let mut commands = fabric.receiver(StreamingType::LiveCommands);
        let live = dispatcher(&fabric, &cache);

        // Two of the five seconds are spent before dispatch starts.
        let received_at = Instant::now();
        tokio::time::advance(Duration::from_secs(2)).await;
        let pending = tokio::spawn({
            let live = live.clone();
            async move { live.dispatch(live_command(live_headers()), received_at).await }
        });

        let published = commands.recv().await.unwrap();
        assert!(published.reply_to.is_none());
        assert_eq!(published.signal.headers().timeout, Some(Duration::from_secs(3)));
        let token = published.signal.headers().correlation_id.clone().unwrap();
        assert!(cache.contains(&token));

        assert!(deliver_response(&cache, reply_to(&published.signal)));
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status, ResponseStatus::Replied);
        assert_eq!(response.correlation_id.as_deref(), Some(token.as_str()));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn global_timeout_leaves_no_entry_and_late_response_is_discarded() {
        let fabric = InMemoryPubSub::default();
        let cache = CorrelationCache::new();
        let mut commands = fabric.receiver(StreamingType::LiveCommands);
        let live = dispatcher(&fabric, &cache);

        let headers = live_headers().with_correlation_id("late-1");
        let err = live
            .dispatch(live_command(headers), Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Timeout { timeout, .. } if timeout == Duration::from_secs(5)));
        assert!(!cache.contains("late-1"));

        let published = commands.recv().await.unwrap();
        assert!(!deliver_response(&cache, reply_to(&published.signal)));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_token_collides() {
        let fabric = InMemoryPubSub::default();
        let cache = CorrelationCache::new();
        let _commands = fabric.receiver(StreamingType::LiveCommands);
        let live = dispatcher(&fabric, &cache);

        let first = tokio::spawn({
            let live = live.clone();
            async move {
                let headers = live_headers().with_correlation_id("dup");
                live.dispatch(live_command(headers), Instant::now()).await
            }
        });
        tokio::task::yield_now().await;
        assert!(cache.contains("dup"));

        let headers = live_headers().with_correlation_id("dup");
        let err = live
            .dispatch(live_command(headers), Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::CorrelationCollision { ref correlation_id } if correlation_id == "dup"));

        // The first request still owns the token.
        let response = CommandResponse::new(room_id(), Resource::PolicyId, ResponseStatus::Replied)
            .with_correlation_id(Some("dup".into()));
        assert!(deliver_response(&cache, response));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn local_dispatch_bypasses_cache() {
        let fabric = InMemoryPubSub::default();
        let cache = CorrelationCache::new();
        let mut commands = fabric.receiver(StreamingType::LiveCommands);
        let live = dispatcher(&fabric, &cache);

        let pending = tokio::spawn({
            let live = live.clone();
            async move {
                let headers = live_headers().with_dispatch_globally(false);
                live.dispatch(live_command(headers), Instant::now()).await
            }
        });

        let published = commands.recv().await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(published.signal.headers().timeout, Some(Duration::from_secs(5)));
        let reply = published.reply_to.clone().expect("local dispatch carries a reply path");
        reply.send(reply_to(&published.signal)).await.unwrap();

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status, ResponseStatus::Replied);
        // The forwarder is gone after the first response.
        tokio::task::yield_now().await;
        assert!(reply.send(reply_to(&published.signal)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn local_dispatch_times_out() {
        let fabric = InMemoryPubSub::default();
        let cache = CorrelationCache::new();
        let _commands = fabric.receiver(StreamingType::LiveCommands);
        let live = dispatcher(&fabric, &cache);

        let headers = live_headers().with_dispatch_globally(false);
        let err = live
            .dispatch(live_command(headers), Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn no_subscriber_is_internal_after_retries() {
        let fabric = InMemoryPubSub::default();
        let cache = CorrelationCache::new();
        let live = dispatcher(&fabric, &cache);

        let err = live
            .dispatch(live_command(live_headers().with_correlation_id("t")), Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Internal { .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_fire_and_forget() {
        let fabric = InMemoryPubSub::default();
        let cache = CorrelationCache::new();
        let mut events = fabric.receiver(StreamingType::LiveEvents);
        let live = dispatcher(&fabric, &cache);

        let signal = Signal::Event(LiveEvent {
            thing_id: room_id(),
            event: ThingEvent::AttributesDeleted,
            headers: live_headers(),
        });
        let response = live.dispatch(signal, Instant::now()).await.unwrap();
        assert_eq!(response.status, ResponseStatus::Accepted);
        assert!(events.recv().await.is_ok());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn listener_delivers_and_shuts_down() {
        let cache = CorrelationCache::new();
        let (tx, rx) = oneshot::channel();
        cache
            .put("t-1", tx, Instant::now() + Duration::from_secs(5))
            .unwrap();

        let (inbound, inbound_rx) = mpsc::channel(8);
        let listener = ResponseListener::spawn(cache.clone(), ReceiverStream::new(inbound_rx));

        let stray = CommandResponse::new(room_id(), Resource::Thing, ResponseStatus::Replied)
            .with_correlation_id(Some("unknown".into()));
        inbound.send(stray).await.unwrap();
        let answer = CommandResponse::new(room_id(), Resource::Thing, ResponseStatus::Replied)
            .with_correlation_id(Some("t-1".into()));
        inbound.send(answer).await.unwrap();

        assert_eq!(rx.await.unwrap().correlation_id.as_deref(), Some("t-1"));
        assert_eq!(listener.delivered(), 1);
        listener.shutdown().await.unwrap();
        listener.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn listener_purges_abandoned_entries() {
        let cache = CorrelationCache::new();
        let (tx, _rx) = oneshot::channel();
        cache
            .put("t-stale", tx, Instant::now() + Duration::from_secs(1))
            .unwrap();
        let (tx, _rx_live) = oneshot::channel();
        cache
            .put("t-live", tx, Instant::now() + Duration::from_secs(300))
            .unwrap();

        let (_inbound, inbound_rx) = mpsc::channel::<CommandResponse>(8);
        let listener = ResponseListener::spawn(cache.clone(), ReceiverStream::new(inbound_rx));

        tokio::time::sleep(PURGE_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("t-live"));
        listener.shutdown().await.unwrap();
    }
}
