//! Live signals and the publish/subscribe fabric they travel on.
//!
//! Live traffic is never persisted. Commands, events and messages are
//! published to the topic class matching their [`StreamingType`]; devices
//! (or tests) subscribe to a topic class and answer through the reply path
//! the publisher chose.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;

use crate::command::{CommandEnvelope, Headers};
use crate::error::FailureKind;
use crate::event::ThingEvent;
use crate::response::CommandResponse;
use crate::thing::ThingId;

/// Topic class a live signal is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingType {
    Messages,
    LiveEvents,
    LiveCommands,
}

impl StreamingType {
    pub const ALL: [StreamingType; 3] = [
        StreamingType::Messages,
        StreamingType::LiveEvents,
        StreamingType::LiveCommands,
    ];
}

/// An event emitted on the live channel by a device, not by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub thing_id: ThingId,
    pub event: ThingEvent,
    #[serde(default)]
    pub headers: Headers,
}

/// A free-form message to or from a thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMessage {
    pub thing_id: ThingId,
    pub subject: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub headers: Headers,
}

/// Anything a caller can send to a thing's supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Signal {
    Command(CommandEnvelope),
    Event(LiveEvent),
    Message(LiveMessage),
}

impl Signal {
    pub fn thing_id(&self) -> &ThingId {
        match self {
            Signal::Command(envelope) => &envelope.thing_id,
            Signal::Event(event) => &event.thing_id,
            Signal::Message(message) => &message.thing_id,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Signal::Command(envelope) => &envelope.headers,
            Signal::Event(event) => &event.headers,
            Signal::Message(message) => &message.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Signal::Command(envelope) => &mut envelope.headers,
            Signal::Event(event) => &mut event.headers,
            Signal::Message(message) => &mut message.headers,
        }
    }

    pub fn streaming_type(&self) -> StreamingType {
        match self {
            Signal::Command(_) => StreamingType::LiveCommands,
            Signal::Event(_) => StreamingType::LiveEvents,
            Signal::Message(_) => StreamingType::Messages,
        }
    }

    /// Short name used in logs and error messages.
    pub fn name(&self) -> String {
        match self {
            Signal::Command(envelope) => envelope.kind().name().to_owned(),
            Signal::Event(event) => event.event.event_type().to_owned(),
            Signal::Message(message) => format!("message:{}", message.subject),
        }
    }

    /// Whether the sender expects an answer. Live events never get one.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Signal::Event(_)) && self.headers().response_required
    }
}

/// A signal as handed to the fabric.
#[derive(Debug, Clone)]
pub struct PublishedSignal {
    pub streaming_type: StreamingType,
    pub signal: Signal,
    /// Whether the publisher needs the fabric to confirm delivery.
    pub ack_requested: bool,
    /// Where a responder sends its answer when the publisher dispatched
    /// locally. `None` means answers travel through the correlation cache.
    pub reply_to: Option<mpsc::Sender<CommandResponse>>,
}

impl PublishedSignal {
    pub fn new(signal: Signal) -> Self {
        Self {
            streaming_type: signal.streaming_type(),
            signal,
            ack_requested: false,
            reply_to: None,
        }
    }

    pub fn with_ack(mut self, ack_requested: bool) -> Self {
        self.ack_requested = ack_requested;
        self
    }

    pub fn with_reply_to(mut self, reply_to: mpsc::Sender<CommandResponse>) -> Self {
        self.reply_to = Some(reply_to);
        self
    }
}

/// Delivery acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub streaming_type: StreamingType,
    /// Number of subscribers the signal reached.
    pub subscribers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PubSubError {
    /// An acknowledgement was requested but nobody is subscribed.
    #[error("no subscribers for {0:?}")]
    NotDelivered(StreamingType),

    #[error("pub/sub fabric unavailable: {0}")]
    Unavailable(String),
}

impl PubSubError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Unavailable
    }

    pub fn is_retryable(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Publish `signal` to the topic class it names.
    ///
    /// # Errors
    ///
    /// [`PubSubError`] if the signal could not be delivered.
    async fn publish(&self, signal: PublishedSignal) -> Result<PublishAck, PubSubError>;
}

/// Process-local fabric built on tokio broadcast channels, one per topic
/// class.
#[derive(Debug, Clone)]
pub struct InMemoryPubSub {
    topics: HashMap<StreamingType, broadcast::Sender<PublishedSignal>>,
}

impl InMemoryPubSub {
    /// Create a fabric whose topics buffer up to `capacity` signals per
    /// lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let topics = StreamingType::ALL
            .into_iter()
            .map(|t| (t, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self { topics }
    }

    /// Subscribe to one topic class.
    pub fn subscribe(&self, streaming_type: StreamingType) -> BroadcastStream<PublishedSignal> {
        BroadcastStream::new(self.sender(streaming_type).subscribe())
    }

    /// Subscribe with a raw receiver, for callers that poll with `recv`.
    pub fn receiver(&self, streaming_type: StreamingType) -> broadcast::Receiver<PublishedSignal> {
        self.sender(streaming_type).subscribe()
    }

    fn sender(&self, streaming_type: StreamingType) -> &broadcast::Sender<PublishedSignal> {
        // Every topic is created in `new`.
        &self.topics[&streaming_type]
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, signal: PublishedSignal) -> Result<PublishAck, PubSubError> {
        let streaming_type = signal.streaming_type;
        let ack_requested = signal.ack_requested;
        match self.sender(streaming_type).send(signal) {
            Ok(subscribers) => Ok(PublishAck {
                streaming_type,
                subscribers,
            }),
            Err(_) if ack_requested => Err(PubSubError::NotDelivered(streaming_type)),
            Err(_) => Ok(PublishAck {
                streaming_type,
                subscribers: 0,
            }),
        }
    }
}
