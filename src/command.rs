//! Command headers, the closed command set, and the routing envelope.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::pointer::{FieldSelector, JsonPointer};
use crate::thing::{Feature, Thing, ThingId};

/// Which path a signal takes through the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Persisted, event-sourced path through the thing's worker.
    #[default]
    Twin,
    /// Real-time path published on the pub/sub fabric and never persisted.
    Live,
}

/// Cross-cutting metadata carried by every command, event, and response.
///
/// Mirrors the audit/correlation metadata that is stamped onto persisted
/// events, plus routing hints that only matter while a request is in
/// flight (`channel`, `timeout`, `dispatch_globally`).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use twinfold::{Channel, Headers};
///
/// let headers = Headers::default()
///     .with_correlation_id("req-1")
///     .with_timeout(Duration::from_secs(5))
///     .with_channel(Channel::Live)
///     .with_subject("user:alice");
///
/// assert_eq!(headers.correlation_id.as_deref(), Some("req-1"));
/// assert!(headers.response_required);
/// assert!(headers.is_live());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Correlation id for matching responses and tracing a request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Declared request timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Whether the caller waits for a response. Defaults to `true`.
    #[serde(default = "default_response_required")]
    pub response_required: bool,
    /// Persisted or live channel.
    #[serde(default)]
    pub channel: Channel,
    /// Authorization subjects of the caller.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorization_context: Vec<String>,
    /// Request that live responses be correlated through the shared cache.
    ///
    /// `None` defers to [`LiveConfig::dispatch_globally`](crate::LiveConfig).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_globally: Option<bool>,
}

fn default_response_required() -> bool {
    true
}

impl Default for Headers {
    fn default() -> Self {
        Self {
            correlation_id: None,
            timeout: None,
            response_required: true,
            channel: Channel::Twin,
            authorization_context: Vec::new(),
            dispatch_globally: None,
        }
    }
}

impl Headers {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set a freshly generated UUID v4 correlation id.
    pub fn with_random_correlation_id(self) -> Self {
        self.with_correlation_id(Uuid::new_v4().to_string())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_response_required(mut self, required: bool) -> Self {
        self.response_required = required;
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Append an authorization subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.authorization_context.push(subject.into());
        self
    }

    pub fn with_dispatch_globally(mut self, globally: bool) -> Self {
        self.dispatch_globally = Some(globally);
        self
    }

    pub fn is_live(&self) -> bool {
        self.channel == Channel::Live
    }
}

/// The closed set of commands a thing worker understands.
///
/// Adjacently tagged so commands travel as `{"type": ..., "data": ...}`
/// on the pub/sub fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Command {
    CreateThing {
        thing: Thing,
    },
    RetrieveThing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selected_fields: Option<FieldSelector>,
    },
    DeleteThing,
    ModifyPolicyId {
        policy_id: String,
    },
    RetrievePolicyId,
    ModifyAttribute {
        pointer: JsonPointer,
        value: Value,
    },
    RetrieveAttribute {
        pointer: JsonPointer,
    },
    DeleteAttribute {
        pointer: JsonPointer,
    },
    DeleteAttributes,
    ModifyFeature {
        feature_id: String,
        feature: Feature,
    },
    RetrieveFeature {
        feature_id: String,
    },
    DeleteFeature {
        feature_id: String,
    },
    ModifyFeatureProperties {
        feature_id: String,
        properties: Map<String, Value>,
    },
    DeleteFeatureProperties {
        feature_id: String,
    },
}

/// Discriminant of [`Command`], used as the strategy registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommandKind {
    CreateThing,
    RetrieveThing,
    DeleteThing,
    ModifyPolicyId,
    RetrievePolicyId,
    ModifyAttribute,
    RetrieveAttribute,
    DeleteAttribute,
    DeleteAttributes,
    ModifyFeature,
    RetrieveFeature,
    DeleteFeature,
    ModifyFeatureProperties,
    DeleteFeatureProperties,
}

impl CommandKind {
    /// Every kind, in declaration order.
    pub const ALL: [CommandKind; 14] = [
        CommandKind::CreateThing,
        CommandKind::RetrieveThing,
        CommandKind::DeleteThing,
        CommandKind::ModifyPolicyId,
        CommandKind::RetrievePolicyId,
        CommandKind::ModifyAttribute,
        CommandKind::RetrieveAttribute,
        CommandKind::DeleteAttribute,
        CommandKind::DeleteAttributes,
        CommandKind::ModifyFeature,
        CommandKind::RetrieveFeature,
        CommandKind::DeleteFeature,
        CommandKind::ModifyFeatureProperties,
        CommandKind::DeleteFeatureProperties,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::CreateThing => "createThing",
            CommandKind::RetrieveThing => "retrieveThing",
            CommandKind::DeleteThing => "deleteThing",
            CommandKind::ModifyPolicyId => "modifyPolicyId",
            CommandKind::RetrievePolicyId => "retrievePolicyId",
            CommandKind::ModifyAttribute => "modifyAttribute",
            CommandKind::RetrieveAttribute => "retrieveAttribute",
            CommandKind::DeleteAttribute => "deleteAttribute",
            CommandKind::DeleteAttributes => "deleteAttributes",
            CommandKind::ModifyFeature => "modifyFeature",
            CommandKind::RetrieveFeature => "retrieveFeature",
            CommandKind::DeleteFeature => "deleteFeature",
            CommandKind::ModifyFeatureProperties => "modifyFeatureProperties",
            CommandKind::DeleteFeatureProperties => "deleteFeatureProperties",
        }
    }

    /// Whether commands of this kind only read state.
    pub fn is_query(self) -> bool {
        matches!(
            self,
            CommandKind::RetrieveThing
                | CommandKind::RetrievePolicyId
                | CommandKind::RetrieveAttribute
                | CommandKind::RetrieveFeature
        )
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::CreateThing { .. } => CommandKind::CreateThing,
            Command::RetrieveThing { .. } => CommandKind::RetrieveThing,
            Command::DeleteThing => CommandKind::DeleteThing,
            Command::ModifyPolicyId { .. } => CommandKind::ModifyPolicyId,
            Command::RetrievePolicyId => CommandKind::RetrievePolicyId,
            Command::ModifyAttribute { .. } => CommandKind::ModifyAttribute,
            Command::RetrieveAttribute { .. } => CommandKind::RetrieveAttribute,
            Command::DeleteAttribute { .. } => CommandKind::DeleteAttribute,
            Command::DeleteAttributes => CommandKind::DeleteAttributes,
            Command::ModifyFeature { .. } => CommandKind::ModifyFeature,
            Command::RetrieveFeature { .. } => CommandKind::RetrieveFeature,
            Command::DeleteFeature { .. } => CommandKind::DeleteFeature,
            Command::ModifyFeatureProperties { .. } => CommandKind::ModifyFeatureProperties,
            Command::DeleteFeatureProperties { .. } => CommandKind::DeleteFeatureProperties,
        }
    }
}

/// A command addressed to one thing, with its headers.
///
/// `thing_id` is the routing key: the supervisor and worker that receive
/// the envelope own exactly this id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub thing_id: ThingId,
    pub command: Command,
    pub headers: Headers,
}

impl CommandEnvelope {
    pub fn new(thing_id: ThingId, command: Command) -> Self {
        Self {
            thing_id,
            command,
            headers: Headers::default(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }
}
