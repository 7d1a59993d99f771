//! Command strategies: pure transitions from `(state, command)` to an outcome.
//!
//! The worker resolves a strategy by [`CommandKind`] through the
//! [`StrategyRegistry`], evaluates it against a [`StrategyContext`], and is
//! then solely responsible for appending the produced event and advancing
//! the revision. Strategies never touch the event log.
//!
//! Every strategy follows the same edge-case policy:
//!
//! - a missing target for a delete or retrieve is a not-found failure with
//!   no event;
//! - modify commands are create-or-update, and the existence check runs
//!   before the event kind is chosen;
//! - creating a thing that already exists is a conflict failure.

mod attributes;
mod features;
mod thing;

use std::collections::HashMap;

use crate::clock::Clock;
use crate::command::{Command, CommandKind, Headers};
use crate::error::ThingError;
use crate::event::{StoredEvent, ThingEvent};
use crate::response::CommandResponse;
use crate::thing::{Thing, ThingId};

pub use attributes::{
    DeleteAttributeStrategy, DeleteAttributesStrategy, ModifyAttributeStrategy,
    RetrieveAttributeStrategy,
};
pub use features::{
    DeleteFeaturePropertiesStrategy, DeleteFeatureStrategy, ModifyFeaturePropertiesStrategy,
    ModifyFeatureStrategy, RetrieveFeatureStrategy,
};
pub use thing::{
    CreateThingStrategy, DeleteThingStrategy, ModifyPolicyIdStrategy, RetrievePolicyIdStrategy,
    RetrieveThingStrategy, ThingConflictStrategy,
};

/// Everything a strategy may look at while deciding.
pub struct StrategyContext<'a> {
    pub thing_id: &'a ThingId,
    /// Current state, or `None` if the thing was never created or is deleted.
    pub thing: Option<&'a Thing>,
    /// Number of events applied so far.
    pub revision: u64,
    pub clock: &'a dyn Clock,
    pub headers: &'a Headers,
}

impl<'a> StrategyContext<'a> {
    /// The revision an event produced now would carry.
    pub fn next_revision(&self) -> u64 {
        self.revision + 1
    }

    /// Wrap `event` for the next revision, stamped with the clock and headers.
    pub fn event(&self, event: ThingEvent) -> StoredEvent {
        StoredEvent::new(
            self.thing_id.clone(),
            self.next_revision(),
            self.clock.now(),
            self.headers,
            event,
        )
    }

    /// The existing thing, or an empty one standing in for a thing with no
    /// live state.
    pub fn thing_or_empty(&self) -> Thing {
        self.thing
            .cloned()
            .unwrap_or_else(|| Thing::new(self.thing_id.clone()))
    }

    /// The existing thing, or [`ThingError::ThingNotFound`].
    pub fn existing_thing(&self) -> Result<&'a Thing, ThingError> {
        self.thing.ok_or_else(|| ThingError::ThingNotFound {
            thing_id: self.thing_id.clone(),
        })
    }

    fn response_correlation(&self, response: CommandResponse) -> CommandResponse {
        response.with_correlation_id(self.headers.correlation_id.clone())
    }
}

/// Outcome of applying one command to one state snapshot.
///
/// Never more than one event per command.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyResult {
    /// A state change: the event to append and the response to send once
    /// the append is durable.
    Mutation {
        event: StoredEvent,
        response: CommandResponse,
    },
    /// A response that needs no event (queries).
    Response(CommandResponse),
    /// A domain failure. No event, state and revision unchanged.
    Failure(ThingError),
}

impl StrategyResult {
    pub(crate) fn mutation(
        ctx: &StrategyContext<'_>,
        event: ThingEvent,
        response: CommandResponse,
    ) -> Self {
        StrategyResult::Mutation {
            event: ctx.event(event),
            response: ctx.response_correlation(response),
        }
    }

    pub(crate) fn response(ctx: &StrategyContext<'_>, response: CommandResponse) -> Self {
        StrategyResult::Response(ctx.response_correlation(response))
    }

    /// The event this result would append, if any.
    pub fn event(&self) -> Option<&StoredEvent> {
        match self {
            StrategyResult::Mutation { event, .. } => Some(event),
            _ => None,
        }
    }
}

impl From<Result<StrategyResult, ThingError>> for StrategyResult {
    fn from(result: Result<StrategyResult, ThingError>) -> Self {
        result.unwrap_or_else(StrategyResult::Failure)
    }
}

/// A strategy was asked to handle a command it cannot handle.
///
/// This is a programmer error, never a domain outcome: the worker treats it
/// as fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unhandled '{command}' for thing '{thing_id}': {reason}")]
pub struct Unhandled {
    pub thing_id: ThingId,
    pub command: &'static str,
    pub reason: String,
}

impl Unhandled {
    pub fn new(ctx: &StrategyContext<'_>, command: &Command, reason: impl Into<String>) -> Self {
        Self {
            thing_id: ctx.thing_id.clone(),
            command: command.kind().name(),
            reason: reason.into(),
        }
    }

    pub(crate) fn wrong_command(ctx: &StrategyContext<'_>, command: &Command) -> Self {
        Self::new(ctx, command, "command routed to the wrong strategy")
    }
}

/// A stateless transition for one command kind.
pub trait Strategy: Send + Sync + 'static {
    /// Whether this strategy may handle `command` in `ctx` at all.
    fn is_applicable(&self, _ctx: &StrategyContext<'_>, _command: &Command) -> bool {
        true
    }

    /// Compute the outcome of `command` against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`Unhandled`] for programmer errors, such as a command of
    /// the wrong kind or a thing id mismatch.
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled>;

    /// [`apply`](Strategy::apply), guarded by
    /// [`is_applicable`](Strategy::is_applicable).
    fn apply_checked(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        if !self.is_applicable(ctx, command) {
            return Err(Unhandled::new(ctx, command, "strategy is not applicable"));
        }
        self.apply(ctx, command)
    }
}

/// Registration table from command kind to strategy.
///
/// Resolution is a map lookup. [`StrategyRegistry::default`] registers the
/// full thing command set.
pub struct StrategyRegistry {
    strategies: HashMap<CommandKind, Box<dyn Strategy>>,
}

impl StrategyRegistry {
    /// A registry with no strategies.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Register `strategy` for `kind`, replacing any previous entry.
    pub fn register(mut self, kind: CommandKind, strategy: impl Strategy) -> Self {
        self.strategies.insert(kind, Box::new(strategy));
        self
    }

    pub fn resolve(&self, kind: CommandKind) -> Option<&dyn Strategy> {
        self.strategies.get(&kind).map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Resolve and apply the strategy for `command`.
    ///
    /// A command kind with no registered strategy yields an
    /// [`ThingError::UnsupportedCommand`] failure; it is never dropped.
    ///
    /// # Errors
    ///
    /// Propagates [`Unhandled`] from the strategy.
    pub fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        match self.resolve(command.kind()) {
            Some(strategy) => strategy.apply_checked(ctx, command),
            None => Ok(StrategyResult::Failure(ThingError::UnsupportedCommand {
                command: command.kind().name().to_owned(),
            })),
        }
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::empty()
            .register(CommandKind::CreateThing, CreateThingStrategy::default())
            .register(CommandKind::RetrieveThing, RetrieveThingStrategy)
            .register(CommandKind::DeleteThing, DeleteThingStrategy)
            .register(CommandKind::ModifyPolicyId, ModifyPolicyIdStrategy)
            .register(CommandKind::RetrievePolicyId, RetrievePolicyIdStrategy)
            .register(CommandKind::ModifyAttribute, ModifyAttributeStrategy)
            .register(CommandKind::RetrieveAttribute, RetrieveAttributeStrategy)
            .register(CommandKind::DeleteAttribute, DeleteAttributeStrategy)
            .register(CommandKind::DeleteAttributes, DeleteAttributesStrategy)
            .register(CommandKind::ModifyFeature, ModifyFeatureStrategy)
            .register(CommandKind::RetrieveFeature, RetrieveFeatureStrategy)
            .register(CommandKind::DeleteFeature, DeleteFeatureStrategy)
            .register(
                CommandKind::ModifyFeatureProperties,
                ModifyFeaturePropertiesStrategy,
            )
            .register(
                CommandKind::DeleteFeatureProperties,
                DeleteFeaturePropertiesStrategy,
            )
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.strategies.keys().copied().collect();
        kinds.sort();
        f.debug_struct("StrategyRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::FixedClock;

    pub(crate) fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap())
    }

    /// Apply `command` through the default registry.
    pub(crate) fn run(
        thing_id: &ThingId,
        thing: Option<&Thing>,
        revision: u64,
        command: Command,
    ) -> Result<StrategyResult, Unhandled> {
        let clock = clock();
        let headers = Headers::default().with_correlation_id("test-corr");
        let ctx = StrategyContext {
            thing_id,
            thing,
            revision,
            clock: &clock,
            headers: &headers,
        };
        StrategyRegistry::default().apply(&ctx, &command)
    }

    pub(crate) fn expect_mutation(result: StrategyResult) -> (StoredEvent, CommandResponse) {
        match result {
            StrategyResult::Mutation { event, response } => (event, response),
            other => panic!("expected mutation, got {other:?}"),
        }
    }

    pub(crate) fn expect_failure(result: StrategyResult) -> ThingError {
        match result {
            StrategyResult::Failure(e) => e,
            other => panic!("expected failure, got {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::pointer::JsonPointer;
    use crate::response::ResponseStatus;
    use crate::thing::test_fixtures::{room_id, thermostat};

    #[test]
    fn default_registry_covers_every_kind() {
        let registry = StrategyRegistry::default();
        assert_eq!(registry.len(), CommandKind::ALL.len());
        for kind in CommandKind::ALL {
            assert!(registry.resolve(kind).is_some(), "{kind:?} has no strategy");
        }
    }

    #[test]
    fn unregistered_kind_is_unsupported() {
        let registry = StrategyRegistry::empty();
        let clock = clock();
        let headers = Headers::default();
        let id = room_id();
        let ctx = StrategyContext {
            thing_id: &id,
            thing: None,
            revision: 0,
            clock: &clock,
            headers: &headers,
        };
        let result = registry.apply(&ctx, &Command::DeleteAttributes).unwrap();
        assert_eq!(
            expect_failure(result),
            ThingError::UnsupportedCommand {
                command: "deleteAttributes".into()
            }
        );
    }

    #[test]
    fn event_is_stamped_from_context() {
        let id = room_id();
        let result = run(
            &id,
            None,
            4,
            Command::ModifyFeature {
                feature_id: "thermostat".into(),
                feature: thermostat(),
            },
        )
        .unwrap();
        let (event, response) = expect_mutation(result);
        assert_eq!(event.revision, 5);
        assert_eq!(event.thing_id, id);
        assert_eq!(event.timestamp, clock().0);
        assert_eq!(event.metadata.correlation_id.as_deref(), Some("test-corr"));
        assert_eq!(response.correlation_id.as_deref(), Some("test-corr"));
        assert_eq!(response.status, ResponseStatus::Created);
    }

    #[test]
    fn wrong_command_for_strategy_is_unhandled() {
        let id = room_id();
        let clock = clock();
        let headers = Headers::default();
        let ctx = StrategyContext {
            thing_id: &id,
            thing: None,
            revision: 0,
            clock: &clock,
            headers: &headers,
        };
        let err = DeleteAttributeStrategy
            .apply(&ctx, &Command::DeleteThing)
            .unwrap_err();
        assert_eq!(err.command, "deleteThing");
    }

    #[test]
    fn replacing_a_registration() {
        struct AlwaysUnsupported;
        impl Strategy for AlwaysUnsupported {
            fn apply(
                &self,
                _ctx: &StrategyContext<'_>,
                _command: &Command,
            ) -> Result<StrategyResult, Unhandled> {
                Ok(StrategyResult::Failure(ThingError::UnsupportedCommand {
                    command: "custom".into(),
                }))
            }
        }

        let registry =
            StrategyRegistry::default().register(CommandKind::DeleteAttribute, AlwaysUnsupported);
        let clock = clock();
        let headers = Headers::default();
        let id = room_id();
        let ctx = StrategyContext {
            thing_id: &id,
            thing: None,
            revision: 0,
            clock: &clock,
            headers: &headers,
        };
        let result = registry
            .apply(
                &ctx,
                &Command::DeleteAttribute {
                    pointer: JsonPointer::parse("/x"),
                },
            )
            .unwrap();
        assert!(matches!(
            expect_failure(result),
            ThingError::UnsupportedCommand { .. }
        ));
    }
}
