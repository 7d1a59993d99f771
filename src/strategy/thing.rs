//! Strategies for whole-thing commands and the policy id.

use serde_json::Value;

use super::{Strategy, StrategyContext, StrategyResult, Unhandled};
use crate::command::Command;
use crate::error::ThingError;
use crate::event::ThingEvent;
use crate::response::{CommandResponse, Resource};

/// Creates a thing that does not exist yet.
///
/// Creating over an existing thing is delegated to [`ThingConflictStrategy`].
#[derive(Debug, Default)]
pub struct CreateThingStrategy {
    conflict: ThingConflictStrategy,
}

impl Strategy for CreateThingStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::CreateThing { thing } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        if ctx.thing.is_some() {
            return self.conflict.apply_checked(ctx, command);
        }
        if &thing.thing_id != ctx.thing_id {
            return Err(Unhandled::new(
                ctx,
                command,
                format!("payload carries thing id '{}'", thing.thing_id),
            ));
        }

        let payload = thing.to_json(None);
        Ok(StrategyResult::mutation(
            ctx,
            ThingEvent::ThingCreated {
                thing: thing.clone(),
            },
            CommandResponse::created(ctx.thing_id.clone(), Resource::Thing, payload),
        ))
    }
}

/// Rejects creation of a thing that already exists.
///
/// Only applicable when the command targets the context's own thing. A
/// mismatched id is a routing bug, not a conflict.
#[derive(Debug, Default)]
pub struct ThingConflictStrategy;

impl Strategy for ThingConflictStrategy {
    fn is_applicable(&self, ctx: &StrategyContext<'_>, command: &Command) -> bool {
        matches!(command, Command::CreateThing { thing } if &thing.thing_id == ctx.thing_id)
    }

    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::CreateThing { .. } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        Ok(StrategyResult::Failure(ThingError::ThingConflict {
            thing_id: ctx.thing_id.clone(),
        }))
    }
}

#[derive(Debug, Default)]
pub struct RetrieveThingStrategy;

impl Strategy for RetrieveThingStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::RetrieveThing { selected_fields } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let result = ctx.existing_thing().map(|thing| {
            let payload = thing.to_json(selected_fields.as_ref());
            StrategyResult::response(
                ctx,
                CommandResponse::retrieved(ctx.thing_id.clone(), Resource::Thing, payload),
            )
        });
        Ok(result.into())
    }
}

#[derive(Debug, Default)]
pub struct DeleteThingStrategy;

impl Strategy for DeleteThingStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::DeleteThing = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let result = ctx.existing_thing().map(|_| {
            StrategyResult::mutation(
                ctx,
                ThingEvent::ThingDeleted,
                CommandResponse::deleted(ctx.thing_id.clone(), Resource::Thing),
            )
        });
        Ok(result.into())
    }
}

#[derive(Debug, Default)]
pub struct ModifyPolicyIdStrategy;

impl Strategy for ModifyPolicyIdStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::ModifyPolicyId { policy_id } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let result = ctx.existing_thing().map(|_| {
            StrategyResult::mutation(
                ctx,
                ThingEvent::PolicyIdModified {
                    policy_id: policy_id.clone(),
                },
                CommandResponse::modified(ctx.thing_id.clone(), Resource::PolicyId),
            )
        });
        Ok(result.into())
    }
}

#[derive(Debug, Default)]
pub struct RetrievePolicyIdStrategy;

impl Strategy for RetrievePolicyIdStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::RetrievePolicyId = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let result = ctx.existing_thing().and_then(|thing| {
            let policy_id = thing
                .policy_id
                .as_ref()
                .ok_or_else(|| ThingError::PolicyIdNotFound {
                    thing_id: ctx.thing_id.clone(),
                })?;
            Ok(StrategyResult::response(
                ctx,
                CommandResponse::retrieved(
                    ctx.thing_id.clone(),
                    Resource::PolicyId,
                    Value::String(policy_id.clone()),
                ),
            ))
        });
        Ok(result.into())
    }
}
