//! Strategies for thing attributes.

use super::{Strategy, StrategyContext, StrategyResult, Unhandled};
use crate::command::Command;
use crate::error::ThingError;
use crate::event::ThingEvent;
use crate::pointer::JsonPointer;
use crate::response::{CommandResponse, Resource};
use crate::thing::Thing;

fn attribute_not_found(ctx: &StrategyContext<'_>, pointer: &JsonPointer) -> ThingError {
    ThingError::AttributeNotFound {
        thing_id: ctx.thing_id.clone(),
        pointer: pointer.clone(),
    }
}

fn attribute_exists(thing: Option<&Thing>, pointer: &JsonPointer) -> bool {
    thing
        .and_then(|t| t.attributes.as_ref())
        .is_some_and(|attributes| pointer.exists_in(attributes))
}

#[derive(Debug, Default)]
pub struct ModifyAttributeStrategy;

impl Strategy for ModifyAttributeStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::ModifyAttribute { pointer, value } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let resource = Resource::Attribute(pointer.clone());
        let result = if attribute_exists(ctx.thing, pointer) {
            StrategyResult::mutation(
                ctx,
                ThingEvent::AttributeModified {
                    pointer: pointer.clone(),
                    value: value.clone(),
                },
                CommandResponse::modified(ctx.thing_id.clone(), resource),
            )
        } else {
            StrategyResult::mutation(
                ctx,
                ThingEvent::AttributeCreated {
                    pointer: pointer.clone(),
                    value: value.clone(),
                },
                CommandResponse::created(ctx.thing_id.clone(), resource, value.clone()),
            )
        };
        Ok(result)
    }
}

#[derive(Debug, Default)]
pub struct RetrieveAttributeStrategy;

impl Strategy for RetrieveAttributeStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::RetrieveAttribute { pointer } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let value = ctx
            .thing
            .and_then(|t| t.attributes.as_ref())
            .and_then(|attributes| pointer.get(attributes));
        let result = match value {
            Some(value) => StrategyResult::response(
                ctx,
                CommandResponse::retrieved(
                    ctx.thing_id.clone(),
                    Resource::Attribute(pointer.clone()),
                    value.clone(),
                ),
            ),
            None => StrategyResult::Failure(attribute_not_found(ctx, pointer)),
        };
        Ok(result)
    }
}

#[derive(Debug, Default)]
pub struct DeleteAttributeStrategy;

impl Strategy for DeleteAttributeStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::DeleteAttribute { pointer } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        if !attribute_exists(ctx.thing, pointer) {
            return Ok(StrategyResult::Failure(attribute_not_found(ctx, pointer)));
        }
        Ok(StrategyResult::mutation(
            ctx,
            ThingEvent::AttributeDeleted {
                pointer: pointer.clone(),
            },
            CommandResponse::deleted(ctx.thing_id.clone(), Resource::Attribute(pointer.clone())),
        ))
    }
}

#[derive(Debug, Default)]
pub struct DeleteAttributesStrategy;

impl Strategy for DeleteAttributesStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::DeleteAttributes = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        if ctx.thing.and_then(|t| t.attributes.as_ref()).is_none() {
            return Ok(StrategyResult::Failure(ThingError::AttributesNotFound {
                thing_id: ctx.thing_id.clone(),
            }));
        }
        Ok(StrategyResult::mutation(
            ctx,
            ThingEvent::AttributesDeleted,
            CommandResponse::deleted(ctx.thing_id.clone(), Resource::Attributes),
        ))
    }
}
