//! Strategies for features and their properties.

use serde_json::Value;

use super::{Strategy, StrategyContext, StrategyResult, Unhandled};
use crate::command::Command;
use crate::error::ThingError;
use crate::event::ThingEvent;
use crate::response::{CommandResponse, Resource};
use crate::thing::Feature;

fn feature_not_found(ctx: &StrategyContext<'_>, feature_id: &str) -> ThingError {
    ThingError::FeatureNotFound {
        thing_id: ctx.thing_id.clone(),
        feature_id: feature_id.to_owned(),
    }
}

fn existing_feature<'a>(
    ctx: &StrategyContext<'a>,
    feature_id: &str,
) -> Result<&'a Feature, ThingError> {
    ctx.thing
        .and_then(|t| t.feature(feature_id))
        .ok_or_else(|| feature_not_found(ctx, feature_id))
}

fn feature_json(feature: &Feature) -> Value {
    serde_json::to_value(feature).unwrap_or(Value::Null)
}

/// Creates or replaces a whole feature.
#[derive(Debug, Default)]
pub struct ModifyFeatureStrategy;

impl Strategy for ModifyFeatureStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::ModifyFeature {
            feature_id,
            feature,
        } = command
        else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let resource = Resource::Feature(feature_id.clone());
        let exists = ctx.thing.and_then(|t| t.feature(feature_id)).is_some();
        let result = if exists {
            StrategyResult::mutation(
                ctx,
                ThingEvent::FeatureModified {
                    feature_id: feature_id.clone(),
                    feature: feature.clone(),
                },
                CommandResponse::modified(ctx.thing_id.clone(), resource),
            )
        } else {
            StrategyResult::mutation(
                ctx,
                ThingEvent::FeatureCreated {
                    feature_id: feature_id.clone(),
                    feature: feature.clone(),
                },
                CommandResponse::created(ctx.thing_id.clone(), resource, feature_json(feature)),
            )
        };
        Ok(result)
    }
}

#[derive(Debug, Default)]
pub struct RetrieveFeatureStrategy;

impl Strategy for RetrieveFeatureStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::RetrieveFeature { feature_id } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let result = existing_feature(ctx, feature_id).map(|feature| {
            StrategyResult::response(
                ctx,
                CommandResponse::retrieved(
                    ctx.thing_id.clone(),
                    Resource::Feature(feature_id.clone()),
                    feature_json(feature),
                ),
            )
        });
        Ok(result.into())
    }
}

#[derive(Debug, Default)]
pub struct DeleteFeatureStrategy;

impl Strategy for DeleteFeatureStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::DeleteFeature { feature_id } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let result = existing_feature(ctx, feature_id).map(|_| {
            StrategyResult::mutation(
                ctx,
                ThingEvent::FeatureDeleted {
                    feature_id: feature_id.clone(),
                },
                CommandResponse::deleted(
                    ctx.thing_id.clone(),
                    Resource::Feature(feature_id.clone()),
                ),
            )
        });
        Ok(result.into())
    }
}

/// Creates or replaces the properties of an existing feature.
#[derive(Debug, Default)]
pub struct ModifyFeaturePropertiesStrategy;

impl Strategy for ModifyFeaturePropertiesStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::ModifyFeatureProperties {
            feature_id,
            properties,
        } = command
        else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let result = existing_feature(ctx, feature_id).map(|feature| {
            let resource = Resource::FeatureProperties(feature_id.clone());
            if feature.properties.is_some() {
                StrategyResult::mutation(
                    ctx,
                    ThingEvent::FeaturePropertiesModified {
                        feature_id: feature_id.clone(),
                        properties: properties.clone(),
                    },
                    CommandResponse::modified(ctx.thing_id.clone(), resource),
                )
            } else {
                StrategyResult::mutation(
                    ctx,
                    ThingEvent::FeaturePropertiesCreated {
                        feature_id: feature_id.clone(),
                        properties: properties.clone(),
                    },
                    CommandResponse::created(
                        ctx.thing_id.clone(),
                        resource,
                        Value::Object(properties.clone()),
                    ),
                )
            }
        });
        Ok(result.into())
    }
}

#[derive(Debug, Default)]
pub struct DeleteFeaturePropertiesStrategy;

impl Strategy for DeleteFeaturePropertiesStrategy {
    fn apply(
        &self,
        ctx: &StrategyContext<'_>,
        command: &Command,
    ) -> Result<StrategyResult, Unhandled> {
        let Command::DeleteFeatureProperties { feature_id } = command else {
            return Err(Unhandled::wrong_command(ctx, command));
        };
        let result = existing_feature(ctx, feature_id).and_then(|feature| {
            if feature.properties.is_none() {
                return Err(ThingError::FeaturePropertiesNotFound {
                    thing_id: ctx.thing_id.clone(),
                    feature_id: feature_id.clone(),
                });
            }
            Ok(StrategyResult::mutation(
                ctx,
                ThingEvent::FeaturePropertiesDeleted {
                    feature_id: feature_id.clone(),
                },
                CommandResponse::deleted(
                    ctx.thing_id.clone(),
                    Resource::FeatureProperties(feature_id.clone()),
                ),
            ))
        });
        Ok(result.into())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::super::test_support::{expect_failure, expect_mutation, run};
    use super::*;
    use crate::response::ResponseStatus;
    use crate::thing::test_fixtures::{room, room_id, thermostat};
    use crate::thing::{Thing, apply_event};

    fn modify_thermostat() -> Command {
        Command::ModifyFeature {
            feature_id: "thermostat".into(),
            feature: thermostat(),
        }
    }

    #[test]
    fn modify_feature_creates_then_modifies() {
        let id = room_id();
        let (created_event, created) =
            expect_mutation(run(&id, None, 0, modify_thermostat()).unwrap());
        assert_eq!(created_event.event_type(), "FeatureCreated");
        assert_eq!(created.status, ResponseStatus::Created);
        assert_eq!(created.payload, Some(json!({"properties": {"target": 21.5}})));

        let state = apply_event(None, &id, &created_event.event);
        let (modified_event, modified) =
            expect_mutation(run(&id, state.as_ref(), 1, modify_thermostat()).unwrap());
        assert_eq!(modified_event.event_type(), "FeatureModified");
        assert_eq!(modified.status, ResponseStatus::Modified);
        assert_eq!(modified.payload, None);
    }

    #[test]
    fn absent_feature_is_not_found_for_every_feature_command() {
        let id = room_id();
        let existing = room();
        let commands = [
            Command::RetrieveFeature {
                feature_id: "lamp".into(),
            },
            Command::DeleteFeature {
                feature_id: "lamp".into(),
            },
            Command::ModifyFeatureProperties {
                feature_id: "lamp".into(),
                properties: Map::new(),
            },
            Command::DeleteFeatureProperties {
                feature_id: "lamp".into(),
            },
        ];
        for state in [None, Some(&existing)] {
            for command in commands.clone() {
                let result = run(&id, state, 1, command).unwrap();
                assert_eq!(
                    expect_failure(result),
                    ThingError::FeatureNotFound {
                        thing_id: id.clone(),
                        feature_id: "lamp".into(),
                    }
                );
            }
        }
    }

    #[test]
    fn feature_properties_create_or_modify() {
        let id = room_id();
        let props = json!({"on": true}).as_object().cloned().unwrap();
        let command = Command::ModifyFeatureProperties {
            feature_id: "lamp".into(),
            properties: props.clone(),
        };

        let bare = Thing::new(id.clone()).with_feature("lamp", Feature::default());
        let (event, response) = expect_mutation(run(&id, Some(&bare), 1, command.clone()).unwrap());
        assert_eq!(event.event_type(), "FeaturePropertiesCreated");
        assert_eq!(response.payload, Some(json!({"on": true})));

        let with_props = bare.apply(&event.event);
        let (event, response) =
            expect_mutation(run(&id, Some(&with_props), 2, command).unwrap());
        assert_eq!(event.event_type(), "FeaturePropertiesModified");
        assert_eq!(response.status, ResponseStatus::Modified);
    }

    #[test]
    fn delete_feature_properties_requires_properties() {
        let id = room_id();
        let bare = Thing::new(id.clone()).with_feature("lamp", Feature::default());
        let result = run(
            &id,
            Some(&bare),
            1,
            Command::DeleteFeatureProperties {
                feature_id: "lamp".into(),
            },
        )
        .unwrap();
        assert!(matches!(
            expect_failure(result),
            ThingError::FeaturePropertiesNotFound { .. }
        ));

        let with_thermostat = Thing::new(id.clone()).with_feature("thermostat", thermostat());
        let (event, response) = expect_mutation(
            run(
                &id,
                Some(&with_thermostat),
                1,
                Command::DeleteFeatureProperties {
                    feature_id: "thermostat".into(),
                },
            )
            .unwrap(),
        );
        assert_eq!(event.event_type(), "FeaturePropertiesDeleted");
        assert_eq!(response.status, ResponseStatus::Deleted);
    }

    #[test]
    fn retrieve_and_delete_existing_feature() {
        let id = room_id();
        let thing = Thing::new(id.clone()).with_feature("thermostat", thermostat());
        let retrieved = run(
            &id,
            Some(&thing),
            1,
            Command::RetrieveFeature {
                feature_id: "thermostat".into(),
            },
        )
        .unwrap();
        assert!(matches!(
            retrieved,
            StrategyResult::Response(ref r) if r.payload == Some(json!({"properties": {"target": 21.5}}))
        ));

        let (event, _) = expect_mutation(
            run(
                &id,
                Some(&thing),
                1,
                Command::DeleteFeature {
                    feature_id: "thermostat".into(),
                },
            )
            .unwrap(),
        );
        assert_eq!(event.event_type(), "FeatureDeleted");
    }
}
