//! A room twin with one simulated device on the live channel.
//!
//! Run with `RUST_LOG=debug cargo run --example live_twin` to see the
//! worker, supervisor and live dispatch logs.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use twinfold::{
    Channel, Command, CommandEnvelope, CommandResponse, Feature, FieldSelector, Headers,
    InMemoryPubSub, Resource, Signal, StreamingType, Thing, ThingId, ThingStoreBuilder,
    init_tracing,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let fabric = InMemoryPubSub::default();
    let store = ThingStoreBuilder::new()
        .base_dir(dir.path())
        .pubsub(fabric.clone())
        .build();

    // The device answers live commands with its current reading.
    let (responses_tx, responses_rx) = mpsc::channel(16);
    let listener = store.spawn_response_listener(ReceiverStream::new(responses_rx));
    let mut commands = fabric.receiver(StreamingType::LiveCommands);
    let device = tokio::spawn(async move {
        while let Ok(published) = commands.recv().await {
            let Signal::Command(envelope) = &published.signal else {
                continue;
            };
            let reading = CommandResponse::retrieved(
                envelope.thing_id.clone(),
                Resource::Thing,
                json!({"thingId": envelope.thing_id.as_str(), "temperature": 20.7}),
            )
            .with_correlation_id(envelope.headers.correlation_id.clone());
            if responses_tx.send(reading).await.is_err() {
                break;
            }
        }
    });

    let room = ThingId::parse("org.example:room-1")?;
    let thermostat =
        Feature::with_properties(json!({"target": 21.5}).as_object().cloned().unwrap_or_default());

    let created = store
        .execute(CommandEnvelope::new(
            room.clone(),
            Command::CreateThing {
                thing: Thing::new(room.clone()).with_feature("thermostat", thermostat),
            },
        ))
        .await?;
    println!("persisted: {:?} {:?}", created.status, created.resource);

    let retrieved = store
        .execute(CommandEnvelope::new(
            room.clone(),
            Command::RetrieveThing {
                selected_fields: Some(FieldSelector::parse("thingId,features/thermostat")),
            },
        ))
        .await?;
    println!("twin state: {}", retrieved.payload.unwrap_or_default());

    let live = store
        .execute(
            CommandEnvelope::new(
                room.clone(),
                Command::RetrieveThing {
                    selected_fields: None,
                },
            )
            .with_headers(
                Headers::default()
                    .with_channel(Channel::Live)
                    .with_timeout(Duration::from_secs(5)),
            ),
        )
        .await?;
    println!("device says: {}", live.payload.unwrap_or_default());

    store.passivate(&room).await;
    listener.shutdown().await?;
    device.abort();
    Ok(())
}
