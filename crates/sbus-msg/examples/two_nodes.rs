//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use sbus_msg::handlers::EchoHandler;
use sbus_msg::{Action, BusClient, Content, Envelope, HandlerRegistry, MemoryHub, MemoryLogSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Both nodes share one in-process hub and address each other by name.
    let hub = MemoryHub::new();
    let server_log = MemoryLogSink::new();
    let mut registry = HandlerRegistry::new();
    registry.register(Action::SendMessage, Arc::new(EchoHandler));
    let server = BusClient::builder(
        Arc::new(hub.endpoint("topico/servidor", "topico/barramento")),
        Arc::new(registry),
    )
    .node_name("topico/servidor")
    .log_sink(server_log.clone())
    .build();
    let bus = BusClient::builder(
        Arc::new(hub.endpoint("topico/barramento", "topico/servidor")),
        Arc::new(HandlerRegistry::new()),
    )
    .node_name("topico/barramento")
    .build();

    server.start().await?;
    bus.start().await?;

    let envelope = Envelope::new(
        "ENVIAR_MENSAGEM",
        "topico/barramento",
        "topico/servidor",
        Content::new().with("texto", "hello from the bus"),
    )?;
    bus.on_user_send(envelope).await?.outcome().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    for line in server_log.lines() {
        println!("{line}");
    }
    println!("bus stats: {:?}", bus.stats());

    bus.on_shutdown().await?;
    server.on_shutdown().await?;
    Ok(())
}
