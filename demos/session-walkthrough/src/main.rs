//! Walk through a session's lifecycle against the in-memory broker.
//!
//! Run with: cargo run -p session-walkthrough-demo
//!
//! Set `RUST_LOG=debug` to see lock grants, renewals and settlements.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use sessionbus_core::{
    ClientSettings, DeadLetterOptions, Message, Properties, ReceiveMode, StaticTokenProvider,
};
use sessionbus_session::{EntityDescription, InMemoryBroker, SessionAcceptor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const QUEUE: &str = "orders";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let broker = InMemoryBroker::new();
    broker.create_entity(EntityDescription::queue(QUEUE))?;

    for (i, body) in ["create", "pay", "bogus", "ship"].iter().enumerate() {
        broker.send(
            QUEUE,
            Message::new(body.as_bytes())
                .with_session_id("order-17")
                .with_label(*body)
                .with_property("step", i),
        )?;
    }
    let reminder = broker.schedule_message(
        QUEUE,
        Message::new(b"remind".to_vec()).with_session_id("order-17"),
        broker.now() + chrono::Duration::hours(1),
    )?;

    let settings = ClientSettings::new(Arc::new(StaticTokenProvider::new("demo-token")))
        .with_operation_timeout(Duration::from_secs(5));
    let acceptor = SessionAcceptor::new(Arc::new(broker.clone()), settings);

    let session = acceptor
        .accept_session(QUEUE, None, ReceiveMode::PeekLock)
        .await
        .context("no session to accept")?;
    tracing::info!(session_id = session.session_id(), "accepted");

    let _renewal = session.auto_renew(Duration::from_secs(300));

    let checkpoint = session.get_state().await?;
    tracing::info!(?checkpoint, "restored session state");

    while let Some(message) = session.receive_with_wait(Duration::from_millis(500)).await? {
        let lock_token = message
            .lock_token
            .context("peek-lock delivery without a lock token")?;
        match message.label.as_deref() {
            Some("bogus") => {
                session
                    .dead_letter(lock_token, DeadLetterOptions::new("UnknownStep", "no handler"))
                    .await?;
            }
            Some("ship") if message.delivery_count == 1 => {
                // Not ready yet; park it and pick it up once the rest is done.
                session.defer(lock_token, Properties::new()).await?;
                let deferred = session.receive_deferred(message.sequence_number).await?;
                session
                    .complete_by_sequence_number(deferred.sequence_number)
                    .await?;
            }
            _ => session.complete(lock_token).await?,
        }
        session
            .set_state(Some(format!("done:{}", message.sequence_number).as_bytes()))
            .await?;
        tracing::info!(
            sequence_number = message.sequence_number,
            label = ?message.label,
            "processed"
        );
    }

    broker.cancel_scheduled_message(QUEUE, reminder)?;
    session.close().await;

    let dead = broker.dead_letter_messages(QUEUE)?;
    tracing::info!(
        dead_lettered = dead.len(),
        remaining = broker.active_message_count(QUEUE)?,
        "walkthrough finished"
    );
    Ok(())
}
