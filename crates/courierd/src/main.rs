//! courierd — chunked UDP messaging daemon.
//!
//!   courierd listen                  print every message that arrives
//!   courierd send <host:port> <file> deliver one file as a message

use std::path::Path;

use anyhow::{Context, Result};

use courier_core::config::{CourierConfig, MessengerSettings};
use courier_messenger::{Messenger, MessengerConfig, MessengerEvent};

const USAGE: &str = "usage: courierd [listen | send <host:port> <file>]";

/// Bytes of each received message shown in the log.
const PREVIEW_LEN: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CourierConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CourierConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CourierConfig::default()
    });

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("listen") => listen(&config.messenger).await,
        Some("send") => {
            let target = args.next().context(USAGE)?;
            let file = args.next().context(USAGE)?;
            send(&config.messenger, &target, Path::new(&file)).await
        }
        Some(other) => anyhow::bail!("unknown command {other:?}\n{USAGE}"),
    }
}

async fn listen(settings: &MessengerSettings) -> Result<()> {
    let (mut messenger, mut events) = Messenger::new(MessengerConfig::from_settings(settings)?);
    messenger
        .listen()
        .await
        .context("failed to bind messenger socket")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    messenger.close().await?;
    Ok(())
}

async fn send(settings: &MessengerSettings, target: &str, path: &Path) -> Result<()> {
    let payload = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let target = tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("failed to resolve {target}"))?
        .next()
        .with_context(|| format!("{target} resolved to no address"))?;

    // The sender needs a socket of its own, not the listening port.
    let settings = MessengerSettings {
        port: 0,
        ..settings.clone()
    };
    let config = MessengerConfig::from_settings(&settings)?;
    let retention = config.retention();

    let (mut messenger, mut events) = Messenger::new(config);
    messenger
        .listen()
        .await
        .context("failed to bind messenger socket")?;
    messenger.send(payload, target)?;

    loop {
        match events.recv().await {
            Some(MessengerEvent::Sent { message_id }) => {
                tracing::info!(message_id = %message_id, %target, "handed to the network");
                break;
            }
            Some(MessengerEvent::Error(e)) => {
                messenger.close().await?;
                return Err(e).context("send failed");
            }
            Some(event) => log_event(&event),
            None => anyhow::bail!("messenger stopped before the message was sent"),
        }
    }

    // Serve retry requests until the receiver has been quiet for a full
    // retention period.
    while let Ok(Some(event)) = tokio::time::timeout(retention, events.recv()).await {
        log_event(&event);
    }

    messenger.close().await?;
    Ok(())
}

fn log_event(event: &MessengerEvent) {
    match event {
        MessengerEvent::Listening { local_addr } => {
            tracing::info!(%local_addr, "listening");
        }
        MessengerEvent::Message(message) => {
            let preview = &message[..message.len().min(PREVIEW_LEN)];
            tracing::info!(
                bytes = message.len(),
                preview = hex::encode(preview),
                "message received"
            );
        }
        MessengerEvent::Sending { message_id } => {
            tracing::debug!(message_id = %message_id, "sending");
        }
        MessengerEvent::Sent { message_id } => {
            tracing::debug!(message_id = %message_id, "sent");
        }
        MessengerEvent::Failure { message_id } => {
            tracing::info!(message_id = %message_id, "incomplete message, retransmission requested");
        }
        MessengerEvent::Dropped { message_id } => {
            tracing::debug!(message_id = %message_id, "retry request for a forgotten message");
        }
        MessengerEvent::Error(e) => {
            tracing::warn!(error = %e, "messenger error");
        }
    }
}
