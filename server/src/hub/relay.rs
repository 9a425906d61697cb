//! Bus-to-hub relay.
//!
//! One subscriber per process forwards every bus message to the local hub,
//! which delivers it to whichever connections subscribed to that channel.

use std::time::Duration;

use fred::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::registry::SubscriptionHub;
use crate::events::{bus_pattern, parse_bus_channel, LocalTransport};

/// Pause before building a new subscriber after the last one ended.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Relay Redis pub/sub bus messages into the local hub.
pub fn spawn_redis_relay(
    redis: Client,
    prefix: String,
    hub: SubscriptionHub,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(pattern = %bus_pattern(&prefix), "Event relay started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                result = relay_once(&redis, &prefix, &hub) => match result {
                    Ok(()) => warn!("Event relay subscriber ended, resubscribing"),
                    Err(e) => error!(error = %e, "Event relay subscriber failed"),
                }
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
        info!("Event relay stopped");
    })
}

/// Subscribe once and forward until the subscriber connection ends.
///
/// The client reconnects on its own; the pattern subscription does not
/// survive that, so it is renewed on every reconnect.
async fn relay_once(redis: &Client, prefix: &str, hub: &SubscriptionHub) -> Result<(), Error> {
    let subscriber = redis.clone_new();
    subscriber.connect();
    subscriber.wait_for_connect().await?;

    let mut messages = subscriber.message_rx();
    let mut reconnects = subscriber.reconnect_rx();
    let mut errors = subscriber.error_rx();
    let pattern = bus_pattern(prefix);
    subscriber.psubscribe(pattern.clone()).await?;

    let result = loop {
        tokio::select! {
            received = messages.recv() => match received {
                Ok(message) => {
                    let Some(channel) = parse_bus_channel(prefix, &message.channel) else {
                        continue;
                    };
                    if let Some(payload) = message.value.as_str() {
                        hub.deliver(&channel, &payload);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event relay lagged, messages dropped");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
            reconnected = reconnects.recv() => match reconnected {
                Ok(server) => {
                    info!(server = %server, "Event relay reconnected, renewing subscription");
                    if let Err(e) = subscriber.psubscribe(pattern.clone()).await {
                        break Err(e);
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break Ok(()),
            },
            failure = errors.recv() => match failure {
                Ok(details) => warn!(error = ?details, "Event relay subscriber connection error"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    let _ = subscriber.quit().await;
    result
}

/// Relay the in-process bus into the hub.
pub fn spawn_local_relay(
    transport: &LocalTransport,
    hub: SubscriptionHub,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut messages = transport.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                received = messages.recv() => match received {
                    Ok(message) => {
                        hub.deliver(&message.channel, &message.payload);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Local relay lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
