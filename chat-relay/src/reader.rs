//! Per-connection read loop.
//!
//! Turns transport frames into [`Event`]s for the server. The loop ends on
//! the first read failure or end of stream and reports it with exactly one
//! [`Event::DeadConnection`].

use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    connection::{ConnectionId, FrameReader},
    event::{Event, RATE_LIMIT_NOTICE},
    rate_limit::{ClientRateLimiter, Verdict},
};

pub async fn watch_connection(
    id: ConnectionId,
    mut frames: FrameReader,
    mut limiter: ClientRateLimiter,
    events: mpsc::Sender<Event>,
) {
    loop {
        let text = match frames.read().await {
            Ok(Some(text)) => text,
            Ok(None) => {
                debug!(connection = %id, "peer ended the stream");
                break;
            }
            Err(err) => {
                debug!(connection = %id, error = %err, "read failed");
                break;
            }
        };

        if text.trim().is_empty() {
            continue;
        }

        let event = match limiter.check() {
            Verdict::Allowed => Event::Broadcast { id, text },
            Verdict::Notify => Event::DirectMessage {
                id,
                text: RATE_LIMIT_NOTICE.to_string(),
            },
            Verdict::Suppressed => continue,
        };

        if events.send(event).await.is_err() {
            // Server is gone; nobody is left to hear about the disconnect.
            return;
        }
    }

    let _ = events.send(Event::DeadConnection { id }).await;
}
