//! `GET /messages`: Server-Sent Events relay of inbound text messages.
//!
//! Wire format per stream:
//!
//! ```text
//! data: {"type":"connected"}
//!
//! data: {"type":"text","from":"!0000beef",...}
//!
//! : heartbeat
//! ```
//!
//! A heartbeat comment is written after each interval without a message. The
//! stream ends when the client goes away (axum drops it), when the process
//! shuts down, or when a message cannot be serialized.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures_util::stream::{self, Stream};
use log::{debug, error, info};
use tokio::sync::watch;

use super::{require_connection, shutdown_requested, ApiError, BridgeContext};
use crate::relay::{ClassifiedMessage, RelayQueue};

const CONNECTED_EVENT: &str = r#"{"type":"connected"}"#;

pub async fn messages(
    State(ctx): State<BridgeContext>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    require_connection(&ctx).await?;
    info!("Message stream opened");
    Ok(Sse::new(message_events(
        Arc::clone(&ctx.relay),
        ctx.heartbeat,
        ctx.shutdown.clone(),
    )))
}

struct StreamState {
    relay: Arc<RelayQueue>,
    heartbeat: Duration,
    shutdown: watch::Receiver<bool>,
    greeted: bool,
}

enum Next {
    Message(ClassifiedMessage),
    Heartbeat,
    Shutdown,
}

/// Event sequence for one stream client.
pub fn message_events(
    relay: Arc<RelayQueue>,
    heartbeat: Duration,
    shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = StreamState {
        relay,
        heartbeat,
        shutdown,
        greeted: false,
    };
    stream::unfold(state, |mut st| async move {
        if !st.greeted {
            st.greeted = true;
            return Some((Ok(Event::default().data(CONNECTED_EVENT)), st));
        }

        let next = tokio::select! {
            _ = shutdown_requested(&mut st.shutdown) => Next::Shutdown,
            popped = st.relay.pop(st.heartbeat) => match popped {
                Some(msg) => Next::Message(msg),
                None => Next::Heartbeat,
            },
        };

        match next {
            Next::Message(msg) => match Event::default().json_data(&msg) {
                Ok(event) => Some((Ok(event), st)),
                Err(e) => {
                    error!("Error in message stream, closing: {}", e);
                    None
                }
            },
            Next::Heartbeat => {
                debug!("message stream heartbeat");
                Some((Ok(Event::default().comment("heartbeat")), st))
            }
            Next::Shutdown => {
                info!("Message stream closed for shutdown");
                None
            }
        }
    })
}
