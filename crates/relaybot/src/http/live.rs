//! Long-lived delivery transports: Server-Sent Events and WebSocket.
//!
//! Both wrap a [`Subscription`]; dropping it when the connection ends
//! deregisters the channel before the handler returns.

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures_util::{SinkExt, Stream, StreamExt};
use relaycore::{Audience, Relay, Subscription, UserId};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::ApiError;
use super::handlers::UserQuery;
use super::AppState;

fn audience(query: Result<Query<UserQuery>, QueryRejection>) -> Result<Audience, ApiError> {
    let Query(query) = query?;
    Ok(query.user()?.map_or(Audience::Global, Audience::User))
}

/// GET /events[?user_id=]
pub async fn sse(
    State(state): State<Arc<AppState>>,
    query: Result<Query<UserQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let audience = audience(query)?;
    let subscription = state.relay.subscribe(audience);

    let stream = subscription
        .map(|frame| Ok::<_, Infallible>(Event::default().event(frame.event).data(&*frame.data)))
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /ws[?user_id=]
pub async fn ws(
    State(state): State<Arc<AppState>>,
    query: Result<Query<UserQuery>, QueryRejection>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let audience = audience(query)?;
    let relay = Arc::clone(&state.relay);
    let shutdown = state.shutdown.clone();

    Ok(upgrade.on_upgrade(move |socket| async move {
        let subscription = relay.subscribe(audience);
        run_socket(socket, subscription, relay, shutdown).await;
    }))
}

/// Pumps frames to the socket until either side closes.
///
/// Any text frame from a user-bound client counts as a heartbeat.
async fn run_socket(socket: WebSocket, mut subscription: Subscription, relay: Arc<Relay>, shutdown: CancellationToken) {
    let (mut sender, mut receiver) = socket.split();
    let user: Option<UserId> = match subscription.audience() {
        Audience::User(user) => Some(user),
        Audience::Global => None,
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            frame = subscription.recv() => {
                // None: the channel was closed server-side (user evicted).
                let Some(frame) = frame else {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                if sender.send(Message::Text(frame.data.to_string().into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(_))) => {
                    if let Some(user) = user {
                        relay.heartbeat(user);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(audience = %subscription.audience(), channel = subscription.id(), "websocket closed");
}
