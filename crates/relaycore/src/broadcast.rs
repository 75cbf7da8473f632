//! Live fan-out to delivery channels with a per-user store-and-forward queue.
//!
//! The channel registry and the pending queues share one lock so that the
//! "no live channel, enqueue instead" decision cannot race a concurrent
//! subscribe. Sends are non-blocking (`UnboundedSender`), so the lock is
//! never held across an await point.

use futures_util::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::events::{Frame, RelayEvent};
use crate::snapshot::UserId;

/// Who a channel listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    User(UserId),
    Global,
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Audience::User(user) => write!(f, "{}", user),
            Audience::Global => f.write_str("global"),
        }
    }
}

pub type ChannelId = u64;

struct Channel {
    id: ChannelId,
    tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct Registry {
    next_channel: ChannelId,
    channels: HashMap<Audience, Vec<Channel>>,
    queues: HashMap<UserId, VecDeque<RelayEvent>>,
}

impl Registry {
    /// Sends `frame` to every channel of `audience`, dropping dead ones.
    /// Returns `(delivered, dropped, had_channels)`.
    fn deliver(&mut self, audience: Audience, frame: &Frame) -> (usize, usize, bool) {
        let Some(channels) = self.channels.get_mut(&audience) else {
            return (0, 0, false);
        };
        let before = channels.len();
        channels.retain(|channel| channel.tx.send(frame.clone()).is_ok());
        let delivered = channels.len();
        if channels.is_empty() {
            self.channels.remove(&audience);
        }
        (delivered, before - delivered, before > 0)
    }
}

/// Outcome of a single publish, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Live channels that accepted the event
    pub delivered: usize,
    /// Channels found dead during this publish and removed
    pub dropped: usize,
    /// Event went to the user's pending queue
    pub queued: bool,
}

pub struct Broadcaster {
    registry: Mutex<Registry>,
    queue_cap: usize,
}

impl Broadcaster {
    pub fn new(queue_cap: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            queue_cap: queue_cap.max(1),
        }
    }

    /// Opens a channel for `audience`; `greeting` is its first frame.
    ///
    /// The channel is deregistered when the returned [`Subscription`] drops.
    pub fn subscribe(self: &Arc<Self>, audience: Audience, greeting: &RelayEvent) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        match greeting.to_frame() {
            Ok(frame) => {
                // The receiver is alive right here, so this cannot fail.
                let _ = tx.send(frame);
            }
            Err(e) => error!(%audience, "failed to serialize greeting: {}", e),
        }

        let mut registry = self.registry.lock();
        let id = registry.next_channel;
        registry.next_channel += 1;
        registry.channels.entry(audience).or_default().push(Channel { id, tx });
        drop(registry);

        info!(%audience, channel = id, "live channel opened");
        Subscription {
            id,
            audience,
            rx,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Removes a channel from the registry. Returns whether it was present.
    pub fn unsubscribe(&self, id: ChannelId) -> bool {
        let mut registry = self.registry.lock();
        let mut emptied = None;
        let mut found = false;
        for (audience, channels) in registry.channels.iter_mut() {
            if let Some(pos) = channels.iter().position(|c| c.id == id) {
                channels.remove(pos);
                found = true;
                if channels.is_empty() {
                    emptied = Some(*audience);
                }
                break;
            }
        }
        if let Some(audience) = emptied {
            registry.channels.remove(&audience);
        }
        found
    }

    /// Delivers `event` to every live channel of `user`, plus every global
    /// channel when the event class is global.
    ///
    /// A failing channel is removed and delivery continues to its siblings.
    /// With no live user channel at all the event is queued for polling;
    /// channels that die during this publish do not cause a retroactive
    /// enqueue.
    pub fn publish(&self, user: UserId, event: RelayEvent) -> PublishReport {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(%user, "failed to serialize event: {}", e);
                return PublishReport::default();
            }
        };

        let mut registry = self.registry.lock();
        let (delivered, dropped, had_channels) = registry.deliver(Audience::User(user), &frame);
        let mut report = PublishReport {
            delivered,
            dropped,
            queued: false,
        };

        if event.kind.is_global() {
            let (g_delivered, g_dropped, _) = registry.deliver(Audience::Global, &frame);
            report.delivered += g_delivered;
            report.dropped += g_dropped;
        }

        if !had_channels {
            let queue = registry.queues.entry(user).or_default();
            if queue.len() >= self.queue_cap {
                queue.pop_front();
                warn!(%user, cap = self.queue_cap, "pending queue full, oldest event dropped");
            }
            queue.push_back(event);
            report.queued = true;
        }
        drop(registry);

        if report.dropped > 0 {
            debug!(%user, dropped = report.dropped, "removed dead channels during publish");
        }
        report
    }

    /// Delivers a global-class event to every global channel. Nothing is queued.
    pub fn publish_global(&self, event: &RelayEvent) -> PublishReport {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to serialize global event: {}", e);
                return PublishReport::default();
            }
        };
        let (delivered, dropped, _) = self.registry.lock().deliver(Audience::Global, &frame);
        PublishReport {
            delivered,
            dropped,
            queued: false,
        }
    }

    /// Atomically takes and clears the user's pending queue.
    pub fn drain_queue(&self, user: UserId) -> Vec<RelayEvent> {
        self.registry
            .lock()
            .queues
            .remove(&user)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Closes every channel bound to `user` and forgets their pending queue.
    /// Returns the number of channels closed.
    pub fn disconnect_user(&self, user: UserId) -> usize {
        let mut registry = self.registry.lock();
        registry.queues.remove(&user);
        registry
            .channels
            .remove(&Audience::User(user))
            .map_or(0, |channels| channels.len())
    }

    pub fn channel_count(&self) -> usize {
        self.registry.lock().channels.values().map(Vec::len).sum()
    }

    pub fn channel_count_for(&self, audience: Audience) -> usize {
        self.registry.lock().channels.get(&audience).map_or(0, Vec::len)
    }

    pub fn pending_count(&self, user: UserId) -> usize {
        self.registry.lock().queues.get(&user).map_or(0, VecDeque::len)
    }
}

/// Receiving end of a live channel.
///
/// Yields frames until the channel is closed by the server (user evicted) or
/// the subscription is dropped by the connection handler.
pub struct Subscription {
    id: ChannelId,
    audience: Audience,
    rx: mpsc::UnboundedReceiver<Frame>,
    broadcaster: Weak<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn audience(&self) -> Audience {
        self.audience
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for tests and draining.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            if broadcaster.unsubscribe(self.id) {
                debug!(audience = %self.audience, channel = self.id, "live channel closed");
            }
        }
    }
}
