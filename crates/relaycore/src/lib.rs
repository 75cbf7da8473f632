//! Relay core: in-memory record cache, presence tracking, change detection
//! and live fan-out for a Telegram Mini App backend.
//!
//! No Telegram client and no HTTP server live here; the bot binary wires
//! these pieces to the network.

pub mod broadcast;
pub mod category;
pub mod changes;
pub mod config;
pub mod error;
pub mod events;
pub mod maintenance;
pub mod notifier;
pub mod presence;
pub mod record;
pub mod relay;
pub mod snapshot;
pub mod store;

pub use broadcast::{Audience, Broadcaster, Subscription};
pub use category::{Category, MergeStrategy};
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use events::{EventKind, Frame, RelayEvent};
pub use notifier::{Notifier, NotifyOutcome, WebAppAnswer};
pub use relay::{Relay, WebAppSubmission};
pub use snapshot::{UserId, UserSnapshot};
