//! Chat transport for relaybot.
//!
//! Adapters are pure I/O: they turn platform updates into `InboundMessage`s
//! and deliver `OutboundMessage`s. Routing decisions live in `rb-app`.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{InboundMessage, InboundMessageKind, MessageId, OutboundMessage, SenderId, ThreadId};
