use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(SenderId);
id_newtype!(ThreadId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundMessageKind {
    /// A user text message; the only kind that is routed.
    Message,
    /// Someone joined, left, or changed role in a chat.
    Membership,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub kind: InboundMessageKind,
    pub message_id: MessageId,
    pub sender_id: SenderId,
    /// Chat the reply goes back to.
    pub thread_id: ThreadId,
    /// Raw text as the user sent it.
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub content: String,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}
