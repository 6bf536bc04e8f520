//! Wire messages for the multicast group protocol.
//!
//! One datagram carries one line of ASCII text with colon-separated fields:
//!
//! ```text
//! JOIN:<id>:<priority>
//! WELCOME:<id>:<priority>
//! LEAVE:<id>
//! MESSAGE:<id>:<text>
//! MESSAGE_TO:<id>:<target>:<text>
//! ```
//!
//! Content fields are not escaped. A colon inside chat text stays part of the
//! last field because the text kinds split into a bounded number of fields.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub type NodeId = i64;
pub type Priority = i64;

const KIND_JOIN: &str = "JOIN";
const KIND_WELCOME: &str = "WELCOME";
const KIND_LEAVE: &str = "LEAVE";
const KIND_CHAT: &str = "MESSAGE";
const KIND_DIRECT: &str = "MESSAGE_TO";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,
    #[error("expected at least two fields, got {0}")]
    TooFewFields(usize),
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("{kind} is missing field {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("{field} is not an integer: {value:?}")]
    InvalidInteger { field: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Join { sender: NodeId, priority: Priority },
    Welcome { sender: NodeId, priority: Priority },
    Leave { sender: NodeId },
    Chat { sender: NodeId, text: String },
    DirectChat {
        sender: NodeId,
        target: NodeId,
        text: String,
    },
}

impl Message {
    pub fn sender(&self) -> NodeId {
        match self {
            Self::Join { sender, .. }
            | Self::Welcome { sender, .. }
            | Self::Leave { sender }
            | Self::Chat { sender, .. }
            | Self::DirectChat { sender, .. } => *sender,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => KIND_JOIN,
            Self::Welcome { .. } => KIND_WELCOME,
            Self::Leave { .. } => KIND_LEAVE,
            Self::Chat { .. } => KIND_CHAT,
            Self::DirectChat { .. } => KIND_DIRECT,
        }
    }

    /// Wire form of the message, ready to hand to a transport.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Decode a raw datagram. Surrounding whitespace is ignored.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(datagram).map_err(|_| DecodeError::NotUtf8)?;
        text.parse()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join { sender, priority } => write!(f, "{KIND_JOIN}:{sender}:{priority}"),
            Self::Welcome { sender, priority } => {
                write!(f, "{KIND_WELCOME}:{sender}:{priority}")
            }
            Self::Leave { sender } => write!(f, "{KIND_LEAVE}:{sender}"),
            Self::Chat { sender, text } => write!(f, "{KIND_CHAT}:{sender}:{text}"),
            Self::DirectChat {
                sender,
                target,
                text,
            } => write!(f, "{KIND_DIRECT}:{sender}:{target}:{text}"),
        }
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let field_count = line.split(':').count();
        if field_count < 2 {
            return Err(DecodeError::TooFewFields(field_count));
        }

        let (kind, rest) = line.split_once(':').unwrap_or((line, ""));
        match kind {
            KIND_JOIN => {
                let (sender, priority) = parse_announcement(rest, KIND_JOIN)?;
                Ok(Self::Join { sender, priority })
            }
            KIND_WELCOME => {
                let (sender, priority) = parse_announcement(rest, KIND_WELCOME)?;
                Ok(Self::Welcome { sender, priority })
            }
            KIND_LEAVE => {
                let sender = parse_id(rest.split(':').next(), KIND_LEAVE, "sender")?;
                Ok(Self::Leave { sender })
            }
            KIND_CHAT => {
                let mut fields = rest.splitn(2, ':');
                let sender = parse_id(fields.next(), KIND_CHAT, "sender")?;
                let text = fields.next().ok_or(DecodeError::MissingField {
                    kind: KIND_CHAT,
                    field: "text",
                })?;
                Ok(Self::Chat {
                    sender,
                    text: text.to_string(),
                })
            }
            KIND_DIRECT => {
                let mut fields = rest.splitn(3, ':');
                let sender = parse_id(fields.next(), KIND_DIRECT, "sender")?;
                let target = parse_id(fields.next(), KIND_DIRECT, "target")?;
                let text = fields.next().ok_or(DecodeError::MissingField {
                    kind: KIND_DIRECT,
                    field: "text",
                })?;
                Ok(Self::DirectChat {
                    sender,
                    target,
                    text: text.to_string(),
                })
            }
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}

fn parse_announcement(rest: &str, kind: &'static str) -> Result<(NodeId, Priority)> {
    let mut fields = rest.split(':');
    let sender = parse_id(fields.next(), kind, "sender")?;
    let priority = parse_id(fields.next(), kind, "priority")?;
    Ok((sender, priority))
}

fn parse_id(field: Option<&str>, kind: &'static str, name: &'static str) -> Result<i64> {
    let value = field.ok_or(DecodeError::MissingField { kind, field: name })?;
    value.parse().map_err(|_| DecodeError::InvalidInteger {
        field: name,
        value: value.to_string(),
    })
}
