use std::fmt;

use serde::{Deserialize, Serialize};

/// A member's position in a communicator, `0..world_size`.
pub type Rank = usize;

/// First wire value reserved for internal traffic. User tags live below it.
pub const RESERVED_TAG_BASE: u32 = 0x8000_0000;

/// Message tag; selects the delivery queue on the receiving side.
///
/// User point-to-point traffic carries `User(n)`; every collective and
/// lifecycle operation has its own internal tag so that it never consumes
/// user messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    User(u32),
    Handshake,
    Barrier,
    Broadcast,
    Scatter,
    ScatterV,
    Gather,
    GatherV,
    Allgather,
    // Lifecycle
    Revoke,
    Ack,
    ShrinkBeacon,
    Split,
    Derive,
}

impl Tag {
    /// Build a user tag, rejecting values in the reserved range.
    pub fn user(tag: u32) -> Option<Tag> {
        (tag < RESERVED_TAG_BASE).then_some(Tag::User(tag))
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Tag::User(n) => n,
            Tag::Handshake => RESERVED_TAG_BASE,
            Tag::Barrier => RESERVED_TAG_BASE + 1,
            Tag::Broadcast => RESERVED_TAG_BASE + 2,
            Tag::Scatter => RESERVED_TAG_BASE + 3,
            Tag::ScatterV => RESERVED_TAG_BASE + 4,
            Tag::Gather => RESERVED_TAG_BASE + 5,
            Tag::GatherV => RESERVED_TAG_BASE + 6,
            Tag::Allgather => RESERVED_TAG_BASE + 7,
            Tag::Revoke => RESERVED_TAG_BASE + 8,
            Tag::Ack => RESERVED_TAG_BASE + 9,
            Tag::ShrinkBeacon => RESERVED_TAG_BASE + 10,
            Tag::Split => RESERVED_TAG_BASE + 11,
            Tag::Derive => RESERVED_TAG_BASE + 12,
        }
    }

    pub fn from_wire(value: u32) -> Option<Tag> {
        if value < RESERVED_TAG_BASE {
            return Some(Tag::User(value));
        }
        let tag = match value - RESERVED_TAG_BASE {
            0 => Tag::Handshake,
            1 => Tag::Barrier,
            2 => Tag::Broadcast,
            3 => Tag::Scatter,
            4 => Tag::ScatterV,
            5 => Tag::Gather,
            6 => Tag::GatherV,
            7 => Tag::Allgather,
            8 => Tag::Revoke,
            9 => Tag::Ack,
            10 => Tag::ShrinkBeacon,
            11 => Tag::Split,
            12 => Tag::Derive,
            _ => return None,
        };
        Some(tag)
    }

    /// Lifecycle traffic keeps flowing on a revoked communicator so that
    /// survivors can still shrink.
    pub fn survives_revoke(self) -> bool {
        matches!(self, Tag::Revoke | Tag::ShrinkBeacon | Tag::Derive)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::User(n) => write!(f, "tag {n}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Security token agreed by every member of a communicator.
///
/// Members compare tokens for exact equality during rendezvous; any
/// disagreement fails the whole group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Token {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Default for Token {
    fn default() -> Self {
        Token::Int(0)
    }
}

impl Token {
    /// Parse an environment value: an integer if it parses, else text.
    pub fn parse_env(value: &str) -> Token {
        match value.trim().parse::<i64>() {
            Ok(n) => Token::Int(n),
            Err(_) => Token::Text(value.to_string()),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Int(n) => write!(f, "{n}"),
            Token::Text(s) => write!(f, "{s:?}"),
            Token::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i32> for Token {
    fn from(n: i32) -> Self {
        Token::Int(n.into())
    }
}

impl From<i64> for Token {
    fn from(n: i64) -> Self {
        Token::Int(n)
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Token::Text(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Token::Text(s)
    }
}

impl From<Vec<u8>> for Token {
    fn from(b: Vec<u8>) -> Self {
        Token::Bytes(b)
    }
}
