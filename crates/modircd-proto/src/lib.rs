//! IRC wire protocol support for modircd.
//!
//! This crate holds everything that deals with bytes on the wire and with
//! protocol-defined string semantics: message parsing and serialization,
//! line framing, RFC 1459 casemapping, hostmask wildcard matching, and the
//! numeric replies the daemon emits.

pub mod casemap;
pub mod hostmask;
pub mod line;
pub mod message;
pub mod numerics;

pub use casemap::{irc_eq, irc_lower, irc_lower_char, CasemappedMap};
pub use hostmask::matches_mask;
pub use line::{Frame, LineCodec};
pub use message::{Message, MessageParseError, Tag};
