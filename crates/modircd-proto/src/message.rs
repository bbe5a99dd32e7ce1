//! IRC message parsing and serialization.
//!
//! A wire line has the shape `[@tags] [:prefix] COMMAND [params] [:trailing]`.
//! Tags follow the IRCv3 message-tags extension; the RFC line-length cap of
//! 512 bytes applies to everything after the tags section.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum length of a raw line, excluding the tags section, including CRLF.
pub const MAX_LINE_LEN: usize = 512;

/// A single IRCv3 message tag: key and optional value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tags: Vec<Tag>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageParseError {
    #[error("empty message")]
    Empty,
    #[error("line exceeds {MAX_LINE_LEN} bytes")]
    TooLong,
    #[error("malformed tags section")]
    BadTags,
    #[error("missing command")]
    MissingCommand,
}

impl Message {
    /// Build a message with no tags and no prefix.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Message {
        Message {
            tags: Vec::new(),
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Build a message with a prefix.
    pub fn with_prefix(
        prefix: impl Into<String>,
        command: impl Into<String>,
        params: Vec<String>,
    ) -> Message {
        Message {
            tags: Vec::new(),
            prefix: Some(prefix.into()),
            command: command.into(),
            params,
        }
    }

    /// Look up a tag value by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|Tag(k, _)| k == key)
            .and_then(|Tag(_, v)| v.as_deref())
    }
}

fn unescape_tag_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

fn parse_tags(section: &str) -> Result<Vec<Tag>, MessageParseError> {
    let mut tags = Vec::new();
    for item in section.split(';') {
        if item.is_empty() {
            return Err(MessageParseError::BadTags);
        }
        match item.split_once('=') {
            Some((k, v)) => tags.push(Tag(k.to_string(), Some(unescape_tag_value(v)))),
            None => tags.push(Tag(item.to_string(), None)),
        }
    }
    Ok(tags)
}

impl FromStr for Message {
    type Err = MessageParseError;

    fn from_str(line: &str) -> Result<Message, MessageParseError> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(MessageParseError::Empty);
        }

        let mut tags = Vec::new();
        if let Some(after) = rest.strip_prefix('@') {
            let (section, tail) = after
                .split_once(' ')
                .ok_or(MessageParseError::MissingCommand)?;
            tags = parse_tags(section)?;
            rest = tail.trim_start_matches(' ');
        }

        if rest.len() > MAX_LINE_LEN {
            return Err(MessageParseError::TooLong);
        }

        let mut prefix = None;
        if let Some(after) = rest.strip_prefix(':') {
            let (pfx, tail) = after
                .split_once(' ')
                .ok_or(MessageParseError::MissingCommand)?;
            prefix = Some(pfx.to_string());
            rest = tail.trim_start_matches(' ');
        }

        let mut params = Vec::new();
        let command;
        match rest.split_once(' ') {
            None => {
                if rest.is_empty() {
                    return Err(MessageParseError::MissingCommand);
                }
                command = rest.to_string();
            }
            Some((cmd, mut tail)) => {
                command = cmd.to_string();
                loop {
                    tail = tail.trim_start_matches(' ');
                    if tail.is_empty() {
                        break;
                    }
                    if let Some(trailing) = tail.strip_prefix(':') {
                        params.push(trailing.to_string());
                        break;
                    }
                    match tail.split_once(' ') {
                        Some((param, next)) => {
                            params.push(param.to_string());
                            tail = next;
                        }
                        None => {
                            params.push(tail.to_string());
                            break;
                        }
                    }
                }
            }
        }
        if command.is_empty() {
            return Err(MessageParseError::MissingCommand);
        }

        Ok(Message {
            tags,
            prefix,
            command,
            params,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "@")?;
            for (i, Tag(k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                match v {
                    Some(v) => write!(f, "{}={}", k, escape_tag_value(v))?,
                    None => write!(f, "{}", k)?,
                }
            }
            write!(f, " ")?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        write!(f, "{}", self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_command() {
        let msg: Message = "QUIT".parse().unwrap();
        assert_eq!(msg.command, "QUIT");
        assert!(msg.params.is_empty());
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn parses_prefix_and_trailing() {
        let msg: Message = ":nick!user@host PRIVMSG #chan :Hello world".parse().unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("nick!user@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "Hello world"]);
    }

    #[test]
    fn parses_tags() {
        let msg: Message = "@time=2020-01-01;flag :src CMD a".parse().unwrap();
        assert_eq!(msg.tag_value("time"), Some("2020-01-01"));
        assert_eq!(msg.tags[1], Tag("flag".into(), None));
        assert_eq!(msg.command, "CMD");
        assert_eq!(msg.params, vec!["a"]);
    }

    #[test]
    fn tag_value_unescaping() {
        let msg: Message = "@k=a\\:b\\sc\\\\d CMD".parse().unwrap();
        assert_eq!(msg.tag_value("k"), Some("a;b c\\d"));
    }

    #[test]
    fn trailing_may_contain_colons_and_spaces() {
        let msg: Message = "USER ident 0 * :Real Name Here".parse().unwrap();
        assert_eq!(msg.params, vec!["ident", "0", "*", "Real Name Here"]);
    }

    #[test]
    fn collapses_extra_separators() {
        let msg: Message = "JOIN   #a".parse().unwrap();
        assert_eq!(msg.params, vec!["#a"]);
    }

    #[test]
    fn rejects_oversized_line() {
        let line = format!("PRIVMSG #c :{}", "x".repeat(600));
        assert_eq!(line.parse::<Message>(), Err(MessageParseError::TooLong));
    }

    #[test]
    fn tags_do_not_count_against_length() {
        let line = format!("@k={} PING x", "y".repeat(600));
        assert!(line.parse::<Message>().is_ok());
    }

    #[test]
    fn round_trips_through_display() {
        for line in [
            ":server 001 alice :Welcome to the network",
            "PING irc.example.com",
            "MODE #chan +b nick!*@*",
            "@account=alice :a!b@c PRIVMSG #x :hi there",
        ] {
            let msg: Message = line.parse().unwrap();
            assert_eq!(msg.to_string(), line);
        }
    }

    #[test]
    fn trailing_marker_added_when_needed() {
        let msg = Message::new("PRIVMSG", vec!["#c".into(), "two words".into()]);
        assert_eq!(msg.to_string(), "PRIVMSG #c :two words");
        let msg = Message::new("TOPIC", vec!["#c".into(), String::new()]);
        assert_eq!(msg.to_string(), "TOPIC #c :");
    }
}
