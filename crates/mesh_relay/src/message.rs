//! Message model: tags, tagged messages and routed messages.
//!
//! Every message on the wire is a multipart frame sequence. A plain message
//! is `[tag, part0, part1, ...]`; a routed message prepends its hop path:
//! `[to0, to1, ..., tag, part0, ...]`. The tag is rendered as
//! `<name:seconds>` and is the only thing that distinguishes a route entry
//! from the start of the message body.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::identity::PeerId;

/// One transport frame.
pub type Frame = Vec<u8>;

/// A multipart message as carried by the transport.
pub type Frames = Vec<Frame>;

/// Origin name used when a frame sequence carries no tag of its own.
pub const UNKNOWN_ORIGIN: &str = "unknown";

static TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<(.+?):(\d+|\d+\.\d+)>$").expect("valid tag regex"));

/// Wall-clock time as fractional seconds since the Unix epoch.
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

/// Identifies "this exact message, from this origin, at this instant".
///
/// Equality is exact on both fields; two messages with the same text sent a
/// microsecond apart are different messages.
#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub time: f64,
}

impl Tag {
    /// A tag for `name` stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self::at(name, now_seconds())
    }

    /// A tag for `name` with an explicit timestamp.
    pub fn at(name: impl Into<String>, time: f64) -> Self {
        Self {
            name: name.into(),
            time,
        }
    }

    /// Parse the `<name:seconds>` textual form. Returns `None` when `text` is
    /// not tag-shaped.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = TAG_PATTERN.captures(text)?;
        let name = caps.get(1)?.as_str();
        match caps.get(2)?.as_str().parse::<f64>() {
            Ok(time) => Some(Self::at(name, time)),
            Err(_) => Some(Self::new(name)),
        }
    }

    /// Whether a raw frame is tag-shaped.
    pub fn is_tag_frame(frame: &[u8]) -> bool {
        std::str::from_utf8(frame).is_ok_and(|s| TAG_PATTERN.is_match(s))
    }

    /// Seconds elapsed between the tag's timestamp and `now`.
    pub fn age_at(&self, now: f64) -> f64 {
        now - self.time
    }

    pub fn encode(&self) -> Frame {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Always carry a fractional part so peers parse the same value back.
        if self.time.fract() == 0.0 {
            write!(f, "<{}:{:.1}>", self.name, self.time)
        } else {
            write!(f, "<{}:{}>", self.name, self.time)
        }
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.time == other.time
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.time.to_bits().hash(state);
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An immutable tagged message: string parts plus the tag of its origin.
#[derive(Debug, Clone)]
pub struct Message {
    parts: Vec<String>,
    tag: Tag,
    sep: String,
}

impl Message {
    /// Build a message originating from `origin`, stamped now.
    pub fn new<I, S>(parts: I, origin: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_tag(parts, Tag::new(origin))
    }

    /// Build a message carrying an existing tag.
    pub fn with_tag<I, S>(parts: I, tag: Tag) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
            tag,
            sep: " ".to_string(),
        }
    }

    /// Replace the separator used for display.
    pub fn with_separator(mut self, sep: impl Into<String>) -> Self {
        self.sep = sep.into();
        self
    }

    /// Decode a frame sequence. A leading tag-shaped frame becomes the tag;
    /// otherwise a fresh tag is synthesized for `fallback_origin` and every
    /// frame is a part.
    pub fn decode(frames: &[Frame], fallback_origin: &str) -> Self {
        if let Some(tag) = frames
            .first()
            .and_then(|f| std::str::from_utf8(f).ok())
            .and_then(Tag::parse)
        {
            return Self::with_tag(frames[1..].iter().map(|f| decode_part(f)), tag);
        }
        Self::with_tag(frames.iter().map(|f| decode_part(f)), Tag::new(fallback_origin))
    }

    /// Encode as `[tag, parts...]`.
    pub fn encode(&self) -> Frames {
        let mut frames = Vec::with_capacity(self.parts.len() + 1);
        frames.push(self.tag.encode());
        frames.extend(self.parts.iter().map(|p| p.as_bytes().to_vec()));
        frames
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Origin name carried by the tag.
    pub fn origin(&self) -> &str {
        &self.tag.name
    }

    pub fn time(&self) -> f64 {
        self.tag.time
    }

    /// Separator-joined parts; the tag is not part of the display text.
    pub fn text(&self) -> String {
        self.parts.join(&self.sep)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.text() == other.text()
    }
}

fn decode_part(frame: &[u8]) -> String {
    String::from_utf8_lossy(frame).into_owned()
}

// ---------------------------------------------------------------------------
// RoutedMessage
// ---------------------------------------------------------------------------

/// A message addressed to a final identity through an explicit hop path.
///
/// `to` lists the remaining intermediate hops followed by the destination.
/// `failures` counts failed send attempts on the current node and is never
/// serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedMessage {
    pub to: Vec<PeerId>,
    pub message: Message,
    pub failures: u32,
}

impl RoutedMessage {
    pub fn new(to: Vec<PeerId>, message: Message) -> Self {
        Self {
            to,
            message,
            failures: 0,
        }
    }

    /// Final destination (last path element).
    pub fn destination(&self) -> Option<&PeerId> {
        self.to.last()
    }

    /// The hop this message must be handed to next.
    pub fn next_hop(&self) -> Option<&PeerId> {
        self.to.first()
    }

    /// Encode as `[to..., tag, parts...]`.
    pub fn encode(&self) -> Frames {
        let mut frames: Frames = self
            .to
            .iter()
            .map(|hop| hop.as_str().as_bytes().to_vec())
            .collect();
        frames.extend(self.message.encode());
        frames
    }

    /// Decode a routed frame sequence. Returns `None` unless the frames have
    /// at least one leading route entry, a tag frame, and at least one part
    /// after it.
    pub fn decode(frames: &[Frame]) -> Option<Self> {
        let tag_idx = frames.iter().position(|f| Tag::is_tag_frame(f))?;
        if tag_idx == 0 || tag_idx + 1 >= frames.len() {
            return None;
        }
        let to = frames[..tag_idx]
            .iter()
            .map(|f| PeerId(decode_part(f)))
            .collect();
        let message = Message::decode(&frames[tag_idx..], UNKNOWN_ORIGIN);
        Some(Self::new(to, message))
    }
}

impl fmt::Display for RoutedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path: Vec<&str> = self.to.iter().map(PeerId::as_str).collect();
        write!(f, "{} -> [{}]", self.message, path.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&str]) -> Frames {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_tag_equality() {
        assert_eq!(Tag::at("x", 5.0), Tag::at("x", 5.0));
        assert_ne!(Tag::at("x", 5.0), Tag::at("y", 5.0));
        assert_ne!(Tag::at("x", 5.0), Tag::at("x", 5.5));
    }

    #[test]
    fn test_tag_text_form() {
        assert_eq!(Tag::at("node-a", 5.0).to_string(), "<node-a:5.0>");
        assert_eq!(Tag::at("node-a", 1700000000.25).to_string(), "<node-a:1700000000.25>");
    }

    #[test]
    fn test_tag_parse() {
        let tag = Tag::parse("<tarch(A):5555:12.5>").unwrap();
        assert_eq!(tag.name, "tarch(A):5555");
        assert_eq!(tag.time, 12.5);

        assert_eq!(Tag::parse("<bob:7>"), Some(Tag::at("bob", 7.0)));
        assert!(Tag::parse("hello").is_none());
        assert!(Tag::parse("<bob:>").is_none());
        assert!(Tag::parse("<bob:7> trailing").is_none());
    }

    #[test]
    fn test_untagged_message_gets_fallback_origin() {
        let msg = Message::decode(&frames(&["supz"]), UNKNOWN_ORIGIN);
        assert_eq!(msg.to_string(), "supz");
        assert_eq!(msg.origin(), "unknown");
        assert!(msg.time() > 0.0);
    }

    #[test]
    fn test_tag_must_fill_the_whole_frame() {
        let msg = Message::decode(&frames(&["<a:1.0>junk", "hi"]), "sender");
        assert_eq!(msg.origin(), "sender");
        assert_eq!(msg.parts(), &["<a:1.0>junk".to_string(), "hi".to_string()]);
    }

    #[test]
    fn test_decode_consumes_leading_tag() {
        let msg = Message::decode(&frames(&["<alice:3.0>", "hello", "world"]), "fallback");
        assert_eq!(msg.tag(), &Tag::at("alice", 3.0));
        assert_eq!(msg.parts(), &["hello".to_string(), "world".to_string()]);
        assert_eq!(msg.text(), "hello world");
    }

    #[test]
    fn test_roundtrip_identity() {
        let original = Message::new(["one", "two", "three"], "alice");
        let decoded = Message::decode(&original.encode(), "someone-else");
        assert_eq!(decoded, original);
        assert_eq!(decoded.parts(), original.parts());
    }

    #[test]
    fn test_separator_only_affects_display() {
        let msg = Message::with_tag(["a", "b"], Tag::at("x", 1.0)).with_separator("/");
        assert_eq!(msg.to_string(), "a/b");
        assert_eq!(msg.encode(), frames(&["<x:1.0>", "a", "b"]));
    }

    #[test]
    fn test_routed_encode_layout() {
        let routed = RoutedMessage::new(
            vec![PeerId::from("b"), PeerId::from("c")],
            Message::with_tag(["hi"], Tag::at("a", 2.0)),
        );
        assert_eq!(routed.encode(), frames(&["b", "c", "<a:2.0>", "hi"]));
        assert_eq!(routed.destination(), Some(&PeerId::from("c")));
        assert_eq!(routed.next_hop(), Some(&PeerId::from("b")));
    }

    #[test]
    fn test_routed_decode_recovers_path() {
        let routed = RoutedMessage::decode(&frames(&["b", "c", "<a:2.0>", "hi", "there"])).unwrap();
        assert_eq!(routed.to, vec![PeerId::from("b"), PeerId::from("c")]);
        assert_eq!(routed.message.tag(), &Tag::at("a", 2.0));
        assert_eq!(routed.message.text(), "hi there");
        assert_eq!(routed.failures, 0);
    }

    #[test]
    fn test_routed_decode_rejects_bad_shapes() {
        // No route entries: this is a plain message.
        assert!(RoutedMessage::decode(&frames(&["<a:2.0>", "hi"])).is_none());
        // No tag at all.
        assert!(RoutedMessage::decode(&frames(&["b", "hi"])).is_none());
        // Nothing after the tag.
        assert!(RoutedMessage::decode(&frames(&["b", "<a:2.0>"])).is_none());
        assert!(RoutedMessage::decode(&[]).is_none());
    }
}
