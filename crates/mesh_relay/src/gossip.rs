//! Route-discovery gossip: control messages carried over the broadcast flood.
//!
//! A control message is an ordinary broadcast message whose first part is
//! [`CONTROL_MARKER`]. The second part selects the shape:
//!
//! - `where is <target>`: someone needs a route to `target`
//! - `I am here`: the origin answers a `where is` naming it
//! - `I route <hop0> .. <hopN>`: the origin can reach every listed hop,
//!   each through the ones before it

use crate::identity::PeerId;
use crate::message::Message;

/// First part of every control message.
pub const CONTROL_MARKER: &str = "!BCAST!";

const WHERE_IS: &str = "where is";
const I_AM_HERE: &str = "I am here";
const I_ROUTE: &str = "I route";

/// A parsed gossip control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    WhereIs(PeerId),
    IAmHere,
    IRoute(Vec<PeerId>),
}

/// Classification of a broadcast message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    /// User content, to be relayed and delivered.
    Chat,
    /// A recognised control message.
    Control(Control),
    /// Carries the control marker but no known shape.
    MalformedControl,
}

impl Control {
    /// Message parts for this control message.
    pub fn to_parts(&self) -> Vec<String> {
        let mut parts = vec![CONTROL_MARKER.to_string()];
        match self {
            Self::WhereIs(target) => {
                parts.push(WHERE_IS.to_string());
                parts.push(target.to_string());
            }
            Self::IAmHere => parts.push(I_AM_HERE.to_string()),
            Self::IRoute(path) => {
                parts.push(I_ROUTE.to_string());
                parts.extend(path.iter().map(PeerId::to_string));
            }
        }
        parts
    }
}

/// Classify a broadcast message by its parts.
pub fn classify(message: &Message) -> Broadcast {
    let parts = message.parts();
    if parts.first().map(String::as_str) != Some(CONTROL_MARKER) {
        return Broadcast::Chat;
    }

    match (parts.get(1).map(String::as_str), &parts[2.min(parts.len())..]) {
        (Some(WHERE_IS), [target]) => Broadcast::Control(Control::WhereIs(PeerId::from(target.as_str()))),
        (Some(I_AM_HERE), []) => Broadcast::Control(Control::IAmHere),
        (Some(I_ROUTE), path) if !path.is_empty() => Broadcast::Control(Control::IRoute(
            path.iter().map(|hop| PeerId::from(hop.as_str())).collect(),
        )),
        _ => Broadcast::MalformedControl,
    }
}

/// Extend an `I route` path received from `announcer` as seen by `receiver`.
///
/// Returns `None` when the announcement must be dropped: the path already
/// contains the receiver or the announcer, so accepting it would loop.
pub fn extend_route(path: &[PeerId], announcer: &PeerId, receiver: &PeerId) -> Option<Vec<PeerId>> {
    if path.is_empty() || path.contains(receiver) || path.contains(announcer) {
        return None;
    }
    let mut extended = Vec::with_capacity(path.len() + 1);
    extended.push(announcer.clone());
    extended.extend_from_slice(path);
    Some(extended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Tag;

    fn ids(names: &[&str]) -> Vec<PeerId> {
        names.iter().map(|n| PeerId::from(*n)).collect()
    }

    fn msg(parts: &[&str]) -> Message {
        Message::with_tag(parts.iter().copied(), Tag::at("n", 1.0))
    }

    #[test]
    fn test_chat_is_not_control() {
        assert_eq!(classify(&msg(&["hello", "there"])), Broadcast::Chat);
        assert_eq!(classify(&msg(&[])), Broadcast::Chat);
    }

    #[test]
    fn test_control_parts_roundtrip() {
        let controls = [
            Control::WhereIs(PeerId::from("e")),
            Control::IAmHere,
            Control::IRoute(ids(&["b", "c"])),
        ];
        for control in controls {
            let message = Message::new(control.to_parts(), "a");
            assert_eq!(message.origin(), "a");
            assert_eq!(classify(&message), Broadcast::Control(control));
        }
    }

    #[test]
    fn test_malformed_control() {
        assert_eq!(classify(&msg(&["!BCAST!"])), Broadcast::MalformedControl);
        assert_eq!(classify(&msg(&["!BCAST!", "where is"])), Broadcast::MalformedControl);
        assert_eq!(classify(&msg(&["!BCAST!", "I route"])), Broadcast::MalformedControl);
        assert_eq!(classify(&msg(&["!BCAST!", "hello"])), Broadcast::MalformedControl);
    }

    #[test]
    fn test_extend_route_prepends_announcer() {
        let extended = extend_route(&ids(&["c", "d"]), &PeerId::from("b"), &PeerId::from("a"));
        assert_eq!(extended, Some(ids(&["b", "c", "d"])));
    }

    #[test]
    fn test_extend_route_rejects_loops() {
        let path = ids(&["c", "a", "d"]);
        assert!(extend_route(&path, &PeerId::from("b"), &PeerId::from("a")).is_none());
        assert!(extend_route(&path, &PeerId::from("c"), &PeerId::from("x")).is_none());
        assert!(extend_route(&[], &PeerId::from("b"), &PeerId::from("x")).is_none());
    }
}
