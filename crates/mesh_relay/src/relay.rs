//! Relay pipeline: the per-input reaction logic of a node.
//!
//! [`Relay`] owns a node's recent-set, route table and retry queue and turns
//! each [`Input`] into a list of [`Action`]s. It never touches a transport:
//! the reactor in [`crate::node`] executes the actions and feeds send
//! failures back in as [`Input::SendFailed`]. This keeps flooding, routing
//! and suppression testable without sockets.

use tracing::{debug, trace};

use crate::gossip::{self, Broadcast, Control};
use crate::identity::PeerId;
use crate::message::{Frames, Message, RoutedMessage, Tag, now_seconds};
use crate::recent::{DEFAULT_DUP_TIME, RecentSet};
use crate::retry::{DEFAULT_MAX_FAILURES, DEFAULT_RETRY_CAPACITY, FailureOutcome, RetryQueue};
use crate::routes::RouteTable;

/// Smallest step between two tags minted by the same node.
const STAMP_STEP: f64 = 1e-6;

/// Tunables for a relay.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Duplicate-suppression window in seconds.
    pub dup_time: f64,
    pub retry_capacity: usize,
    pub max_failures: u32,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            dup_time: DEFAULT_DUP_TIME,
            retry_capacity: DEFAULT_RETRY_CAPACITY,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

/// Something that happened to the node.
#[derive(Debug, Clone)]
pub enum Input {
    /// The local user published text to everyone.
    Publish(Vec<String>),
    /// The local user addressed text to one identity.
    Route { dest: PeerId, parts: Vec<String> },
    /// Frames arrived through the subscription to `from`.
    Broadcast { from: PeerId, frames: Frames },
    /// Frames arrived on a point-to-point channel from `from`.
    Direct { from: PeerId, frames: Frames },
    /// The transport could not hand a routed message to its next hop.
    SendFailed(RoutedMessage),
    /// Periodic tick: prune suppression state and retry queued messages.
    Housekeeping,
}

/// Something the node must do in response.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send on the broadcast channel to every subscriber.
    Publish(Frames),
    /// Send to every point-to-point peer except `except`.
    SendToPeers { except: Option<PeerId>, frames: Frames },
    /// Hand a routed message to its next hop.
    SendRouted(RoutedMessage),
    /// Surface a message to the user-facing layer.
    Deliver(Message),
}

pub struct Relay {
    identity: PeerId,
    /// Tags accepted for relaying on the broadcast path.
    recent: RecentSet,
    /// Tags already surfaced to the user. A point-to-point copy lands here
    /// only, so it never stops the broadcast copy from being re-flooded.
    delivered: RecentSet,
    routes: RouteTable,
    retry: RetryQueue,
    last_stamp: f64,
}

impl Relay {
    pub fn new(identity: PeerId, settings: RelaySettings) -> Self {
        Self {
            identity,
            recent: RecentSet::new(settings.dup_time),
            delivered: RecentSet::new(settings.dup_time),
            routes: RouteTable::new(),
            retry: RetryQueue::new(settings.retry_capacity, settings.max_failures),
            last_stamp: 0.0,
        }
    }

    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    /// React to `input` using the wall clock.
    pub fn react(&mut self, input: Input) -> Vec<Action> {
        self.react_at(input, now_seconds())
    }

    /// React to `input` as if the wall clock read `now`.
    pub fn react_at(&mut self, input: Input, now: f64) -> Vec<Action> {
        let mut actions = Vec::new();
        match input {
            Input::Publish(parts) => self.local_publish(parts, now, &mut actions),
            Input::Route { dest, parts } => self.local_route(dest, parts, now, &mut actions),
            Input::Broadcast { from, frames } => self.broadcast_in(&from, &frames, now, &mut actions),
            Input::Direct { from, frames } => self.direct_in(&from, &frames, now, &mut actions),
            Input::SendFailed(msg) => self.send_failed(msg, now, &mut actions),
            Input::Housekeeping => self.housekeeping(now, &mut actions),
        }
        actions
    }

    // -----------------------------------------------------------------------
    // Local origin
    // -----------------------------------------------------------------------

    fn local_publish(&mut self, parts: Vec<String>, now: f64, actions: &mut Vec<Action>) {
        let msg = Message::with_tag(parts, self.stamp(now));
        self.originate(msg.tag(), now);
        actions.push(Action::Publish(msg.encode()));
    }

    fn local_route(&mut self, dest: PeerId, parts: Vec<String>, now: f64, actions: &mut Vec<Action>) {
        let msg = Message::with_tag(parts, self.stamp(now));
        self.originate(msg.tag(), now);
        if dest == self.identity {
            actions.push(Action::Deliver(msg));
            return;
        }
        let to = self.routes.resolve(&dest);
        actions.push(Action::SendRouted(RoutedMessage::new(to, msg)));
    }

    // -----------------------------------------------------------------------
    // Broadcast-in
    // -----------------------------------------------------------------------

    fn broadcast_in(&mut self, from: &PeerId, frames: &Frames, now: f64, actions: &mut Vec<Action>) {
        let msg = Message::decode(frames, from.as_str());
        if self.recent.is_duplicate_at(msg.tag(), now) {
            trace!(node = %self.identity, "Suppressed duplicate {} from {from}", msg.tag());
            return;
        }
        self.recent.mark_seen_at(msg.tag(), now);

        match gossip::classify(&msg) {
            Broadcast::Chat => {
                let frames = msg.encode();
                actions.push(Action::Publish(frames.clone()));
                actions.push(Action::SendToPeers {
                    except: Some(from.clone()),
                    frames,
                });
                self.deliver_once(msg, now, actions);
            }
            Broadcast::Control(control) => self.gossip_in(control, msg, now, actions),
            Broadcast::MalformedControl => {
                debug!(node = %self.identity, "Dropping malformed control message {} from {from}", msg.tag());
            }
        }
    }

    fn gossip_in(&mut self, control: Control, msg: Message, now: f64, actions: &mut Vec<Action>) {
        let origin = PeerId::from(msg.origin());
        match control {
            Control::WhereIs(target) => {
                actions.push(Action::Publish(msg.encode()));
                if target == self.identity {
                    debug!(node = %self.identity, "{origin} is looking for us");
                    self.announce(Control::IAmHere, now, actions);
                } else if self.routes.contains(&target) {
                    let path = self.routes.resolve(&target);
                    self.announce(Control::IRoute(path), now, actions);
                }
            }
            Control::IAmHere => {
                if origin == self.identity {
                    return;
                }
                debug!(node = %self.identity, "{origin} is directly reachable");
                self.routes.record(origin.clone(), Vec::new());
                self.announce(Control::IRoute(vec![origin]), now, actions);
                self.drain_resolvable(actions);
            }
            Control::IRoute(path) => {
                let Some(extended) = gossip::extend_route(&path, &origin, &self.identity) else {
                    debug!(node = %self.identity, "Dropping looping route announcement from {origin}");
                    return;
                };
                self.routes.record_path(&extended);
                self.announce(Control::IRoute(extended), now, actions);
                self.drain_resolvable(actions);
            }
        }
    }

    fn announce(&mut self, control: Control, now: f64, actions: &mut Vec<Action>) {
        let msg = Message::with_tag(control.to_parts(), self.stamp(now));
        self.recent.mark_seen_at(msg.tag(), now);
        actions.push(Action::Publish(msg.encode()));
    }

    // -----------------------------------------------------------------------
    // Point-to-point-in
    // -----------------------------------------------------------------------

    fn direct_in(&mut self, from: &PeerId, frames: &Frames, now: f64, actions: &mut Vec<Action>) {
        if let Some(mut routed) = RoutedMessage::decode(frames) {
            let Some(dest) = routed.destination().cloned() else {
                return;
            };
            if dest == self.identity {
                actions.push(Action::Deliver(routed.message));
                return;
            }

            routed.to = if self.routes.contains(&dest) {
                self.routes.resolve(&dest)
            } else {
                let skip = routed.to.iter().take_while(|hop| **hop == self.identity).count();
                routed.to.split_off(skip)
            };
            trace!(node = %self.identity, "Forwarding {routed} from {from}");
            actions.push(Action::SendRouted(routed));
            return;
        }

        // Plain copies are never relayed, so they only touch the delivered set.
        let msg = Message::decode(frames, from.as_str());
        match gossip::classify(&msg) {
            Broadcast::Chat => self.deliver_once(msg, now, actions),
            _ => debug!(node = %self.identity, "Ignoring control message sent directly by {from}"),
        }
    }

    fn deliver_once(&mut self, msg: Message, now: f64, actions: &mut Vec<Action>) {
        if self.delivered.is_duplicate_at(msg.tag(), now) {
            trace!(node = %self.identity, "Already delivered {}", msg.tag());
            return;
        }
        self.delivered.mark_seen_at(msg.tag(), now);
        actions.push(Action::Deliver(msg));
    }

    // -----------------------------------------------------------------------
    // Failures and retries
    // -----------------------------------------------------------------------

    fn send_failed(&mut self, msg: RoutedMessage, now: f64, actions: &mut Vec<Action>) {
        let Some(dest) = msg.destination().cloned() else {
            return;
        };
        match self.retry.record_failure(msg) {
            FailureOutcome::Queued { .. } => {
                debug!(node = %self.identity, "No usable route to {dest}, asking the network");
                self.announce(Control::WhereIs(dest), now, actions);
            }
            FailureOutcome::Dropped(_) => {}
        }
    }

    fn drain_resolvable(&mut self, actions: &mut Vec<Action>) {
        let routes = &self.routes;
        for mut msg in self.retry.take_resolvable(|dest| routes.contains(dest)) {
            if let Some(dest) = msg.destination().cloned() {
                msg.to = routes.resolve(&dest);
            }
            actions.push(Action::SendRouted(msg));
        }
    }

    fn housekeeping(&mut self, now: f64, actions: &mut Vec<Action>) {
        self.recent.prune_at(now);
        self.delivered.prune_at(now);
        for mut msg in self.retry.take_all() {
            if let Some(dest) = msg.destination().cloned() {
                msg.to = self.routes.resolve(&dest);
            }
            actions.push(Action::SendRouted(msg));
        }
    }

    /// Our own messages are neither relayed again nor delivered back to us.
    fn originate(&mut self, tag: &Tag, now: f64) {
        self.recent.mark_seen_at(tag, now);
        self.delivered.mark_seen_at(tag, now);
    }

    /// A fresh tag for a message minted here, strictly later than the last.
    fn stamp(&mut self, now: f64) -> Tag {
        let time = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + STAMP_STEP
        };
        self.last_stamp = time;
        Tag::at(self.identity.as_str(), time)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
