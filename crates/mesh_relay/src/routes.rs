//! Route table: learned hop paths to named peers.

use std::collections::HashMap;

use crate::identity::PeerId;

/// Maps a destination to the intermediate hops leading to it (destination
/// excluded). An empty prefix means "directly reachable".
///
/// Entries are last-heard-wins: any gossip that proves a path replaces the
/// previous one, even if longer.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<PeerId, Vec<PeerId>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the path prefix for `dest`. Returns `true` if the table
    /// changed.
    pub fn record(&mut self, dest: PeerId, prefix: Vec<PeerId>) -> bool {
        match self.routes.get(&dest) {
            Some(existing) if *existing == prefix => false,
            _ => {
                self.routes.insert(dest, prefix);
                true
            }
        }
    }

    /// Record every waypoint of `path` as individually routable:
    /// `path[i]` is reached through `path[..i]`. Returns `true` if any entry
    /// changed.
    pub fn record_path(&mut self, path: &[PeerId]) -> bool {
        let mut changed = false;
        for (i, hop) in path.iter().enumerate() {
            changed |= self.record(hop.clone(), path[..i].to_vec());
        }
        changed
    }

    pub fn prefix(&self, dest: &PeerId) -> Option<&[PeerId]> {
        self.routes.get(dest).map(Vec::as_slice)
    }

    pub fn contains(&self, dest: &PeerId) -> bool {
        self.routes.contains_key(dest)
    }

    /// Full hop path to `dest`: the recorded prefix followed by `dest`, or
    /// just `dest` when nothing is known.
    pub fn resolve(&self, dest: &PeerId) -> Vec<PeerId> {
        let mut path = self.prefix(dest).map(<[PeerId]>::to_vec).unwrap_or_default();
        path.push(dest.clone());
        path
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
