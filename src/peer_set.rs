//! The current, and (during reconfiguration) transitional, membership view
//! (spec section: "Data Model", `PeerSet`; "Command Pipeline", joint
//! consensus).
//!
//! While a topology change is in flight, quorum must be satisfied in BOTH
//! the old and the new set (`new.is_some()`); once the owning topology
//! entry commits, the set collapses to the new membership alone.

use std::collections::BTreeSet;

use crate::address::Address;

#[derive(Clone, Debug)]
pub struct PeerSet {
    old: BTreeSet<Address>,
    new: Option<BTreeSet<Address>>,
}

fn majority(set: &BTreeSet<Address>, acked: &BTreeSet<Address>) -> bool {
    if set.is_empty() {
        return true;
    }
    let count = set.intersection(acked).count();
    count * 2 > set.len()
}

impl PeerSet {
    pub fn new(members: impl IntoIterator<Item = Address>) -> Self {
        PeerSet {
            old: members.into_iter().collect(),
            new: None,
        }
    }

    /// True if a topology change is currently in joint consensus.
    pub fn is_joint(&self) -> bool {
        self.new.is_some()
    }

    /// Begins joint consensus with `updated` as the prospective new set.
    /// Returns an error string if a change is already in flight (spec
    /// section: "Design Notes" — "reject concurrent topology changes
    /// until the first commits").
    pub fn begin_joint(&mut self, updated: BTreeSet<Address>) -> Result<(), &'static str> {
        if self.new.is_some() {
            return Err("topology change already in flight");
        }
        self.new = Some(updated);
        Ok(())
    }

    /// Called when the owning topology log entry commits: collapses to
    /// the new set alone.
    pub fn commit_joint(&mut self) {
        if let Some(new) = self.new.take() {
            self.old = new;
        }
    }

    /// Called if the in-flight topology entry fails to commit (e.g. the
    /// leader steps down before it does): reverts to the old set.
    pub fn abort_joint(&mut self) {
        self.new = None;
    }

    /// The set actually used for message fan-out: while joint, this is
    /// the union of both configurations, since a newly joining peer must
    /// start receiving `AppendEntries` before its membership commits
    /// (spec section: "Command Pipeline" — "A join temporarily adds the
    /// joining peer to the transport").
    pub fn fanout_members(&self) -> BTreeSet<Address> {
        match &self.new {
            Some(new) => self.old.union(new).cloned().collect(),
            None => self.old.clone(),
        }
    }

    /// The stable (post-transition, or only) set.
    pub fn stable_members(&self) -> &BTreeSet<Address> {
        &self.old
    }

    pub fn prospective_members(&self) -> Option<&BTreeSet<Address>> {
        self.new.as_ref()
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.old.contains(addr) || self.new.as_ref().is_some_and(|n| n.contains(addr))
    }

    /// Quorum is satisfied only when a majority of EACH provided set (one
    /// or two) has acknowledged (spec section: "Command Pipeline",
    /// `seekConsensus`).
    pub fn quorum_satisfied(&self, acked: &BTreeSet<Address>) -> bool {
        majority(&self.old, acked) && self.new.as_ref().is_none_or(|n| majority(n, acked))
    }

    pub fn len(&self) -> usize {
        self.fanout_members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.old.is_empty() && self.new.as_ref().is_none_or(|n| n.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        format!("/ip4/127.0.0.1/tcp/{}", port).parse().unwrap()
    }

    #[test]
    fn simple_majority_without_joint_change() {
        let set = PeerSet::new([addr(1), addr(2), addr(3)]);
        let mut acked = BTreeSet::new();
        acked.insert(addr(1));
        assert!(!set.quorum_satisfied(&acked));
        acked.insert(addr(2));
        assert!(set.quorum_satisfied(&acked));
    }

    #[test]
    fn joint_consensus_requires_majority_of_both_sets() {
        let mut set = PeerSet::new([addr(1), addr(2), addr(3)]);
        set.begin_joint([addr(3), addr(4), addr(5)].into_iter().collect())
            .unwrap();

        let mut acked = BTreeSet::new();
        acked.insert(addr(1));
        acked.insert(addr(2));
        // Majority of old (1,2) but none of new.
        assert!(!set.quorum_satisfied(&acked));

        acked.insert(addr(3));
        acked.insert(addr(4));
        // Majority of old (1,2,3) and majority of new (3,4).
        assert!(set.quorum_satisfied(&acked));
    }

    #[test]
    fn rejects_concurrent_topology_changes() {
        let mut set = PeerSet::new([addr(1)]);
        set.begin_joint([addr(1), addr(2)].into_iter().collect())
            .unwrap();
        assert!(set.begin_joint([addr(1), addr(3)].into_iter().collect()).is_err());
    }

    #[test]
    fn commit_joint_collapses_to_new_set() {
        let mut set = PeerSet::new([addr(1), addr(2)]);
        set.begin_joint([addr(2), addr(3)].into_iter().collect())
            .unwrap();
        set.commit_joint();
        assert!(!set.is_joint());
        assert_eq!(set.stable_members(), &[addr(2), addr(3)].into_iter().collect());
    }

    #[test]
    fn abort_joint_reverts_to_old_set() {
        let mut set = PeerSet::new([addr(1), addr(2)]);
        set.begin_joint([addr(2), addr(3)].into_iter().collect())
            .unwrap();
        set.abort_joint();
        assert!(!set.is_joint());
        assert_eq!(set.stable_members(), &[addr(1), addr(2)].into_iter().collect());
    }

    #[test]
    fn fanout_includes_both_sets_while_joint() {
        let mut set = PeerSet::new([addr(1)]);
        set.begin_joint([addr(2)].into_iter().collect()).unwrap();
        let fanout = set.fanout_members();
        assert!(fanout.contains(&addr(1)));
        assert!(fanout.contains(&addr(2)));
    }
}
