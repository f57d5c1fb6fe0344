//! Follower behavior (spec section: "Role State Machine", Follower). A
//! follower's only timer is the election deadline; everything else is
//! reactive to `AppendEntries`/`RequestVote`/`InstallSnapshot` handled
//! centrally in `server::Node`, since those handlers are largely
//! role-agnostic and only consult the current role for step-down checks.

use std::time::Instant;

use crate::server::Node;

use super::{candidate, FollowerState, Role};

pub fn enter(node: &mut Node) {
    node.role = Role::Follower(FollowerState {
        election_deadline: Instant::now() + node.config.random_election_timeout(),
    });
}

/// Any valid `AppendEntries`/`RequestVote`/`InstallSnapshot` from the
/// current leader/candidate resets the deadline, whatever role we're
/// currently in (spec section: "Role State Machine" — "a node only starts
/// an election after a full timeout with no contact from a leader").
pub fn reset_election_timer(node: &mut Node) {
    match &mut node.role {
        Role::Follower(s) => {
            s.election_deadline = Instant::now() + node.config.random_election_timeout();
        }
        Role::Candidate(s) => {
            s.election_deadline = Instant::now() + node.config.random_election_timeout();
        }
        _ => {}
    }
}

pub fn on_election_timeout(node: &mut Node) {
    log::info!("{} election timeout as follower, becoming candidate", node.self_addr());
    candidate::enter(node);
    candidate::start_election(node);
}
