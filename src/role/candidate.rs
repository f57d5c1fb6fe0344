//! Candidate behavior (spec section: "Role State Machine", Candidate):
//! increment term, vote for self, request votes from every peer in the
//! current fan-out set, become leader on a majority, or fall back to
//! follower on election timeout or on seeing a higher term.

use std::collections::BTreeSet;
use std::time::Instant;

use crate::address::Address;
use crate::rpc::RequestVoteParams;
use crate::server::peer::PeerThreadMessage;
use crate::server::Node;

use super::{leader, CandidateState, Role};

pub fn enter(node: &mut Node) {
    let new_term = node.current_term() + 1;
    let self_addr = node.self_addr().clone();
    if let Err(e) = node.persist_term_and_vote(new_term, Some(self_addr.clone())) {
        log::warn!("failed to persist candidacy for term {}: {}", new_term, e);
    }
    let mut votes = BTreeSet::new();
    votes.insert(self_addr);
    node.role = Role::Candidate(CandidateState {
        election_deadline: Instant::now() + node.config.random_election_timeout(),
        votes_received: votes,
    });
}

pub fn start_election(node: &mut Node) {
    let term = node.current_term();
    let self_addr = node.self_addr().clone();
    log::info!("{} starting election for term {}", self_addr, term);
    let params = RequestVoteParams {
        term,
        candidate_id: self_addr.id().to_string(),
        last_log_index: node.log.last_index(),
        last_log_term: node.log.last_term(),
    };
    let members: Vec<Address> = node
        .peer_set
        .fanout_members()
        .into_iter()
        .filter(|p| *p != self_addr)
        .collect();
    for peer in members {
        node.send_to_peer(&peer, PeerThreadMessage::RequestVote(params.clone()));
    }
}

pub fn on_election_timeout(node: &mut Node) {
    enter(node);
    start_election(node);
}

pub fn handle_vote_reply(node: &mut Node, peer: Address, term: u64, vote_granted: bool, election_term: u64) {
    if node.maybe_adopt_term(term) {
        return;
    }
    let became_leader = if let Role::Candidate(state) = &mut node.role {
        if election_term != node.current_term() {
            // A reply from an election we've already moved past.
            return;
        }
        if vote_granted {
            state.votes_received.insert(peer);
        }
        node.peer_set.quorum_satisfied(&state.votes_received)
    } else {
        false
    };
    if became_leader {
        log::info!("{} won election for term {}", node.self_addr(), node.current_term());
        leader::enter(node);
    }
}
