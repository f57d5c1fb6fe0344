//! Weakened behavior (spec section: "Role State Machine" — a node that
//! has voluntarily stepped back, e.g. for a graceful leader hand-off,
//! refuses to start its own elections until `resume_at` passes). It still
//! grants votes to other candidates normally (`server::on_request_vote`);
//! only the candidacy side is suppressed.

use std::time::Instant;

use crate::server::Node;

use super::{follower, Role, WeakenedState};

pub fn enter(node: &mut Node, for_duration: std::time::Duration) {
    node.role = Role::Weakened(WeakenedState {
        resume_at: Instant::now() + for_duration,
    });
}

pub fn on_timer(node: &mut Node) {
    log::info!("{} resuming normal operation after weakening", node.self_addr());
    follower::enter(node);
}
