//! Presence broadcasting: turns registry changes into LineState envelopes.
//!
//! Arrivals and departures go to both role groups; every endpoint sees
//! presence for both roles. Roster queries are answered to the requester
//! alone.

use tracing::debug;

use crate::{
    descriptor::{EndpointDescriptor, Role},
    envelope::Envelope,
    groups::Groups,
    registry::Registry,
};

/// Call after the registration is applied, so a roster query racing this
/// announcement already sees the new entry.
pub async fn announce_arrival(groups: &Groups, descriptor: &EndpointDescriptor) -> usize {
    deliver_to_both_groups(groups, Envelope::online(descriptor.clone())).await
}

pub async fn announce_departure(groups: &Groups, descriptor: &EndpointDescriptor) -> usize {
    deliver_to_both_groups(groups, Envelope::offline(descriptor.clone())).await
}

pub async fn answer_roster_query(
    registry: &Registry,
    groups: &Groups,
    requester: &str,
    role: Role,
) -> bool {
    let roster = registry.snapshot(role).await;
    debug!(%requester, %role, members = roster.len(), "answering roster query");
    groups
        .send_to(requester, Envelope::roster(requester, roster))
        .await
}

async fn deliver_to_both_groups(groups: &Groups, envelope: Envelope) -> usize {
    let mut delivered = 0;
    for role in Role::ALL {
        delivered += groups.send_to_group(role, &envelope).await;
    }
    delivered
}
