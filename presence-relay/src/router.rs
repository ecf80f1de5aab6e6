use tracing::{debug, warn};

use crate::{
    envelope::{Body, Envelope, Route},
    groups::Groups,
};

/// What happened to a routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for this many connections.
    Broadcast(usize),
    Direct,
    /// Recipient is not connected; the envelope is dropped without telling the sender.
    UnknownRecipient,
    /// Presence envelopes are produced by the broker and never routed on behalf of endpoints.
    Rejected,
}

/// Delivers a Text or Command envelope to its recipient, or to every
/// connection regardless of role when it is a broadcast.
pub async fn route(groups: &Groups, envelope: Envelope) -> Delivery {
    if let Body::LineState(_) = envelope.body {
        warn!(from = %envelope.from, "endpoint tried to route a presence envelope");
        return Delivery::Rejected;
    }

    let recipient = match &envelope.route {
        Route::Broadcast => return Delivery::Broadcast(groups.send_to_all(&envelope).await),
        Route::Direct(recipient) => recipient.clone(),
    };

    if groups.send_to(&recipient, envelope).await {
        Delivery::Direct
    } else {
        debug!(%recipient, "dropping envelope for unknown recipient");
        Delivery::UnknownRecipient
    }
}
