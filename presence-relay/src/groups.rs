use std::collections::HashMap;

use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, warn};

use crate::{
    descriptor::{ConnId, Role},
    envelope::Envelope,
};

/// Envelopes buffered per connection before deliveries to it start dropping.
pub const OUTBOX_CAPACITY: usize = 128;

pub type Outbox = mpsc::Receiver<Envelope>;

/// Outbound queues of every joined connection, tagged with the role group
/// each one belongs to.
#[derive(Default)]
pub struct Groups {
    members: Mutex<HashMap<ConnId, Member>>,
}

struct Member {
    role: Role,
    sender: mpsc::Sender<Envelope>,
}

impl Groups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn_id` to its role group and hands back the receiving end of
    /// its outbox. Joining again replaces the previous outbox.
    pub async fn join(&self, conn_id: ConnId, role: Role) -> Outbox {
        let (sender, outbox) = mpsc::channel(OUTBOX_CAPACITY);
        self.members
            .lock()
            .await
            .insert(conn_id, Member { role, sender });
        outbox
    }

    pub async fn leave(&self, conn_id: &str) -> bool {
        self.members.lock().await.remove(conn_id).is_some()
    }

    /// Returns `false` when `conn_id` has no outbox.
    pub async fn send_to(&self, conn_id: &str, envelope: Envelope) -> bool {
        let members = self.members.lock().await;
        match members.get(conn_id) {
            Some(member) => deliver(conn_id, member, envelope),
            None => false,
        }
    }

    /// Returns the number of members the envelope was queued for.
    pub async fn send_to_group(&self, role: Role, envelope: &Envelope) -> usize {
        let members = self.members.lock().await;
        members
            .iter()
            .filter(|(_, member)| member.role == role)
            .filter(|(conn_id, member)| deliver(conn_id, member, envelope.clone()))
            .count()
    }

    pub async fn send_to_all(&self, envelope: &Envelope) -> usize {
        let members = self.members.lock().await;
        members
            .iter()
            .filter(|(conn_id, member)| deliver(conn_id, member, envelope.clone()))
            .count()
    }
}

// Never waits on a slow reader: a full outbox drops the envelope for that member only.
fn deliver(conn_id: &str, member: &Member, envelope: Envelope) -> bool {
    match member.sender.try_send(envelope) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(%conn_id, group = %member.role, "outbox full, dropping envelope");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(%conn_id, "outbox closed, connection is going away");
            false
        }
    }
}
