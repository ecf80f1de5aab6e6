use nanoid::nanoid;
use tracing::{debug, info, warn};

use crate::{
    descriptor::{ConnId, EndpointDescriptor, Role},
    envelope::Envelope,
    groups::{Groups, Outbox},
    presence,
    registry::{Registry, RegistryError},
    router::{self, Delivery},
};

/// Broker-side state shared by every connection task: the registry plus the
/// group table used to reach connections.
#[derive(Default)]
pub struct Hub {
    registry: Registry,
    groups: Groups,
}

/// A freshly registered connection.
#[derive(Debug)]
pub struct Admitted {
    pub descriptor: EndpointDescriptor,
    pub outbox: Outbox,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id() -> ConnId {
        nanoid!()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registers the endpoint, joins it to its role group and announces it.
    /// Returns `None` when `conn_id` is already registered; the registry and
    /// groups are left as they were.
    pub async fn admit(&self, conn_id: ConnId, param: EndpointDescriptor) -> Option<Admitted> {
        let registration = self.registry.register(param, conn_id).await;
        let descriptor = registration.descriptor;
        if !registration.inserted {
            debug!(conn_id = %descriptor.conn_id, "ignoring duplicate registration");
            return None;
        }

        let role = descriptor.role();
        let outbox = self.groups.join(descriptor.conn_id.clone(), role).await;
        let online = self.registry.len(role).await;
        info!(
            conn_id = %descriptor.conn_id,
            %role,
            name = %descriptor.name,
            ip = %descriptor.ip_address,
            online,
            "endpoint connected"
        );
        presence::announce_arrival(&self.groups, &descriptor).await;

        Some(Admitted { descriptor, outbox })
    }

    /// Removes the connection and announces its departure. A connection that
    /// never finished registering yields `NotFound`, which is logged here.
    pub async fn release(&self, conn_id: &str) -> Result<EndpointDescriptor, RegistryError> {
        self.groups.leave(conn_id).await;
        match self.registry.unregister(conn_id).await {
            Ok(descriptor) => {
                let role = descriptor.role();
                let online = self.registry.len(role).await;
                info!(
                    %conn_id,
                    %role,
                    name = %descriptor.name,
                    online,
                    "endpoint disconnected"
                );
                presence::announce_departure(&self.groups, &descriptor).await;
                Ok(descriptor)
            }
            Err(err) => {
                warn!(%conn_id, error = %err, "disconnect for unregistered connection");
                Err(err)
            }
        }
    }

    /// Routes an envelope submitted by `sender`. The sender identity is
    /// stamped by the hub, not taken from the endpoint.
    pub async fn submit(&self, sender: &str, mut envelope: Envelope) -> Delivery {
        envelope.from = sender.to_string();
        debug!(
            from = %sender,
            route = ?envelope.route,
            msg_type = ?envelope.msg_type(),
            "routing envelope"
        );
        router::route(&self.groups, envelope).await
    }

    pub async fn roster_query(&self, requester: &str, role: Role) -> bool {
        presence::answer_roster_query(&self.registry, &self.groups, requester, role).await
    }
}
