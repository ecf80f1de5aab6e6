use thiserror::Error;
use tokio::sync::Mutex;

use crate::descriptor::{ConnId, EndpointDescriptor, Role};

/// Authoritative set of connected endpoints, one collection per role.
///
/// A single lock guards both collections, so every operation (and every
/// snapshot) observes the registry at one instant.
#[derive(Default)]
pub struct Registry {
    rosters: Mutex<Rosters>,
}

#[derive(Default)]
struct Rosters {
    services: Vec<EndpointDescriptor>,
    clients: Vec<EndpointDescriptor>,
}

impl Rosters {
    fn collection(&self, role: Role) -> &Vec<EndpointDescriptor> {
        match role {
            Role::Service => &self.services,
            Role::Client => &self.clients,
        }
    }

    fn collection_mut(&mut self, role: Role) -> &mut Vec<EndpointDescriptor> {
        match role {
            Role::Service => &mut self.services,
            Role::Client => &mut self.clients,
        }
    }

    fn position(&self, conn_id: &str) -> Option<(Role, usize)> {
        Role::ALL.into_iter().find_map(|role| {
            self.collection(role)
                .iter()
                .position(|entry| entry.conn_id == conn_id)
                .map(|index| (role, index))
        })
    }
}

/// Outcome of [`Registry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub descriptor: EndpointDescriptor,
    /// `false` when the connection identity was already registered.
    pub inserted: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    NotFound(ConnId),
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finalizes `descriptor` with `conn_id` and inserts it into its role's
    /// collection. Registering an identity that is already present (in either
    /// collection) leaves the registry untouched.
    pub async fn register(&self, descriptor: EndpointDescriptor, conn_id: ConnId) -> Registration {
        let descriptor = descriptor.with_conn_id(conn_id);
        let mut rosters = self.rosters.lock().await;

        if rosters.position(&descriptor.conn_id).is_some() {
            return Registration {
                descriptor,
                inserted: false,
            };
        }

        rosters
            .collection_mut(descriptor.role())
            .push(descriptor.clone());
        Registration {
            descriptor,
            inserted: true,
        }
    }

    pub async fn unregister(&self, conn_id: &str) -> Result<EndpointDescriptor, RegistryError> {
        let mut rosters = self.rosters.lock().await;
        let (role, index) = rosters
            .position(conn_id)
            .ok_or_else(|| RegistryError::NotFound(conn_id.to_string()))?;
        Ok(rosters.collection_mut(role).remove(index))
    }

    /// Insertion-ordered copy of one role's members.
    pub async fn snapshot(&self, role: Role) -> Vec<EndpointDescriptor> {
        self.rosters.lock().await.collection(role).clone()
    }

    pub async fn lookup(&self, conn_id: &str) -> Option<EndpointDescriptor> {
        let rosters = self.rosters.lock().await;
        rosters
            .position(conn_id)
            .map(|(role, index)| rosters.collection(role)[index].clone())
    }

    pub async fn len(&self, role: Role) -> usize {
        self.rosters.lock().await.collection(role).len()
    }
}
