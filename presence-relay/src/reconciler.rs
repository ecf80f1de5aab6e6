//! Endpoint-side presence reconciliation.
//!
//! The [`Reconciler`] owns the endpoint's [`Mirror`] of the broker registry
//! and turns every inbound envelope into view events plus any frames that
//! must go back to the broker. It is driven from a single task, so its state
//! needs no locking.

use thiserror::Error;
use tracing::debug;

use crate::{
    descriptor::{ConnId, EndpointDescriptor, Role},
    envelope::{Body, Command, Envelope, LineState, Route},
    message::ClientToServer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Local, eventually consistent copy of the broker's registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mirror {
    services: Vec<EndpointDescriptor>,
    clients: Vec<EndpointDescriptor>,
}

impl Mirror {
    pub fn services(&self) -> &[EndpointDescriptor] {
        &self.services
    }

    pub fn clients(&self) -> &[EndpointDescriptor] {
        &self.clients
    }

    pub fn members(&self, role: Role) -> &[EndpointDescriptor] {
        match role {
            Role::Service => &self.services,
            Role::Client => &self.clients,
        }
    }

    fn members_mut(&mut self, role: Role) -> &mut Vec<EndpointDescriptor> {
        match role {
            Role::Service => &mut self.services,
            Role::Client => &mut self.clients,
        }
    }

    /// Inserts unless the identity is already known for that role.
    fn insert(&mut self, descriptor: EndpointDescriptor) -> bool {
        let members = self.members_mut(descriptor.role());
        if members.iter().any(|entry| entry.conn_id == descriptor.conn_id) {
            return false;
        }
        members.push(descriptor);
        true
    }

    fn remove(&mut self, role: Role, conn_id: &str) -> Option<EndpointDescriptor> {
        let members = self.members_mut(role);
        let index = members.iter().position(|entry| entry.conn_id == conn_id)?;
        Some(members.remove(index))
    }

    /// Looks `conn_id` up across both roles.
    pub fn find(&self, conn_id: &str) -> Option<&EndpointDescriptor> {
        self.services
            .iter()
            .chain(self.clients.iter())
            .find(|entry| entry.conn_id == conn_id)
    }

    fn clear(&mut self) {
        self.services.clear();
        self.clients.clear();
    }
}

/// Who sent a message, as far as the mirror can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sender {
    Resolved { name: String, role: Role },
    /// Not in the mirror (yet); only the raw connection identity is known.
    Unresolved { conn_id: ConnId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    /// The mirror was emptied; views should drop everything they show.
    Reset,
    Arrived {
        role: Role,
        descriptor: EndpointDescriptor,
    },
    Departed {
        role: Role,
        descriptor: EndpointDescriptor,
    },
    Message {
        sender: Sender,
        text: String,
    },
    Pong {
        sender: Sender,
        nonce: u64,
    },
}

/// View updates and broker-bound frames produced by one input.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reaction {
    pub events: Vec<ViewEvent>,
    pub outgoing: Vec<ClientToServer>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("departure for {0}, which is not in the mirror")]
    UnknownDeparture(ConnId),
}

#[derive(Debug)]
pub struct Reconciler {
    state: ConnectionState,
    conn_id: Option<ConnId>,
    mirror: Mirror,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            conn_id: None,
            mirror: Mirror::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn conn_id(&self) -> Option<&str> {
        self.conn_id.as_deref()
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn begin_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Full resync: empty the mirror and ask the broker for both rosters.
    pub fn on_connected(&mut self, conn_id: ConnId) -> Reaction {
        self.state = ConnectionState::Connected;
        self.conn_id = Some(conn_id);
        self.mirror.clear();

        Reaction {
            events: vec![ViewEvent::Reset],
            outgoing: vec![
                ClientToServer::GetOnlineServices,
                ClientToServer::GetOnlineClients,
            ],
        }
    }

    pub fn on_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.conn_id = None;
    }

    pub fn apply(&mut self, envelope: Envelope) -> Result<Reaction, ReconcileError> {
        if self.state != ConnectionState::Connected {
            debug!(state = ?self.state, "ignoring envelope while not connected");
            return Ok(Reaction::default());
        }

        match envelope.body {
            Body::LineState(line_state) if envelope.is_success => Ok(self.merge(line_state)),
            Body::LineState(line_state) => self.depart(&envelope.from, line_state),
            Body::Text { message } => Ok(Reaction {
                events: vec![ViewEvent::Message {
                    sender: self.resolve(&envelope.from),
                    text: message,
                }],
                outgoing: Vec::new(),
            }),
            Body::Command(command) => Ok(self.handle_command(&envelope.from, command)),
        }
    }

    fn merge(&mut self, line_state: LineState) -> Reaction {
        let descriptors = match line_state {
            LineState::Single(descriptor) => vec![descriptor],
            LineState::Bulk(descriptors) => descriptors,
        };

        let events = descriptors
            .into_iter()
            .filter_map(|descriptor| {
                let role = descriptor.role();
                self.mirror
                    .insert(descriptor.clone())
                    .then_some(ViewEvent::Arrived { role, descriptor })
            })
            .collect();

        Reaction {
            events,
            outgoing: Vec::new(),
        }
    }

    // The departing identity is the envelope sender; the descriptor only tells us its role.
    fn depart(&mut self, from: &str, line_state: LineState) -> Result<Reaction, ReconcileError> {
        let roles: Vec<Role> = match &line_state {
            LineState::Single(descriptor) => vec![descriptor.role()],
            LineState::Bulk(descriptors) => descriptors.iter().map(|d| d.role()).collect(),
        };

        let removed = roles
            .into_iter()
            .find_map(|role| self.mirror.remove(role, from))
            .ok_or_else(|| ReconcileError::UnknownDeparture(from.to_string()))?;

        Ok(Reaction {
            events: vec![ViewEvent::Departed {
                role: removed.role(),
                descriptor: removed,
            }],
            outgoing: Vec::new(),
        })
    }

    fn handle_command(&self, from: &str, command: Command) -> Reaction {
        match command {
            Command::Ping { nonce } => {
                let reply = Envelope::command(
                    self.conn_id.clone().unwrap_or_default(),
                    Route::Direct(from.to_string()),
                    Command::Pong { nonce },
                );
                Reaction {
                    events: Vec::new(),
                    outgoing: vec![ClientToServer::SendMessage { envelope: reply }],
                }
            }
            Command::Pong { nonce } => Reaction {
                events: vec![ViewEvent::Pong {
                    sender: self.resolve(from),
                    nonce,
                }],
                outgoing: Vec::new(),
            },
        }
    }

    pub fn resolve(&self, conn_id: &str) -> Sender {
        match self.mirror.find(conn_id) {
            Some(descriptor) => Sender::Resolved {
                name: descriptor.name.clone(),
                role: descriptor.role(),
            },
            None => Sender::Unresolved {
                conn_id: conn_id.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, role: Role, conn_id: &str) -> EndpointDescriptor {
        EndpointDescriptor::new(name, role).with_conn_id(conn_id)
    }

    fn connected() -> Reconciler {
        let mut reconciler = Reconciler::new();
        reconciler.begin_connecting();
        reconciler.on_connected("me".into());
        reconciler
    }

    #[test]
    fn connecting_clears_mirror_and_queries_both_rosters() {
        let mut reconciler = connected();
        reconciler
            .apply(Envelope::online(descriptor("svc", Role::Service, "s1")))
            .unwrap();

        let reaction = reconciler.on_connected("me-again".into());

        assert_eq!(reconciler.state(), ConnectionState::Connected);
        assert_eq!(reconciler.conn_id(), Some("me-again"));
        assert_eq!(reconciler.mirror(), &Mirror::default());
        assert_eq!(reaction.events, vec![ViewEvent::Reset]);
        assert_eq!(
            reaction.outgoing,
            vec![
                ClientToServer::GetOnlineServices,
                ClientToServer::GetOnlineClients
            ]
        );
    }

    #[test]
    fn bulk_with_two_services_leaves_clients_unchanged() {
        let mut reconciler = connected();
        reconciler
            .apply(Envelope::online(descriptor("cli", Role::Client, "c1")))
            .unwrap();
        let clients_before = reconciler.mirror().clients().to_vec();

        let s1 = descriptor("alpha", Role::Service, "s1");
        let s2 = descriptor("beta", Role::Service, "s2");
        let reaction = reconciler
            .apply(Envelope::roster("me", vec![s1.clone(), s2.clone()]))
            .unwrap();

        assert_eq!(reconciler.mirror().services(), &[s1, s2]);
        assert_eq!(reconciler.mirror().clients(), clients_before.as_slice());
        assert_eq!(reaction.events.len(), 2);
    }

    #[test]
    fn bulk_merge_is_idempotent() {
        let mut reconciler = connected();
        let s1 = descriptor("alpha", Role::Service, "s1");
        reconciler.apply(Envelope::online(s1.clone())).unwrap();

        let reaction = reconciler
            .apply(Envelope::roster("me", vec![s1.clone()]))
            .unwrap();

        assert!(reaction.events.is_empty());
        assert_eq!(reconciler.mirror().services(), &[s1]);
    }

    #[test]
    fn single_arrival_notifies_once() {
        let mut reconciler = connected();
        let c1 = descriptor("cli", Role::Client, "c1");

        let first = reconciler.apply(Envelope::online(c1.clone())).unwrap();
        let second = reconciler.apply(Envelope::online(c1.clone())).unwrap();

        assert_eq!(
            first.events,
            vec![ViewEvent::Arrived {
                role: Role::Client,
                descriptor: c1
            }]
        );
        assert!(second.events.is_empty());
    }

    #[test]
    fn departure_removes_by_sender_identity() {
        let mut reconciler = connected();
        let s1 = descriptor("alpha", Role::Service, "s1");
        reconciler.apply(Envelope::online(s1.clone())).unwrap();

        let reaction = reconciler.apply(Envelope::offline(s1.clone())).unwrap();

        assert!(reconciler.mirror().services().is_empty());
        assert_eq!(
            reaction.events,
            vec![ViewEvent::Departed {
                role: Role::Service,
                descriptor: s1
            }]
        );
    }

    #[test]
    fn departure_of_unknown_identity_is_an_error() {
        let mut reconciler = connected();
        let result = reconciler.apply(Envelope::offline(descriptor("x", Role::Client, "c9")));
        assert_eq!(result, Err(ReconcileError::UnknownDeparture("c9".into())));
    }

    #[test]
    fn text_sender_is_resolved_from_either_role() {
        let mut reconciler = connected();
        reconciler
            .apply(Envelope::online(descriptor("alpha", Role::Service, "s1")))
            .unwrap();

        let reaction = reconciler
            .apply(Envelope::text("s1", Route::Broadcast, "hello"))
            .unwrap();

        assert_eq!(
            reaction.events,
            vec![ViewEvent::Message {
                sender: Sender::Resolved {
                    name: "alpha".into(),
                    role: Role::Service
                },
                text: "hello".into()
            }]
        );
    }

    #[test]
    fn unknown_text_sender_degrades_to_raw_identity() {
        let mut reconciler = connected();
        let reaction = reconciler
            .apply(Envelope::text("zzz", Route::Broadcast, "boo"))
            .unwrap();

        assert_eq!(
            reaction.events,
            vec![ViewEvent::Message {
                sender: Sender::Unresolved {
                    conn_id: "zzz".into()
                },
                text: "boo".into()
            }]
        );
    }

    #[test]
    fn ping_is_answered_with_a_directed_pong() {
        let mut reconciler = connected();
        let reaction = reconciler
            .apply(Envelope::command(
                "s1",
                Route::Direct("me".into()),
                Command::Ping { nonce: 42 },
            ))
            .unwrap();

        let [ClientToServer::SendMessage { envelope }] = reaction.outgoing.as_slice() else {
            panic!("expected one reply, got {:?}", reaction.outgoing);
        };
        assert_eq!(envelope.from, "me");
        assert_eq!(envelope.route, Route::Direct("s1".into()));
        assert_eq!(envelope.body, Body::Command(Command::Pong { nonce: 42 }));
    }

    #[test]
    fn envelopes_are_ignored_until_connected() {
        let mut reconciler = Reconciler::new();
        reconciler.begin_connecting();

        let reaction = reconciler
            .apply(Envelope::online(descriptor("alpha", Role::Service, "s1")))
            .unwrap();

        assert_eq!(reaction, Reaction::default());
        assert!(reconciler.mirror().services().is_empty());
    }

    #[test]
    fn disconnect_keeps_mirror_until_next_resync() {
        let mut reconciler = connected();
        reconciler
            .apply(Envelope::online(descriptor("alpha", Role::Service, "s1")))
            .unwrap();

        reconciler.on_disconnected();

        assert_eq!(reconciler.state(), ConnectionState::Disconnected);
        assert_eq!(reconciler.conn_id(), None);
        assert_eq!(reconciler.mirror().services().len(), 1);
    }
}
