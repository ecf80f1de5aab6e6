//! Presence relay: Service and Client endpoints discover each other and
//! exchange messages through a central broker.
//!
//! - [`descriptor`] is the self-declared identity of an endpoint.
//! - [`envelope`] defines the tagged message unit and its wire record.
//! - [`registry`] is the broker's authoritative set of connected endpoints.
//! - [`groups`] holds per-connection outboxes grouped by role.
//! - [`presence`] announces arrivals and departures and answers roster
//!   queries.
//! - [`router`] delivers Text and Command envelopes to one connection or to
//!   everyone.
//! - [`hub`] ties the above together for the broker's connection tasks.
//! - [`broker`] accepts TCP connections and runs one session per endpoint.
//! - [`reconciler`] keeps an endpoint's mirror of the registry in sync.
//! - [`endpoint`] connects to a broker and drives the reconciler from the
//!   terminal; [`view`] renders what it sees.
//! - [`message`] is the JSON line protocol; [`cli`] parses the command line.

pub mod broker;
pub mod cli;
pub mod descriptor;
pub mod endpoint;
pub mod envelope;
pub mod groups;
pub mod hub;
pub mod message;
pub mod presence;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod view;
