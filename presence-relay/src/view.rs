use crate::{
    descriptor::{EndpointDescriptor, Role},
    reconciler::{Mirror, Sender, ViewEvent},
};

/// Terminal line for a view event. `Reset` has nothing to show in a
/// scrolling log, so it renders as `None`.
pub fn render_event(event: &ViewEvent) -> Option<String> {
    match event {
        ViewEvent::Reset => None,
        ViewEvent::Arrived { role, descriptor } => {
            Some(format!("*** {role} {} is online", label(descriptor)))
        }
        ViewEvent::Departed { role, descriptor } => {
            Some(format!("*** {role} {} went offline", label(descriptor)))
        }
        ViewEvent::Message { sender, text } => Some(format!("<{}> {text}", render_sender(sender))),
        ViewEvent::Pong { sender, nonce } => {
            Some(format!("*** pong {nonce} from {}", render_sender(sender)))
        }
    }
}

pub fn render_sender(sender: &Sender) -> String {
    match sender {
        Sender::Resolved { name, role } => format!("{role} {name}"),
        Sender::Unresolved { conn_id } => conn_id.clone(),
    }
}

/// One line per role listing who is online.
pub fn render_roster(mirror: &Mirror) -> Vec<String> {
    Role::ALL
        .into_iter()
        .map(|role| {
            let members = mirror.members(role);
            if members.is_empty() {
                format!("*** {role}s online: none")
            } else {
                let names: Vec<_> = members.iter().map(label).collect();
                format!("*** {role}s online: {}", names.join(", "))
            }
        })
        .collect()
}

fn label(descriptor: &EndpointDescriptor) -> String {
    format!("{} ({})", descriptor.name, descriptor.conn_id)
}
