use std::{fmt, net::IpAddr};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sysinfo::{Networks, System};

/// Token the broker assigns to one connection for its whole lifetime.
pub type ConnId = String;

/// The two classes of endpoint. Each role is also the name of a broker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Role {
    Service,
    Client,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Service, Role::Client];

    pub fn is_service(self) -> bool {
        matches!(self, Role::Service)
    }

    pub fn group_name(self) -> &'static str {
        match self {
            Role::Service => "Service",
            Role::Client => "Client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.group_name())
    }
}

/// Self-declared identity of one endpoint.
///
/// The endpoint fills in everything except `conn_id` before connecting; the
/// broker finalizes the descriptor by assigning the connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    #[serde(default)]
    pub conn_id: ConnId,
    pub name: String,
    #[serde(default)]
    pub computer_name: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub mac_address: String,
    pub is_service: bool,
}

impl EndpointDescriptor {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            conn_id: ConnId::new(),
            name: name.into(),
            computer_name: String::new(),
            ip_address: String::new(),
            mac_address: String::new(),
            is_service: role.is_service(),
        }
    }

    /// Builds a descriptor for this machine. `local_ip` is the address the
    /// endpoint uses to reach the broker, which is the one peers care about.
    pub fn probe_local(name: impl Into<String>, role: Role, local_ip: IpAddr) -> Self {
        Self {
            computer_name: System::host_name().unwrap_or_default(),
            ip_address: local_ip.to_string(),
            mac_address: primary_mac_address().unwrap_or_default(),
            ..Self::new(name, role)
        }
    }

    pub fn role(&self) -> Role {
        if self.is_service {
            Role::Service
        } else {
            Role::Client
        }
    }

    pub fn with_conn_id(mut self, conn_id: impl Into<ConnId>) -> Self {
        self.conn_id = conn_id.into();
        self
    }
}

fn primary_mac_address() -> Option<String> {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<_> = networks.iter().collect();
    // Interface order from the OS is not stable; sort so the same NIC wins each run.
    interfaces.sort_by(|(a, _), (b, _)| a.cmp(b));
    interfaces
        .into_iter()
        .map(|(_, data)| data.mac_address())
        .find(|mac| !mac.is_unspecified())
        .map(|mac| mac.to_string())
}

/// Login name of the current user, used when no display name is configured.
pub fn login_user_name() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.is_empty()))
        .unwrap_or_else(|| "anonymous".to_string())
}
