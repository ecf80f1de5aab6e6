use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::descriptor::Role;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay broker, tracking presence and routing envelopes.
    Broker(BrokerArgs),
    /// Connect to a broker as a Service or Client endpoint.
    Endpoint(EndpointArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8063")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct EndpointArgs {
    /// Address of the broker to connect to.
    #[arg(long, env = "PRESENCE_RELAY_SERVER", default_value = "127.0.0.1:8063")]
    pub server: SocketAddr,

    /// Role this endpoint declares when joining.
    #[arg(long, value_enum, env = "PRESENCE_RELAY_ROLE", default_value_t = Role::Client)]
    pub role: Role,

    /// Display name shown to peers. Defaults to the login user name.
    #[arg(long, env = "PRESENCE_RELAY_NAME")]
    pub name: Option<String>,
}
