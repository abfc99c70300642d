use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

/// the well-known port servers listen on
pub const DEFAULT_SERVER_PORT: u16 = 9000;

/// How long any wait for an inbound packet may take before the transfer is
///  given up. The deadline is terminal - there is no retry budget behind it.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ServerConfig {
    /// the address of the shared socket that all transfers go through
    pub bind_addr: SocketAddr,

    /// Requested file names are resolved relative to this directory, for
    ///  reads and writes alike.
    pub base_dir: PathBuf,

    pub recv_timeout: Duration,
}

impl ServerConfig {
    /// listens on all interfaces on the well-known port, serving the working
    ///  directory
    pub fn on_default_port() -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)),
            base_dir: PathBuf::from("."),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_timeout.is_zero() {
            bail!("receive timeout must not be zero");
        }
        Ok(())
    }
}

pub struct ClientConfig {
    pub server_addr: SocketAddr,

    /// The address the per-transfer private socket is bound to. Port 0 picks
    ///  an ephemeral port per transfer, which is what distinguishes
    ///  concurrent transfers from the same host on the server side.
    pub bind_addr: SocketAddr,

    pub recv_timeout: Duration,
}

impl ClientConfig {
    pub fn for_server(server_addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            server_addr,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_timeout.is_zero() {
            bail!("receive timeout must not be zero");
        }
        if self.server_addr.port() == 0 {
            bail!("server address must have a concrete port");
        }
        Ok(())
    }
}
