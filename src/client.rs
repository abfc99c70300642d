use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::channel::{Channel, ChannelState};
use crate::config::ClientConfig;
use crate::packet::Packet;

/// The client side: one private socket and one [`Channel`] per transfer,
///  reading the socket directly - no demultiplexing needed, unlike on the
///  server.
///
/// Operations report the transfer's terminal [`ChannelState`]: an error
///  reported by the peer (e.g. file not found) finishes the transfer as
///  `Failed` without being an `Err` of its own.
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Client> {
        config.validate()?;
        Ok(Client { config })
    }

    /// Requests `remote_name` from the server and writes its chunks to
    ///  `sink`.
    pub async fn get_into(&self, remote_name: &str, sink: &mut (impl AsyncWrite + Unpin)) -> anyhow::Result<ChannelState> {
        let (socket, mut channel) = self.connect().await?;
        self.send_request(&socket, Packet::ReadRequest { file_name: remote_name.to_string() }).await?;

        channel.receive_file(sink).await?;
        Ok(channel.state())
    }

    /// Requests `remote_name` from the server into a local file.
    pub async fn get_file(&self, remote_name: &str, local_path: impl AsRef<Path>) -> anyhow::Result<ChannelState> {
        let mut file = File::create(local_path.as_ref()).await?;
        self.get_into(remote_name, &mut file).await
    }

    /// Announces a write of `remote_name`, waits for the server's ack #0, and
    ///  sends the source's chunks.
    pub async fn send_from(&self, source: &mut (impl AsyncRead + Unpin), remote_name: &str) -> anyhow::Result<ChannelState> {
        let (socket, mut channel) = self.connect().await?;
        self.send_request(&socket, Packet::WriteRequest { file_name: remote_name.to_string() }).await?;

        channel.await_first_ack().await?;
        channel.send_file(source).await?;
        Ok(channel.state())
    }

    /// Sends a local file to the server as `remote_name`.
    pub async fn send_file(&self, local_path: impl AsRef<Path>, remote_name: &str) -> anyhow::Result<ChannelState> {
        let mut file = File::open(local_path.as_ref()).await?;
        self.send_from(&mut file, remote_name).await
    }

    async fn connect(&self) -> anyhow::Result<(Arc<UdpSocket>, Channel)> {
        let socket = Arc::new(UdpSocket::bind(self.config.bind_addr).await?);
        debug!("bound client socket to {:?}", socket.local_addr()?);
        let channel = Channel::direct(self.config.server_addr, socket.clone(), self.config.recv_timeout);
        Ok((socket, channel))
    }

    async fn send_request(&self, socket: &UdpSocket, request: Packet) -> anyhow::Result<()> {
        debug!("sending {:?} to {:?}", request, self.config.server_addr);
        let mut buf = BytesMut::new();
        request.ser(&mut buf);
        socket.send_to(&buf, self.config.server_addr).await?;
        Ok(())
    }
}
