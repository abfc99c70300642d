use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::fs::File;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::block_no::BlockNo;
use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::packet::{Packet, ERR_FILE_NOT_FOUND, ERR_INVALID_PACKET, MAX_PACKET_LEN};

/// The server: one shared socket, one dispatch loop, one task per transfer.
///
/// The dispatch loop is the *only* reader of the shared socket. It decodes
///  every inbound datagram exactly once and routes by the sender's address -
///  the TID: a request starts a new transfer task, anything else is handed to
///  the matching transfer's private inbox. Transfer tasks send their replies
///  through the shared socket concurrently but never read it, so there is no
///  read race to arbitrate.
pub struct Server {
    socket: Arc<UdpSocket>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Server> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("bound server socket to {:?}", socket.local_addr()?);
        Ok(Server {
            socket,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The dispatch loop - runs until the task is dropped.
    ///
    /// The session table lives on this task's stack and is touched by nobody
    ///  else. Entries are never reclaimed: a finished transfer leaves its
    ///  entry behind, and forwarding to it simply finds the inbox closed. A
    ///  fresh request from the same TID replaces the entry.
    pub async fn run(&self) {
        info!("starting dispatch loop");

        let mut sessions: FxHashMap<SocketAddr, mpsc::UnboundedSender<Packet>> = FxHashMap::default();

        let mut buf = [0u8; MAX_PACKET_LEN];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let packet = match Packet::deser(&buf[..num_read]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("malformed packet from {}: {}", from, e);
                    Channel::direct(from, self.socket.clone(), self.config.recv_timeout)
                        .send_error(ERR_INVALID_PACKET, "Invalid packet")
                        .await;
                    continue;
                }
            };

            match packet {
                Packet::ReadRequest { file_name } => self.start_read(&mut sessions, from, file_name),
                Packet::WriteRequest { file_name } => self.start_write(&mut sessions, from, file_name).await,
                other => match sessions.get(&from) {
                    Some(enqueue) => {
                        if enqueue.send(other).is_err() {
                            debug!("transfer for {} is finished - dropping packet", from);
                        }
                    }
                    None => warn!("unknown client: {}", from),
                },
            }
        }
    }

    fn start_read(
        &self,
        sessions: &mut FxHashMap<SocketAddr, mpsc::UnboundedSender<Packet>>,
        from: SocketAddr,
        file_name: String,
    ) {
        debug!("read request for {:?} from {}", file_name, from);

        let (mut channel, enqueue) = Channel::with_inbox(from, Arc::new(self.socket.clone()), self.config.recv_timeout);
        sessions.insert(from, enqueue);

        let path = self.config.base_dir.join(&file_name);
        tokio::spawn(
            async move {
                match File::open(&path).await {
                    Ok(mut file) => {
                        if let Err(e) = channel.send_file(&mut file).await {
                            warn!("sending {:?} failed: {}", path, e);
                        }
                    }
                    Err(e) => {
                        debug!("could not open {:?}: {}", path, e);
                        channel.send_error(ERR_FILE_NOT_FOUND, &e.to_string()).await;
                    }
                }
            }
            .instrument(info_span!("send_file", peer = %from)),
        );
    }

    async fn start_write(
        &self,
        sessions: &mut FxHashMap<SocketAddr, mpsc::UnboundedSender<Packet>>,
        from: SocketAddr,
        file_name: String,
    ) {
        debug!("write request for {:?} from {}", file_name, from);

        let (mut channel, enqueue) = Channel::with_inbox(from, Arc::new(self.socket.clone()), self.config.recv_timeout);
        sessions.insert(from, enqueue);

        if let Err(e) = channel.send_ack(BlockNo::ZERO).await {
            // the session entry registered above stays behind; nothing will
            //  drain its inbox until the peer sends a fresh request
            warn!("could not send ack for write request from {}: {}", from, e);
            return;
        }

        let path = self.config.base_dir.join(&file_name);
        tokio::spawn(
            async move {
                let mut file = match File::create(&path).await {
                    Ok(file) => file,
                    Err(e) => {
                        error!("could not create {:?}: {}", path, e);
                        return;
                    }
                };
                if let Err(e) = channel.receive_file(&mut file).await {
                    warn!("receiving {:?} failed: {}", path, e);
                }
            }
            .instrument(info_span!("receive_file", peer = %from)),
        );
    }
}
