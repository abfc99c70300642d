use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::block_no::BlockNo;
use crate::packet::{DecodeError, Packet, BLOCK_SIZE, ERR_INVALID_PACKET, MAX_PACKET_LEN};
use crate::send_socket::SendSocket;

/// Where a channel's inbound packets come from. Client-side channels own a
///  private socket and read it directly; server-side channels are fed decoded
///  packets by the dispatch loop, which is the only reader of the shared
///  socket.
enum PacketSource {
    Socket(Arc<UdpSocket>),
    Inbox(mpsc::UnboundedReceiver<Packet>),
}

/// Outcome of one blocking wait for the next inbound packet. The receive
///  deadline is an ordinary value here, not an unwound exception - every
///  caller decides for itself what a timeout means.
#[derive(Debug)]
enum RecvError {
    TimedOut,
    Closed,
    Malformed(DecodeError),
}

/// Lifecycle of one transfer. A channel starts out waiting (for the first ack
///  on the write side, for the first chunk on the read side) and ends up
///  either `Completed` or `Failed`; there is no recovery from `Failed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// write side: the request is out, the peer's ack #0 is not in yet
    AwaitingFirstAck,
    /// waiting for the ack matching the DATA packet just sent
    Sending(BlockNo),
    /// waiting for the next DATA packet
    Receiving(BlockNo),
    Completed,
    Failed,
}

/// One logical transfer: one file, one direction, one peer. The channel
///  drives the lockstep loop - send a chunk and block on its ack, or wait for
///  a chunk and ack it - until the short final chunk ends the transfer or a
///  timeout / protocol violation kills it.
///
/// Failures are fatal for this one transfer only, and nothing is ever
///  retried.
pub struct Channel {
    peer_addr: SocketAddr,
    send_socket: Arc<dyn SendSocket>,
    source: PacketSource,
    recv_timeout: Duration,
    state: ChannelState,
}

impl Channel {
    /// A client-side channel: it reads its private socket directly.
    pub fn direct(peer_addr: SocketAddr, socket: Arc<UdpSocket>, recv_timeout: Duration) -> Channel {
        Channel {
            peer_addr,
            send_socket: Arc::new(socket.clone()),
            source: PacketSource::Socket(socket),
            recv_timeout,
            state: ChannelState::Receiving(BlockNo::FIRST),
        }
    }

    /// A server-side channel consuming from a private inbox. Returns the
    ///  send-handle of that inbox for the dispatcher to feed - a strict
    ///  one-producer/one-consumer hand-off, enqueueing never blocks.
    pub(crate) fn with_inbox(
        peer_addr: SocketAddr,
        send_socket: Arc<dyn SendSocket>,
        recv_timeout: Duration,
    ) -> (Channel, mpsc::UnboundedSender<Packet>) {
        let (enqueue, inbox) = mpsc::unbounded_channel();
        let channel = Channel {
            peer_addr,
            send_socket,
            source: PacketSource::Inbox(inbox),
            recv_timeout,
            state: ChannelState::Receiving(BlockNo::FIRST),
        };
        (channel, enqueue)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Sends the source in lockstep: each chunk is filled to 512 bytes unless
    ///  the source is exhausted, sent once, and its matching ack awaited
    ///  before the next chunk goes out. A chunk shorter than 512 bytes
    ///  (possibly empty) is the final one, so a source whose length is an
    ///  exact multiple of 512 ends with an empty chunk.
    pub async fn send_file(&mut self, source: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<()> {
        match self.do_send_file(source).await {
            Ok(()) => {
                self.state = ChannelState::Completed;
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Failed;
                Err(e)
            }
        }
    }

    async fn do_send_file(&mut self, source: &mut (impl AsyncRead + Unpin)) -> anyhow::Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        let mut block_no = BlockNo::FIRST;
        loop {
            let size = read_chunk(source, &mut buf).await?;
            self.state = ChannelState::Sending(block_no);
            self.send_data(block_no, &buf[..size]).await?;
            self.await_ack(block_no).await?;

            if size < BLOCK_SIZE {
                return Ok(());
            }
            block_no = block_no.next();
        }
    }

    /// Receives a transfer into `sink`, acking every chunk; a chunk shorter
    ///  than 512 bytes completes the transfer. An error reported by the peer
    ///  finishes the loop without escalating - the terminal state is
    ///  `Failed`, but the call returns `Ok`.
    pub async fn receive_file(&mut self, sink: &mut (impl AsyncWrite + Unpin)) -> anyhow::Result<()> {
        match self.do_receive_file(sink).await {
            Ok(ReceiveEnd::Complete) => {
                self.state = ChannelState::Completed;
                Ok(())
            }
            Ok(ReceiveEnd::PeerError) => {
                self.state = ChannelState::Failed;
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Failed;
                Err(e)
            }
        }
    }

    async fn do_receive_file(&mut self, sink: &mut (impl AsyncWrite + Unpin)) -> anyhow::Result<ReceiveEnd> {
        loop {
            match self.recv_packet().await {
                Ok(Packet::Data { block_no, payload }) => {
                    trace!("received data #{} ({} bytes) from {:?}", block_no, payload.len(), self.peer_addr);
                    sink.write_all(&payload).await?;
                    self.send_ack(block_no).await?;

                    if payload.len() < BLOCK_SIZE {
                        sink.flush().await?;
                        return Ok(ReceiveEnd::Complete);
                    }
                    self.state = ChannelState::Receiving(block_no.next());
                }
                Ok(Packet::Error { code, message }) => {
                    warn!("peer {:?} reported error {}: {}", self.peer_addr, code, message);
                    return Ok(ReceiveEnd::PeerError);
                }
                Ok(other) => {
                    bail!("unexpected opcode {:?} from {:?} while receiving", other.opcode(), self.peer_addr);
                }
                Err(RecvError::TimedOut) => {
                    bail!("no data from {:?} within {:?}", self.peer_addr, self.recv_timeout);
                }
                Err(RecvError::Closed) => {
                    bail!("inbound path closed while receiving from {:?}", self.peer_addr);
                }
                Err(RecvError::Malformed(e)) => {
                    self.send_error(ERR_INVALID_PACKET, "Invalid packet").await;
                    bail!("malformed packet from {:?}: {}", self.peer_addr, e);
                }
            }
        }
    }

    /// Write side: the peer answers the initial request with ack #0 before
    ///  any data flows.
    pub async fn await_first_ack(&mut self) -> anyhow::Result<()> {
        self.state = ChannelState::AwaitingFirstAck;
        match self.await_ack(BlockNo::ZERO).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = ChannelState::Failed;
                Err(e)
            }
        }
    }

    /// Blocks until the ack matching `block_no` arrives. Anything else - a
    ///  timeout, a mismatched block number, a different opcode - fails the
    ///  transfer; the data packet is never re-sent.
    async fn await_ack(&mut self, block_no: BlockNo) -> anyhow::Result<()> {
        match self.recv_packet().await {
            Ok(Packet::Ack { block_no: acked }) if acked == block_no => {
                trace!("ack #{} received from {:?}", acked, self.peer_addr);
                Ok(())
            }
            Ok(Packet::Ack { block_no: acked }) => {
                bail!("expected ack #{} from {:?}, got ack #{}", block_no, self.peer_addr, acked);
            }
            Ok(other) => {
                bail!("unexpected opcode {:?} from {:?} while waiting for ack #{}", other.opcode(), self.peer_addr, block_no);
            }
            Err(RecvError::TimedOut) => {
                bail!("no ack #{} from {:?} within {:?}", block_no, self.peer_addr, self.recv_timeout);
            }
            Err(RecvError::Closed) => {
                bail!("inbound path closed while waiting for ack #{} from {:?}", block_no, self.peer_addr);
            }
            Err(RecvError::Malformed(e)) => {
                bail!("malformed packet from {:?} while waiting for ack #{}: {}", self.peer_addr, block_no, e);
            }
        }
    }

    pub async fn send_ack(&self, block_no: BlockNo) -> anyhow::Result<()> {
        trace!("sending ack #{} to {:?}", block_no, self.peer_addr);
        self.send_packet(&Packet::Ack { block_no }).await
    }

    pub async fn send_data(&self, block_no: BlockNo, payload: &[u8]) -> anyhow::Result<()> {
        trace!("sending data #{} ({} bytes) to {:?}", block_no, payload.len(), self.peer_addr);
        self.send_packet(&Packet::Data { block_no, payload: payload.to_vec() }).await
    }

    /// Best-effort: the transfer is already failing when an error report goes
    ///  out, so a transport failure here is logged and swallowed.
    pub async fn send_error(&self, code: u8, message: &str) {
        debug!("sending error {} ({:?}) to {:?}", code, message, self.peer_addr);
        if let Err(e) = self.send_packet(&Packet::Error { code, message: message.to_string() }).await {
            warn!("could not send error packet to {:?}: {}", self.peer_addr, e);
        }
    }

    async fn send_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_LEN);
        packet.ser(&mut buf);
        self.send_socket.send_packet(self.peer_addr, &buf).await
    }

    async fn recv_packet(&mut self) -> Result<Packet, RecvError> {
        match &mut self.source {
            PacketSource::Socket(socket) => {
                let mut buf = [0u8; MAX_PACKET_LEN];
                let (num_read, from) = match timeout(self.recv_timeout, socket.recv_from(&mut buf)).await {
                    Ok(Ok(x)) => x,
                    Ok(Err(e)) => {
                        warn!("socket error: {}", e);
                        return Err(RecvError::Closed);
                    }
                    Err(_) => return Err(RecvError::TimedOut),
                };
                trace!("received {} bytes from {:?}", num_read, from);
                Packet::deser(&buf[..num_read]).map_err(RecvError::Malformed)
            }
            PacketSource::Inbox(inbox) => match timeout(self.recv_timeout, inbox.recv()).await {
                Ok(Some(packet)) => Ok(packet),
                Ok(None) => Err(RecvError::Closed),
                Err(_) => Err(RecvError::TimedOut),
            },
        }
    }
}

enum ReceiveEnd {
    Complete,
    PeerError,
}

/// Fills `buf` from the source, stopping only at end-of-input: a short read
///  mid-stream must not end the transfer early, since a short *chunk* is the
///  end-of-transfer signal on the wire.
async fn read_chunk(source: &mut (impl AsyncRead + Unpin), buf: &mut [u8]) -> anyhow::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let num_read = source.read(&mut buf[filled..]).await?;
        if num_read == 0 {
            break;
        }
        filled += num_read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_socket::MockSendSocket;
    use mockall::Sequence;
    use rstest::rstest;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tokio::runtime::Builder;

    const TEST_TIMEOUT: Duration = Duration::from_millis(50);

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 6900))
    }

    /// a mock socket expecting exactly the given packets, in order
    fn expect_sent(expected: Vec<Packet>) -> MockSendSocket {
        let mut send_socket = MockSendSocket::new();
        let mut sequence = Sequence::new();
        for packet in expected {
            send_socket.expect_send_packet()
                .once()
                .in_sequence(&mut sequence)
                .withf(move |to, buf| *to == peer() && Packet::deser(buf) == Ok(packet.clone()))
                .returning(|_, _| Ok(()));
        }
        send_socket
    }

    fn inbox_channel(send_socket: MockSendSocket) -> (Channel, mpsc::UnboundedSender<Packet>) {
        Channel::with_inbox(peer(), Arc::new(send_socket), TEST_TIMEOUT)
    }

    fn ack(block: u16) -> Packet {
        Packet::Ack { block_no: BlockNo::from_raw(block) }
    }

    fn data(block: u16, payload: Vec<u8>) -> Packet {
        Packet::Data { block_no: BlockNo::from_raw(block), payload }
    }

    #[test]
    fn test_send_file_two_chunks() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let source: Vec<u8> = (0..700).map(|i| i as u8).collect();

            let send_socket = expect_sent(vec![
                data(1, source[..512].to_vec()),
                data(2, source[512..].to_vec()),
            ]);
            let (mut channel, enqueue) = inbox_channel(send_socket);
            enqueue.send(ack(1)).unwrap();
            enqueue.send(ack(2)).unwrap();

            channel.send_file(&mut &source[..]).await.unwrap();
            assert_eq!(channel.state(), ChannelState::Completed);
        });
    }

    #[test]
    fn test_send_file_empty_source() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let send_socket = expect_sent(vec![data(1, vec![])]);
            let (mut channel, enqueue) = inbox_channel(send_socket);
            enqueue.send(ack(1)).unwrap();

            channel.send_file(&mut &[][..]).await.unwrap();
            assert_eq!(channel.state(), ChannelState::Completed);
        });
    }

    /// a source of exactly N*512 bytes ends with an empty final chunk - the
    ///  receiver has no other way to see the end of the transfer
    #[test]
    fn test_send_file_exact_multiple_of_block_size() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let source = vec![42u8; 1024];

            let send_socket = expect_sent(vec![
                data(1, source[..512].to_vec()),
                data(2, source[512..].to_vec()),
                data(3, vec![]),
            ]);
            let (mut channel, enqueue) = inbox_channel(send_socket);
            for block in 1u16..=3 {
                enqueue.send(ack(block)).unwrap();
            }

            channel.send_file(&mut &source[..]).await.unwrap();
            assert_eq!(channel.state(), ChannelState::Completed);
        });
    }

    /// the ack for block 7 never arrives: the transfer fails after the
    ///  deadline, and block 7 is not re-sent (the mock would flag an eighth
    ///  send)
    #[test]
    fn test_send_file_ack_timeout_is_terminal_without_retransmission() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let source = vec![0u8; 512 * 6 + 10];

            let expected = (1u16..=7)
                .map(|block| {
                    let start = 512 * (block as usize - 1);
                    let end = (start + 512).min(source.len());
                    data(block, source[start..end].to_vec())
                })
                .collect();
            let send_socket = expect_sent(expected);
            let (mut channel, enqueue) = inbox_channel(send_socket);
            for block in 1u16..=6 {
                enqueue.send(ack(block)).unwrap();
            }

            let result = channel.send_file(&mut &source[..]).await;
            assert!(result.unwrap_err().to_string().contains("no ack #7"));
            assert_eq!(channel.state(), ChannelState::Failed);
        });
    }

    #[test]
    fn test_send_file_ack_block_mismatch() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let source = vec![1u8; 100];

            let send_socket = expect_sent(vec![data(1, source.clone())]);
            let (mut channel, enqueue) = inbox_channel(send_socket);
            enqueue.send(ack(2)).unwrap();

            let result = channel.send_file(&mut &source[..]).await;
            assert!(result.unwrap_err().to_string().contains("expected ack #1"));
            assert_eq!(channel.state(), ChannelState::Failed);
        });
    }

    #[test]
    fn test_send_file_unexpected_opcode_fails() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let source = vec![1u8; 100];

            let send_socket = expect_sent(vec![data(1, source.clone())]);
            let (mut channel, enqueue) = inbox_channel(send_socket);
            enqueue.send(data(1, vec![5])).unwrap();

            let result = channel.send_file(&mut &source[..]).await;
            assert!(result.unwrap_err().to_string().contains("unexpected opcode"));
            assert_eq!(channel.state(), ChannelState::Failed);
        });
    }

    /// payload lengths below 512 end the transfer right there
    #[rstest]
    #[case::empty(0)]
    #[case::one_byte(1)]
    #[case::almost_full(511)]
    fn test_receive_file_short_chunk_is_final(#[case] payload_len: usize) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();

            let send_socket = expect_sent(vec![ack(1)]);
            let (mut channel, enqueue) = inbox_channel(send_socket);
            enqueue.send(data(1, payload.clone())).unwrap();

            let mut sink = Cursor::new(Vec::new());
            channel.receive_file(&mut sink).await.unwrap();

            assert_eq!(sink.into_inner(), payload);
            assert_eq!(channel.state(), ChannelState::Completed);
        });
    }

    /// a full 512-byte chunk does not end the transfer - the next chunk does
    #[test]
    fn test_receive_file_full_then_short_chunk() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let first = vec![7u8; 512];
            let second = vec![9u8; 37];

            let send_socket = expect_sent(vec![ack(1), ack(2)]);
            let (mut channel, enqueue) = inbox_channel(send_socket);
            enqueue.send(data(1, first.clone())).unwrap();
            enqueue.send(data(2, second.clone())).unwrap();

            let mut sink = Cursor::new(Vec::new());
            channel.receive_file(&mut sink).await.unwrap();

            let written = sink.into_inner();
            assert_eq!(written.len(), 549);
            assert_eq!(&written[..512], &first[..]);
            assert_eq!(&written[512..], &second[..]);
            assert_eq!(channel.state(), ChannelState::Completed);
        });
    }

    /// nothing arrives: the transfer fails after the deadline without sending
    ///  anything (the mock has no expectations)
    #[test]
    fn test_receive_file_timeout_is_terminal() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut channel, _enqueue) = inbox_channel(MockSendSocket::new());

            let mut sink = Cursor::new(Vec::new());
            let result = channel.receive_file(&mut sink).await;
            assert!(result.unwrap_err().to_string().contains("no data"));
            assert_eq!(channel.state(), ChannelState::Failed);
        });
    }

    /// an error reported by the peer finishes the transfer without escalating
    #[test]
    fn test_receive_file_peer_error_finishes() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut channel, enqueue) = inbox_channel(MockSendSocket::new());
            enqueue.send(Packet::Error { code: 1, message: "no such file".to_string() }).unwrap();

            let mut sink = Cursor::new(Vec::new());
            channel.receive_file(&mut sink).await.unwrap();

            assert!(sink.into_inner().is_empty());
            assert_eq!(channel.state(), ChannelState::Failed);
        });
    }

    #[test]
    fn test_receive_file_unexpected_opcode_fails() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut channel, enqueue) = inbox_channel(MockSendSocket::new());
            enqueue.send(ack(1)).unwrap();

            let mut sink = Cursor::new(Vec::new());
            let result = channel.receive_file(&mut sink).await;
            assert!(result.unwrap_err().to_string().contains("unexpected opcode"));
            assert_eq!(channel.state(), ChannelState::Failed);
        });
    }

    #[test]
    fn test_receive_file_closed_inbox_fails() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut channel, enqueue) = inbox_channel(MockSendSocket::new());
            drop(enqueue);

            let mut sink = Cursor::new(Vec::new());
            let result = channel.receive_file(&mut sink).await;
            assert!(result.unwrap_err().to_string().contains("closed"));
            assert_eq!(channel.state(), ChannelState::Failed);
        });
    }

    #[test]
    fn test_await_first_ack() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut channel, enqueue) = inbox_channel(MockSendSocket::new());
            enqueue.send(ack(0)).unwrap();

            channel.await_first_ack().await.unwrap();
        });
    }

    #[test]
    fn test_await_first_ack_timeout() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut channel, _enqueue) = inbox_channel(MockSendSocket::new());

            let result = channel.await_first_ack().await;
            assert!(result.unwrap_err().to_string().contains("no ack #0"));
            assert_eq!(channel.state(), ChannelState::Failed);
        });
    }

    /// a transfer of exactly 512*65536 bytes cycles the block counter all the
    ///  way around: ..., 65535, 0, 1 - and the final (empty) chunk completes
    ///  the transfer on the recycled block number 1
    #[test]
    fn test_send_file_block_number_wraparound() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            const NUM_FULL_CHUNKS: usize = 65536;
            let source = vec![0u8; 512 * NUM_FULL_CHUNKS];

            let sent: Arc<Mutex<Vec<(u16, usize)>>> = Arc::new(Mutex::new(Vec::new()));
            let sent_recorder = sent.clone();

            let mut send_socket = MockSendSocket::new();
            send_socket.expect_send_packet()
                .times(NUM_FULL_CHUNKS + 1)
                .returning(move |_, buf| {
                    let block = u16::from_be_bytes([buf[2], buf[3]]);
                    sent_recorder.lock().unwrap().push((block, buf.len() - 4));
                    Ok(())
                });

            let (mut channel, enqueue) = inbox_channel(send_socket);
            for chunk in 1..=NUM_FULL_CHUNKS + 1 {
                enqueue.send(ack((chunk % 65536) as u16)).unwrap();
            }

            channel.send_file(&mut &source[..]).await.unwrap();
            assert_eq!(channel.state(), ChannelState::Completed);

            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), NUM_FULL_CHUNKS + 1);
            assert_eq!(sent[0], (1, 512));
            assert_eq!(sent[65534], (65535, 512));
            assert_eq!(sent[65535], (0, 512));
            assert_eq!(sent[65536], (1, 0));
        });
    }

    #[test]
    fn test_read_chunk_reassembles_short_reads() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            // single reads on a chained reader return less than a full chunk;
            //  the chunk must still come out full
            let mut source = tokio::io::AsyncReadExt::chain(&[1u8; 300][..], &[2u8; 300][..]);

            let mut buf = [0u8; BLOCK_SIZE];
            let size = read_chunk(&mut source, &mut buf).await.unwrap();
            assert_eq!(size, BLOCK_SIZE);
            assert_eq!(&buf[..300], &[1u8; 300][..]);
            assert_eq!(&buf[300..], &[2u8; 212][..]);

            let size = read_chunk(&mut source, &mut buf).await.unwrap();
            assert_eq!(size, 88);
            assert_eq!(&buf[..88], &[2u8; 88][..]);
        });
    }
}
