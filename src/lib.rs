//! A minimal file-transfer protocol over UDP, in the TFTP family: a client
//!  asks a server to read or write a file, and the file moves in 512-byte
//!  chunks with every chunk acknowledged before the next one is sent
//!  (lockstep - at most one unacknowledged chunk in flight per transfer).
//!
//! ## Design
//!
//! * The server listens on a single UDP socket (port 9000 by default) that is
//!   shared by all transfers. A dispatch loop is the *only* reader of that
//!   socket: it decodes every inbound datagram once and routes it by the
//!   sender's address.
//! * A transfer is identified by the peer's `(host, port)` pair - its TID.
//!   At most one live transfer exists per TID at a time.
//! * Each accepted transfer runs on its own task, consuming packets from a
//!   private inbox that the dispatch loop feeds. Transfers are fully
//!   independent: a timeout or protocol violation kills exactly one transfer
//!   and leaves the dispatch loop and all other transfers untouched.
//! * Clients bind a private socket per transfer and read it directly - no
//!   demultiplexing is needed on their side.
//! * There is no retransmission: a missing ack or chunk is detected by a
//!   one-second receive deadline and is terminal for that transfer.
//!
//! ## Wire format
//!
//! Five packet kinds, all numbers in network byte order (BE). Byte 0 of every
//!  packet is unused and transmitted as zero; the opcode is byte 1.
//!
//! ```ascii
//! 1 RRQ:   00 01 00 | file name | 00 | "octet" | 00
//! 2 WRQ:   00 02 00 | file name | 00 | "octet" | 00
//! 3 DATA:  00 03 | block number (u16) | payload (0..=512 bytes)
//! 4 ACK:   00 04 | block number (u16)
//! 5 ERROR: 00 05 00 | error code (u8) | message | 00
//! ```
//!
//! A DATA payload shorter than 512 bytes (a zero-length payload included)
//!  marks the final chunk of its transfer - end-of-transfer is signalled
//!  structurally, there is no separate marker.
//!
//! Block numbers start at 1 for the first DATA/ACK exchange and wrap to 0
//!  after 65535. Block 0 is reserved for the ack that answers a write request
//!  before any data flows.
//!
//! Error codes: 0 = invalid/malformed packet, 1 = file not found.
//!
//! ## Conversations
//!
//! Reading a file:
//! ```ascii
//! client -> server   RRQ "a.bin"
//! server -> client   DATA #1 (512 bytes)
//! client -> server   ACK #1
//! server -> client   DATA #2 (37 bytes)     <- short: final chunk
//! client -> server   ACK #2
//! ```
//!
//! Writing a file:
//! ```ascii
//! client -> server   WRQ "b.bin"
//! server -> client   ACK #0
//! client -> server   DATA #1 (512 bytes)
//! server -> client   ACK #1
//! client -> server   DATA #2 (0 bytes)      <- empty final chunk
//! server -> client   ACK #2
//! ```

pub mod block_no;
pub mod channel;
pub mod client;
pub mod config;
pub mod packet;
pub mod server;
mod send_socket;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
