//! A reliable, ordered, congestion-aware transport over UDP, wire-compatible with the
//!  RakNet family of game-networking protocols, plus a transparent relay that bridges
//!  two connections.
//!
//! ## Design goals
//!
//! * Reliability is opt-in per message: every send chooses one of five delivery
//!   guarantees, and the cost of ordering or retransmission is paid only where the
//!   application asked for it
//!   * `unreliable`: fire and forget
//!   * `unreliable sequenced`: deliver immediately, drop anything older than the
//!     newest already seen - freshness over completeness, for state snapshots
//!   * `reliable`: retransmitted until acknowledged, no ordering
//!   * `reliable ordered`: buffered until contiguous, delivered in send order -
//!     completeness over latency
//!   * `reliable sequenced`: retransmitted, but stale messages are still dropped
//! * Up to 32 independent ordering channels per peer, so unrelated message streams
//!   do not stall each other
//! * Messages bigger than the UDP payload budget are fragmented and reassembled
//!   transparently; the budget is configured rather than discovered, since path MTU
//!   discovery does not work reliably
//! * Loss detection is primarily NACK-driven: a receiver that sees a gap in datagram
//!   sequence numbers asks for exactly the missing datagrams after a short grace
//!   period, with ACK-timeout retransmission as the safety net
//! * The retransmission timeout adapts to the measured round trip time
//!   (`SRTT + 4 * RTTVAR`, clamped), so retransmission is neither trigger-happy under
//!   normal jitter nor sluggish on a quiet link
//! * There is no connection handshake on the wire: a session is established by the
//!   first traffic in each direction
//! * All per-peer buffering is bounded - reassembly, ordering windows and the send
//!   queue; a peer that exceeds a bound is disconnected rather than allowed to grow
//!   local state without limit, since UDP offers no transport-level backpressure
//!
//! ## Wire format
//!
//! All numbers are little-endian; sequence numbers are 24 bits wide and wrap, and all
//!  comparisons on them are wrap-aware.
//!
//! Datagram header:
//! ```ascii
//! 0: flags (u8):
//!     0x80 valid - always set, datagrams without it are dropped
//!     0x40 contains an ACK block
//!     0x20 contains a NACK block
//!     0x08 is a retransmission
//! 1: datagram sequence number (u24) - data datagrams only
//! *: frames until the end of the datagram
//! ```
//!
//! ACK and NACK datagrams carry a range block instead of a sequence number:
//! ```ascii
//! 0: number of ranges (u16)
//! *: (repeated) form byte - 0x01: single sequence number (u24) follows,
//!     0x00: inclusive (start, end) pair of u24 follows
//! ```
//!
//! Frame (encapsulated message) header:
//! ```ascii
//! 0: reliability mode (bits 5-7), 0x08: delivery receipt requested
//! 1: payload length in bits (u16)
//! 3: reliable message index (u24) - reliable modes only
//! *: sequenced index (u24), ordered index (u24), ordering channel (u8)
//!     - ordered/sequenced modes only
//! *: split flag (u8); if set: fragment count (u16), split id (u16), fragment index (u16)
//! *: payload
//! ```
//!
//! ## Concurrency model
//!
//! All state for one peer lives in its [`session::Session`] behind a single lock, so
//!  every mutation of reliability, ordering and reassembly state is serialized: the
//!  endpoint's receive loop, the session's housekeeping loop and API callers take
//!  turns, and no per-connection state needs finer-grained synchronization. Sessions
//!  interact with each other only through messages - the relay forwards between its
//!  two legs via the destination session's API, never by sharing state.
//!
//! ## Related:
//! * ENet - same niche, 8-bit sequence-number channels, peer-level flow control
//! * QUIC - connection handshake, mandatory TLS, stream abstraction rather than
//!   messages, focus on large transfers
//! * SCTP - message-oriented multi-streaming, but kernel-level and TCP-like congestion
//!   control

pub mod config;
pub mod congestion;
pub mod disconnect;
pub mod end_point;
pub mod message_dispatcher;
pub mod ordering;
pub mod relay;
pub mod reliability;
pub mod send_pipeline;
pub mod seq;
pub mod session;
pub mod slot_ring;
pub mod split;
pub mod weighted_queue;
pub mod wire;
