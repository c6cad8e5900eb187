use std::time::Duration;

use anyhow::bail;

/// Number of independent ordering / sequencing channels per peer, fixed by the
///  protocol. Channel ids on the send side are taken modulo this.
pub const NUM_ORDERING_CHANNELS: u8 = 32;

#[derive(Clone, Debug)]
pub struct RakUdpConfig {
    /// This is the UDP payload size the protocol assumes end-to-end: datagrams are
    ///  never bigger than this, and messages that do not fit are split into fragments
    ///  that do.
    ///
    /// In an ideal world, we would discover the path MTU, but there is some uncertainty
    ///  involved (e.g. optional IP headers that may be introduced by some network
    ///  hardware), so the responsibility for choosing a size that all routes support
    ///  is left with the application.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`
    ///  for IPV4. Choosing this value too big causes datagrams to be silently dropped
    ///  by the network; choosing it too small wastes bandwidth on header overhead.
    pub payload_size_inside_udp: usize,

    /// Interval of the per-peer housekeeping loop that drives retransmission and
    ///  NACK emission. Retransmission timing granularity is bounded by this.
    pub tick_interval: Duration,

    /// A peer that has not sent anything for this long is considered dead and its
    ///  session is closed with `DisconnectReason::TimedOut`.
    pub idle_timeout: Duration,

    /// Outbound messages that cannot be sent right away wait in the per-peer weighted
    ///  send queue. If the queue grows beyond this many messages the session is closed
    ///  with `DisconnectReason::QueueTooLong` - a peer that slow is not worth buffering
    ///  unbounded amounts of memory for.
    pub max_send_queue_len: usize,

    /// Upper bound on concurrently reassembling split messages per peer. A peer that
    ///  exceeds it is disconnected with `DisconnectReason::BadPacket`.
    pub max_outstanding_splits: usize,

    /// Upper bound on the number of fragments a single split message may declare.
    ///  Together with `payload_size_inside_udp` this bounds the size of a reassembled
    ///  message. A fragment count above this closes the session with
    ///  `DisconnectReason::BadPacket`.
    pub max_fragment_count: usize,

    /// Number of out-of-order messages buffered per ordering channel while waiting
    ///  for a gap to fill. An ordered message further ahead than this closes the
    ///  session with `DisconnectReason::BadPacket`.
    pub ordering_window_size: usize,

    /// Size of the ring tracking unacknowledged sent datagrams, and of the receive-side
    ///  duplicate detection window. Rounded up to a power of two.
    pub reliability_window_size: usize,

    /// Retransmission timeout bounds - the RTT estimator's result is clamped into
    ///  this range.
    pub min_rto: Duration,
    pub max_rto: Duration,

    /// A reliable datagram is retransmitted at most this many times before the
    ///  session is closed with `DisconnectReason::TimedOut`.
    pub max_resends: u32,

    /// Accepting side only: maximum number of concurrently connected peers. Further
    ///  connection attempts are rejected with `DisconnectReason::NoFreeIncomingConnections`.
    pub max_incoming_connections: usize,

    /// Accepting side only: minimum time between two connection attempts from the
    ///  same IP address. Attempts inside the window are rejected with
    ///  `DisconnectReason::IpRecentlyConnected`. `None` disables the check.
    pub incoming_connection_cooldown: Option<Duration>,
}

impl RakUdpConfig {
    /// defaults for ipv4 with end-to-end full Ethernet MTU, no optional headers
    pub fn default_ipv4() -> RakUdpConfig {
        RakUdpConfig {
            payload_size_inside_udp: 1472,
            tick_interval: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(10),
            max_send_queue_len: 1024,
            max_outstanding_splits: 64,
            max_fragment_count: 512,
            ordering_window_size: 512,
            reliability_window_size: 2048,
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_secs(2),
            max_resends: 12,
            max_incoming_connections: 1024,
            incoming_connection_cooldown: Some(Duration::from_millis(100)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload_size_inside_udp < 100 {
            bail!("UDP payload size is too small");
        }
        if self.max_fragment_count == 0 || self.max_fragment_count > u16::MAX as usize {
            bail!("max fragment count must fit the protocol's u16 fragment counter");
        }
        if self.max_outstanding_splits == 0 {
            bail!("at least one outstanding split must be allowed");
        }
        if self.reliability_window_size == 0 {
            bail!("reliability window must not be empty");
        }
        if self.min_rto > self.max_rto {
            bail!("min RTO exceeds max RTO");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        Ok(())
    }
}
