use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::RakUdpConfig;
use crate::congestion::CongestionController;
use crate::disconnect::{ConnectionState, DisconnectReason};
use crate::seq::SequenceNumber;
use crate::slot_ring::SlotRing;
use crate::weighted_queue::WeightedQueue;
use crate::wire::{AckRanges, Datagram, Frame};

/// A missing datagram is NACKed once the gap has survived this many housekeeping ticks.
///  Each gap is NACKed at most once: if the NACK (or the resend it triggers) is lost
///  as well, the sender's retransmission timeout recovers the datagram.
const NACK_GRACE_TICKS: u64 = 2;

/// A sent-but-unacknowledged datagram. The serialized frame block is retained so a
///  retransmit does not re-encode anything; only the datagram header changes (the
///  RESEND flag, the sequence number stays).
struct SentDatagram {
    frame_bytes: Bytes,
    num_resends: u32,
    sent_at: Instant,
    /// receipt ids to confirm to the caller once this datagram is acknowledged
    receipt_ids: Vec<u64>,
    /// true if a retransmission candidate in the queue keeps this datagram alive
    reliable: bool,
}

/// Entry in the retransmission schedule. Cancellation on ACK is lazy: the entry stays
///  in the queue, and the generation check against the slot ring discards it on pop.
struct RetransmissionCandidate {
    sequence_number: SequenceNumber,
    generation: u32,
}

/// What a processed inbound datagram yields: the frames to hand on to reassembly and
///  ordering, or nothing for duplicates and ACK/NACK-only datagrams.
#[derive(Default, Debug)]
pub struct ReceiveOutcome {
    pub frames: Vec<Frame>,
    /// receipt ids confirmed by an ACK in this datagram
    pub ack_receipts: Vec<u64>,
    /// pre-serialized immediate retransmissions triggered by a NACK
    pub resend_datagrams: Vec<Bytes>,
}

/// Per-connection ARQ core: sequence number assignment, duplicate detection, ACK/NACK
///  bookkeeping and retransmission scheduling.
///
/// This is a pure state machine - it never touches a socket or a clock on its own.
///  The owning session feeds it inbound datagrams and periodic ticks and sends
///  whatever datagrams it returns. That keeps all mutation on the session's single
///  context and makes the whole ARQ logic testable with a fabricated clock.
pub struct ReliabilityStateMachine {
    state: ConnectionState,
    epoch: Instant,
    last_inbound: Instant,

    // send side
    next_datagram_seq: SequenceNumber,
    next_reliable_index: SequenceNumber,
    outstanding: SlotRing<SentDatagram>,
    num_outstanding: usize,
    retransmission_queue: WeightedQueue<RetransmissionCandidate>,

    // receive side
    received: SlotRing<()>,
    highest_received: Option<SequenceNumber>,
    pending_acks: Vec<SequenceNumber>,
    /// missing datagram sequence number -> tick at which to (re)send a NACK for it
    missing: FxHashMap<u32, u64>,
    tick_counter: u64,

    congestion: CongestionController,
    config: RakUdpConfig,
}

impl ReliabilityStateMachine {
    pub fn new(config: &RakUdpConfig, now: Instant) -> ReliabilityStateMachine {
        ReliabilityStateMachine {
            state: ConnectionState::Handshaking,
            epoch: now,
            last_inbound: now,
            next_datagram_seq: SequenceNumber::ZERO,
            next_reliable_index: SequenceNumber::ZERO,
            outstanding: SlotRing::new(config.reliability_window_size),
            num_outstanding: 0,
            retransmission_queue: WeightedQueue::new(),
            received: SlotRing::new(config.reliability_window_size),
            highest_received: None,
            pending_acks: Vec::new(),
            missing: FxHashMap::default(),
            tick_counter: 0,
            congestion: CongestionController::new(config),
            config: config.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn round_trip_time(&self) -> Duration {
        self.congestion.round_trip_time()
    }

    pub fn next_reliable_index(&mut self) -> SequenceNumber {
        self.next_reliable_index.fetch_next()
    }

    fn weight_of(&self, deadline: Instant) -> u64 {
        deadline.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Packs frames into as few datagrams as fit the UDP payload budget, assigns
    ///  sequence numbers and schedules retransmission for datagrams that carry
    ///  reliable frames. Returns the datagrams ready for the wire.
    ///
    /// Fails with `QueueTooLong` semantics (as an error the caller maps) when the
    ///  number of unacknowledged datagrams exceeds the configured bound.
    pub fn send_frames(
        &mut self,
        frames: Vec<Frame>,
        receipt_ids: Vec<u64>,
        now: Instant,
    ) -> Result<Vec<Datagram>, DisconnectReason> {
        let budget = self.config.payload_size_inside_udp - Datagram::HEADER_LEN;

        let mut datagrams = Vec::new();
        let mut cur: Vec<Frame> = Vec::new();
        let mut cur_len = 0;
        for frame in frames {
            if !cur.is_empty() && cur_len + frame.serialized_len() > budget {
                datagrams.push(self.finish_datagram(std::mem::take(&mut cur), Vec::new(), now)?);
                cur_len = 0;
            }
            cur_len += frame.serialized_len();
            cur.push(frame);
        }
        if !cur.is_empty() {
            datagrams.push(self.finish_datagram(cur, receipt_ids, now)?);
        }
        Ok(datagrams)
    }

    fn finish_datagram(
        &mut self,
        frames: Vec<Frame>,
        receipt_ids: Vec<u64>,
        now: Instant,
    ) -> Result<Datagram, DisconnectReason> {
        let sequence_number = self.next_datagram_seq.fetch_next();
        let reliable = frames.iter().any(|f| f.reliability.is_reliable());

        if reliable || !receipt_ids.is_empty() {
            if self.num_outstanding >= self.config.max_send_queue_len {
                warn!("{} unacknowledged datagrams, more than the configured bound", self.num_outstanding);
                return Err(DisconnectReason::QueueTooLong);
            }

            let mut frame_buf = BytesMut::new();
            for frame in &frames {
                frame.ser(&mut frame_buf);
            }

            let evicted = self.outstanding.set(sequence_number, SentDatagram {
                frame_bytes: frame_buf.freeze(),
                num_resends: 0,
                sent_at: now,
                receipt_ids,
                reliable,
            });
            if evicted.is_none() {
                self.num_outstanding += 1;
            }

            if reliable {
                let deadline = now + self.congestion.rto(0);
                self.retransmission_queue.insert(self.weight_of(deadline), RetransmissionCandidate {
                    sequence_number,
                    generation: 0,
                });
            }
        }

        Ok(Datagram::Data { is_resend: false, sequence_number, frames })
    }

    /// Processes one inbound datagram. Duplicates are dropped (after updating ACK
    ///  bookkeeping, the peer evidently missed our earlier ACK). The first inbound
    ///  traffic completes the handshake.
    pub fn on_datagram(&mut self, datagram: Datagram, now: Instant) -> Result<ReceiveOutcome, DisconnectReason> {
        self.last_inbound = now;
        if self.state == ConnectionState::Handshaking {
            debug!("first inbound traffic, connection established");
            self.state = ConnectionState::Connected;
        }

        match datagram {
            Datagram::Ack(ranges) => {
                let mut outcome = ReceiveOutcome::default();
                self.on_ack(&ranges, now, &mut outcome.ack_receipts);
                Ok(outcome)
            }
            Datagram::Nack(ranges) => {
                let mut outcome = ReceiveOutcome::default();
                outcome.resend_datagrams = self.on_nack(&ranges, now)?;
                Ok(outcome)
            }
            Datagram::Data { sequence_number, frames, .. } => {
                self.pending_acks.push(sequence_number);

                if self.received.get(sequence_number).is_some() {
                    trace!("duplicate datagram {}, re-acknowledging only", sequence_number);
                    return Ok(ReceiveOutcome::default());
                }
                self.received.set(sequence_number, ());
                self.missing.remove(&sequence_number.to_raw());

                // register the gap (if any) for NACK emission after the grace period
                match self.highest_received {
                    Some(highest) if sequence_number.is_newer_than(highest) => {
                        // the peer's outstanding datagrams are bounded by its send queue,
                        //  so a jump wider than the receive window cannot be legitimate
                        let jump = sequence_number.distance_after(highest);
                        if jump as usize > self.config.reliability_window_size {
                            warn!("datagram {} is {} ahead of {}, wider than the receive window",
                                sequence_number, jump, highest);
                            return Err(DisconnectReason::BadPacket);
                        }
                        let nack_at = self.tick_counter + NACK_GRACE_TICKS;
                        let mut gap = highest.next();
                        while gap != sequence_number {
                            self.missing.insert(gap.to_raw(), nack_at);
                            gap = gap.next();
                        }
                        self.highest_received = Some(sequence_number);
                    }
                    None => self.highest_received = Some(sequence_number),
                    _ => {}
                }

                Ok(ReceiveOutcome { frames, ..Default::default() })
            }
        }
    }

    fn on_ack(&mut self, ranges: &AckRanges, now: Instant, ack_receipts: &mut Vec<u64>) {
        for sequence_number in ranges.iter_covered() {
            let Some(sent) = self.outstanding.remove(sequence_number) else {
                continue;
            };
            self.num_outstanding -= 1;
            trace!("datagram {} acknowledged after {} resends", sequence_number, sent.num_resends);

            // Karn's algorithm: only never-retransmitted datagrams give an unambiguous
            //  RTT sample
            if sent.num_resends == 0 {
                self.congestion.on_rtt_sample(now.saturating_duration_since(sent.sent_at));
            }
            ack_receipts.extend(sent.receipt_ids);
        }
    }

    /// every NACKed reliable datagram still outstanding is resent immediately and
    ///  rescheduled; unreliable datagrams are tracked for receipt confirmation only
    fn on_nack(&mut self, ranges: &AckRanges, now: Instant) -> Result<Vec<Bytes>, DisconnectReason> {
        let mut resends = Vec::new();
        for sequence_number in ranges.iter_covered() {
            if self.outstanding.get(sequence_number).is_some_and(|sent| sent.reliable) {
                resends.push(self.resend(sequence_number, now)?);
            }
        }
        Ok(resends)
    }

    fn resend(&mut self, sequence_number: SequenceNumber, now: Instant) -> Result<Bytes, DisconnectReason> {
        let max_resends = self.config.max_resends;
        let sent = self.outstanding.get_mut(sequence_number)
            .expect("resend of a datagram that is not outstanding");

        sent.num_resends += 1;
        if sent.num_resends > max_resends {
            warn!("datagram {} exceeded {} retransmissions", sequence_number, max_resends);
            return Err(DisconnectReason::TimedOut);
        }

        let mut buf = BytesMut::with_capacity(Datagram::HEADER_LEN + sent.frame_bytes.len());
        Datagram::ser_resend_header(&mut buf, sequence_number);
        buf.extend_from_slice(&sent.frame_bytes);

        let generation = sent.num_resends;
        let deadline = now + self.congestion.rto(generation);
        self.retransmission_queue.insert(self.weight_of(deadline), RetransmissionCandidate {
            sequence_number,
            generation,
        });

        Ok(buf.freeze())
    }

    /// Periodic housekeeping: due retransmissions, NACKs for gaps past their grace
    ///  period, the pending ACK flush and the idle timeout check.
    pub fn on_tick(&mut self, now: Instant) -> Result<TickOutput, DisconnectReason> {
        self.tick_counter += 1;
        let mut out = TickOutput::default();

        if now.saturating_duration_since(self.last_inbound) > self.config.idle_timeout {
            return Err(DisconnectReason::TimedOut);
        }

        // due retransmissions
        let now_weight = self.weight_of(now);
        while let Some(weight) = self.retransmission_queue.peek_weight() {
            if weight > now_weight {
                break;
            }
            let candidate = self.retransmission_queue.poll()
                .expect("peeked weight without an element");

            // stale check: acknowledged datagrams and superseded schedules fall out here
            let still_current = self.outstanding.get(candidate.sequence_number)
                .map(|sent| sent.num_resends == candidate.generation)
                .unwrap_or(false);
            if !still_current {
                continue;
            }

            trace!("retransmission timeout for datagram {}", candidate.sequence_number);
            out.resend_datagrams.push(self.resend(candidate.sequence_number, now)?);
        }

        // NACKs whose grace period expired; each gap is NACKed once, the sender's
        //  retransmission timeout covers the case where the NACK itself is lost
        let mut due = self.missing.iter()
            .filter(|(_, &nack_at)| nack_at <= self.tick_counter)
            .map(|(&raw, _)| SequenceNumber::from_raw(raw))
            .collect::<Vec<_>>();
        if !due.is_empty() {
            due.sort_by(|a, b| {
                if a == b { std::cmp::Ordering::Equal }
                else if b.is_newer_than(*a) { std::cmp::Ordering::Less }
                else { std::cmp::Ordering::Greater }
            });
            for seq in &due {
                self.missing.remove(&seq.to_raw());
            }
            out.nack = Some(Datagram::Nack(AckRanges::from_sorted(due.into_iter())));
        }

        if !self.pending_acks.is_empty() {
            let mut acks = std::mem::take(&mut self.pending_acks);
            acks.sort_by(|a, b| {
                if a == b { std::cmp::Ordering::Equal }
                else if b.is_newer_than(*a) { std::cmp::Ordering::Less }
                else { std::cmp::Ordering::Greater }
            });
            acks.dedup();
            out.ack = Some(Datagram::Ack(AckRanges::from_sorted(acks.into_iter())));
        }

        Ok(out)
    }

    /// drops all retransmission state, called on session teardown
    pub fn clear(&mut self) {
        self.retransmission_queue.clear();
        for _ in self.outstanding.drain() {}
        self.num_outstanding = 0;
        self.missing.clear();
        self.pending_acks.clear();
    }
}

#[derive(Default, Debug)]
pub struct TickOutput {
    /// pre-serialized retransmissions, RESEND flag set
    pub resend_datagrams: Vec<Bytes>,
    pub ack: Option<Datagram>,
    pub nack: Option<Datagram>,
}
