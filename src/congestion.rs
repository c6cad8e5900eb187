use std::time::Duration;

use crate::config::RakUdpConfig;

/// smoothing factor for the RTT estimate
const RTT_ALPHA: f64 = 0.125;
/// smoothing factor for the RTT variance estimate
const RTT_BETA: f64 = 0.25;

/// RTT estimation and retransmission timeout calculation.
///
/// Both estimates are exponential weighted moving averages over RTT samples, and the
///  retransmission timeout is the usual `SRTT + 4 * RTTVAR`, clamped into a configured
///  range so a single outlier sample can neither stall retransmission nor cause a
///  retransmit storm.
///
/// Callers must feed in samples only for datagrams that were never retransmitted
///  (Karn's algorithm) - an ACK for a retransmitted datagram is ambiguous about which
///  transmission it answers.
pub struct CongestionController {
    srtt: f64,
    rtt_var: f64,
    has_sample: bool,
    min_rto: Duration,
    max_rto: Duration,
}

impl CongestionController {
    pub fn new(config: &RakUdpConfig) -> CongestionController {
        CongestionController {
            srtt: 0.1,
            rtt_var: 0.05,
            has_sample: false,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
        }
    }

    pub fn on_rtt_sample(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64();
        if !self.has_sample {
            // the first sample replaces the built-in guess entirely
            self.srtt = sample;
            self.rtt_var = sample / 2.0;
            self.has_sample = true;
            return;
        }

        self.rtt_var = (1.0 - RTT_BETA) * self.rtt_var + RTT_BETA * (self.srtt - sample).abs();
        self.srtt = (1.0 - RTT_ALPHA) * self.srtt + RTT_ALPHA * sample;
    }

    pub fn round_trip_time(&self) -> Duration {
        Duration::from_secs_f64(self.srtt)
    }

    /// retransmission timeout for a datagram's first retransmission; each further
    ///  retransmission of the same datagram doubles it (capped at the configured maximum)
    pub fn rto(&self, num_resends: u32) -> Duration {
        let base = Duration::from_secs_f64(self.srtt + 4.0 * self.rtt_var);
        let backed_off = base.saturating_mul(1u32 << num_resends.min(16));
        backed_off.clamp(self.min_rto, self.max_rto)
    }
}
