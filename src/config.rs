use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashSet;

/// Upper bound for everything in a data segment except the client service data: flags byte,
///  engine id and session number, extension counts, and five SDNVs of at most 10 bytes each
pub const MAX_DATA_SEGMENT_OVERHEAD: usize = 1 + 10 + 10 + 1 + 5*10;

/// Bytes of a report segment that are not reception claims, with some headroom for extensions
const REPORT_SEGMENT_FIXED_OVERHEAD: usize = 100;
/// Worst case size of a single reception claim (two 10-byte SDNVs)
const MAX_BYTES_PER_RECEPTION_CLAIM: usize = 20;

#[derive(Debug, Clone)]
pub struct DiskOffloadConfig {
    /// Parent directory for session data files. Each engine instance creates its own uniquely
    ///  named subdirectory below it.
    pub directory: PathBuf,
    /// A new data file is started once the current one has been written to for this long. Files
    ///  are deleted when no live session references them anymore.
    pub new_file_duration: Duration,
    /// Blocks with at least this many bytes are written to disk rather than kept in memory
    ///  while they are being transmitted. 0 offloads every block.
    pub threshold_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct LtpEngineConfig {
    pub this_engine_id: u64,
    pub remote_engine_id: u64,

    /// client service ids that inbound sessions may be addressed to. A data segment for a
    ///  different client service is answered with an 'unreachable' cancel segment. Empty accepts
    ///  every client service id.
    pub client_service_ids: FxHashSet<u64>,

    /// Maximum number of client service data bytes per data segment
    pub mtu_data_segment: usize,
    /// Maximum size of a report segment - reports with more reception claims than fit are split
    pub mtu_report_segment: usize,

    pub one_way_light_time: Duration,
    pub one_way_margin_time: Duration,

    /// number of times a checkpoint, report or cancel segment is re-sent before giving up
    pub max_retries_per_serial_number: u32,
    pub max_simultaneous_sessions: usize,
    /// turn every n-th first-pass red data segment into a checkpoint, 0 for checkpoints at the
    ///  end of the red part only
    pub checkpoint_every_nth_data_packet: u64,

    /// inbound sessions with a bigger red part are cancelled
    pub max_red_rx_bytes_per_session: u64,
    /// number of closed inbound session ids that are remembered to reject stray segments
    ///  re-creating them. 0 disables.
    pub rx_session_recreation_preventer_history_size: usize,

    /// Delay for sending reports for checkpoints that leave gaps, giving out-of-order data a
    ///  chance to arrive. ZERO disables.
    pub delay_sending_report_segments: Duration,
    /// Delay for re-sending data after a report arrives, coalescing resends for reports that
    ///  arrive in close succession. ZERO disables.
    pub delay_sending_data_segments: Duration,

    /// Send a cancel segment for a non-existent session after this much time without outbound
    ///  data, to check that the link is alive
    pub sender_ping_interval: Option<Duration>,

    pub max_send_rate_bits_per_sec: u64,
    pub rate_limit_refill_interval: Duration,
    pub rate_limit_max_burst_window: Duration,

    pub max_packets_per_send_system_call: usize,
    pub max_in_flight_send_system_calls: usize,

    pub active_session_data_on_disk: Option<DiskOffloadConfig>,

    pub housekeeping_interval: Duration,

    pub force_32_bit_random_numbers: bool,
    /// encoded into the most significant bits of generated session numbers so that engines
    ///  with different indexes never collide
    pub engine_index_for_random_numbers: u8,
}

impl LtpEngineConfig {
    pub fn new(this_engine_id: u64, remote_engine_id: u64) -> LtpEngineConfig {
        LtpEngineConfig {
            this_engine_id,
            remote_engine_id,
            client_service_ids: Default::default(),
            mtu_data_segment: 1360,
            mtu_report_segment: 1360,
            one_way_light_time: Duration::from_secs(1),
            one_way_margin_time: Duration::from_millis(200),
            max_retries_per_serial_number: 5,
            max_simultaneous_sessions: 5000,
            checkpoint_every_nth_data_packet: 0,
            max_red_rx_bytes_per_session: 100_000_000,
            rx_session_recreation_preventer_history_size: 1000,
            delay_sending_report_segments: Duration::from_millis(20),
            delay_sending_data_segments: Duration::from_millis(20),
            sender_ping_interval: None,
            max_send_rate_bits_per_sec: 0,
            rate_limit_refill_interval: Duration::from_millis(20),
            rate_limit_max_burst_window: Duration::from_millis(500),
            max_packets_per_send_system_call: 1,
            max_in_flight_send_system_calls: 5,
            active_session_data_on_disk: None,
            housekeeping_interval: Duration::from_secs(1),
            force_32_bit_random_numbers: false,
            engine_index_for_random_numbers: 1,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu_data_segment == 0 {
            bail!("data segment MTU must not be 0");
        }
        if self.mtu_report_segment < REPORT_SEGMENT_FIXED_OVERHEAD + MAX_BYTES_PER_RECEPTION_CLAIM {
            bail!("report segment MTU {} is too small to hold a single reception claim", self.mtu_report_segment);
        }
        if self.round_trip_time().is_zero() {
            bail!("one way light time and margin are both 0 - timers would expire immediately");
        }
        if self.max_simultaneous_sessions == 0 {
            bail!("max simultaneous sessions must be at least 1");
        }
        if self.max_packets_per_send_system_call == 0 {
            bail!("max packets per send system call must be at least 1");
        }
        if self.max_in_flight_send_system_calls == 0 {
            bail!("max in-flight send system calls must be at least 1");
        }
        if self.housekeeping_interval.is_zero() {
            bail!("housekeeping interval must not be 0");
        }

        if self.max_send_rate_bits_per_sec > 0 {
            if self.rate_limit_refill_interval.is_zero() {
                bail!("rate limiting requires a non-zero refill interval");
            }
            if self.rate_limit_capacity_bytes() < self.max_segment_size() as u128 {
                bail!("rate limiter capacity of {} bytes can not hold a segment of {} bytes - increase the burst window or the rate", self.rate_limit_capacity_bytes(), self.max_segment_size());
            }
        }

        if let Some(disk) = &self.active_session_data_on_disk {
            if disk.directory.as_os_str().is_empty() {
                bail!("disk offload requires a directory");
            }
            if disk.new_file_duration.is_zero() {
                bail!("disk offload requires a non-zero new file duration");
            }
        }

        Ok(())
    }

    pub fn round_trip_time(&self) -> Duration {
        2 * (self.one_way_light_time + self.one_way_margin_time)
    }

    /// An inbound session without segments for this long and without running timers is
    ///  considered stagnant
    pub fn stagnant_receiver_timeout(&self) -> Duration {
        self.round_trip_time() * (self.max_retries_per_serial_number + 1)
    }

    pub fn max_reception_claims_per_report(&self) -> usize {
        (self.mtu_report_segment.saturating_sub(REPORT_SEGMENT_FIXED_OVERHEAD) / MAX_BYTES_PER_RECEPTION_CLAIM)
            .max(1)
    }

    /// Upper bound for the size of any segment the engine sends. Reports are bounded by their MTU,
    ///  cancel segments and acknowledgements are smaller than the smallest valid report MTU.
    pub fn max_segment_size(&self) -> usize {
        (self.mtu_data_segment + MAX_DATA_SEGMENT_OVERHEAD).max(self.mtu_report_segment)
    }

    pub fn max_send_rate_bytes_per_sec(&self) -> u64 {
        self.max_send_rate_bits_per_sec / 8
    }

    pub fn rate_limit_burst_window(&self) -> Duration {
        self.rate_limit_max_burst_window.max(self.rate_limit_refill_interval)
    }

    fn rate_limit_capacity_bytes(&self) -> u128 {
        self.max_send_rate_bytes_per_sec() as u128 * self.rate_limit_burst_window().as_nanos() / 1_000_000_000
    }

    pub fn accepts_client_service_id(&self, client_service_id: u64) -> bool {
        self.client_service_ids.is_empty() || self.client_service_ids.contains(&client_service_id)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LtpEngineConfig::new(1, 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.round_trip_time(), Duration::from_millis(2400));
        assert_eq!(config.stagnant_receiver_timeout(), Duration::from_millis(2400 * 6));
    }

    #[rstest]
    #[case::zero_data_mtu(|c: &mut LtpEngineConfig| c.mtu_data_segment = 0)]
    #[case::tiny_report_mtu(|c: &mut LtpEngineConfig| c.mtu_report_segment = 50)]
    #[case::zero_rtt(|c: &mut LtpEngineConfig| { c.one_way_light_time = Duration::ZERO; c.one_way_margin_time = Duration::ZERO; })]
    #[case::no_sessions(|c: &mut LtpEngineConfig| c.max_simultaneous_sessions = 0)]
    #[case::no_packets_per_call(|c: &mut LtpEngineConfig| c.max_packets_per_send_system_call = 0)]
    #[case::no_in_flight(|c: &mut LtpEngineConfig| c.max_in_flight_send_system_calls = 0)]
    #[case::rate_too_small_for_segment(|c: &mut LtpEngineConfig| c.max_send_rate_bits_per_sec = 8_000)]
    #[case::rate_too_small_for_report(|c: &mut LtpEngineConfig| { c.mtu_report_segment = 9000; c.max_send_rate_bits_per_sec = 8 * 3000; })]
    #[case::rate_without_refill(|c: &mut LtpEngineConfig| { c.max_send_rate_bits_per_sec = 100_000_000; c.rate_limit_refill_interval = Duration::ZERO; })]
    #[case::disk_without_dir(|c: &mut LtpEngineConfig| c.active_session_data_on_disk = Some(DiskOffloadConfig { directory: PathBuf::new(), new_file_duration: Duration::from_secs(1), threshold_bytes: 0 }))]
    #[case::disk_without_rotation(|c: &mut LtpEngineConfig| c.active_session_data_on_disk = Some(DiskOffloadConfig { directory: PathBuf::from("/tmp"), new_file_duration: Duration::ZERO, threshold_bytes: 0 }))]
    fn test_validate_rejects(#[case] modify: fn(&mut LtpEngineConfig)) {
        let mut config = LtpEngineConfig::new(1, 2);
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::data_segment(1000, 1360, 1360)]
    #[case::data_segment_with_overhead(1360, 1360, 1360 + MAX_DATA_SEGMENT_OVERHEAD)]
    #[case::report_segment(1000, 9000, 9000)]
    fn test_max_segment_size(#[case] mtu_data: usize, #[case] mtu_report: usize, #[case] expected: usize) {
        let mut config = LtpEngineConfig::new(1, 2);
        config.mtu_data_segment = mtu_data;
        config.mtu_report_segment = mtu_report;
        assert_eq!(config.max_segment_size(), expected);
    }

    #[rstest]
    #[case::default(1360, 63)]
    #[case::minimal(120, 1)]
    #[case::below_overhead(90, 1)]
    #[case::big(9000, 445)]
    fn test_max_reception_claims_per_report(#[case] mtu: usize, #[case] expected: usize) {
        let mut config = LtpEngineConfig::new(1, 2);
        config.mtu_report_segment = mtu;
        assert_eq!(config.max_reception_claims_per_report(), expected);
    }

    #[rstest]
    #[case::all(vec![], 17, true)]
    #[case::listed(vec![1, 17], 17, true)]
    #[case::unlisted(vec![1, 2], 17, false)]
    fn test_accepts_client_service_id(#[case] ids: Vec<u64>, #[case] id: u64, #[case] expected: bool) {
        let mut config = LtpEngineConfig::new(1, 2);
        config.client_service_ids = ids.into_iter().collect();
        assert_eq!(config.accepts_client_service_id(id), expected);
    }
}
