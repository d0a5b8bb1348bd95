/// Counters for observability. They only ever increase during the lifetime of an engine.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LtpEngineStats {
    pub checkpoint_timer_expiries: u64,
    pub report_timer_expiries: u64,
    pub cancel_timer_expiries: u64,
    pub data_segments_retransmitted: u64,
    pub report_segments_sent: u64,
    pub report_segments_received: u64,
    /// out-of-order red data that filled a gap below the highest received offset
    pub gaps_filled_by_out_of_order_data: u64,
    pub redundant_data_segments: u64,
    pub malformed_segments: u64,
    pub red_parts_delivered: u64,
    pub transmissions_completed: u64,
    pub senders_cancelled: u64,
    pub receivers_cancelled: u64,
    pub stagnant_receivers_cancelled: u64,
    pub rejected_recreated_sessions: u64,
}
