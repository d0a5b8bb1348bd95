use std::collections::VecDeque;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};
use crate::disk::DiskSlice;
use crate::fragment_set::FragmentSet;
use crate::notices::LtpNotice;
use crate::segment::{CancelSegmentReasonCode, CheckpointSerials, DataSegment, ReportSegment, Segment, SegmentContent, SegmentType};
use crate::session_context::{CheckpointTimerData, DelayedSendKey, EngineTimers, SessionContext, SessionEvent};
use crate::session_id::SessionId;

/// Where a session's client service data lives while it is being transmitted
#[derive(Debug, Clone)]
pub enum SenderData {
    Memory(Bytes),
    Disk(DiskSlice),
}

/// A segment ready to be sent. For disk-backed sessions, the client service data is not part of
///  the segment and must be read from `disk_data` when the segment is sent.
#[derive(Debug, Clone)]
pub struct OutboundSegment {
    pub segment: Segment,
    pub disk_data: Option<DiskSlice>,
}

impl OutboundSegment {
    pub fn control(segment: Segment) -> OutboundSegment {
        OutboundSegment { segment, disk_data: None }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum TimeCriticalItem {
    ReportAck { report_serial_number: u64 },
    Resend { offset: u64, length: u64 },
    /// last segment of a retransmission round, soliciting a new report
    ResendCheckpoint { offset: u64, length: u64, report_serial_number: u64 },
    CheckpointRetransmission(CheckpointTimerData),
}

/// parameters of a transmission request, i.e. of a new outbound session
pub struct SenderParams {
    pub session_id: SessionId,
    pub client_service_id: u64,
    pub data: SenderData,
    pub length: u64,
    pub red_length: u64,
    pub user_data: Bytes,
    pub first_checkpoint_serial_number: u64,
    /// disk-backed sessions report their block as successfully sent once it is stored on disk
    pub is_success_callback_already_called: bool,
}

pub struct SessionSender {
    session_id: SessionId,
    client_service_id: u64,
    data: SenderData,
    length: u64,
    red_length: u64,
    user_data: Bytes,

    next_first_pass_offset: u64,
    num_first_pass_red_segments: u64,
    next_checkpoint_serial_number: u64,

    /// red data acknowledged by reports
    acknowledged: FragmentSet,
    time_critical: VecDeque<TimeCriticalItem>,
    /// gaps per report serial number, waiting for the delayed send timer
    delayed_resends: Vec<(u64, Vec<(u64, u64)>)>,
    processed_report_serials: FxHashSet<u64>,
    active_checkpoint_serials: FxHashSet<u64>,

    is_success_callback_already_called: bool,
    /// latch for 'completed' / 'cancelled' - a session is finished exactly once
    is_finished: bool,
}

impl SessionSender {
    pub fn new(params: SenderParams) -> SessionSender {
        SessionSender {
            session_id: params.session_id,
            client_service_id: params.client_service_id,
            data: params.data,
            length: params.length,
            red_length: params.red_length.min(params.length),
            user_data: params.user_data,
            next_first_pass_offset: 0,
            num_first_pass_red_segments: 0,
            next_checkpoint_serial_number: params.first_checkpoint_serial_number,
            acknowledged: FragmentSet::new(),
            time_critical: VecDeque::new(),
            delayed_resends: Vec::new(),
            processed_report_serials: FxHashSet::default(),
            active_checkpoint_serials: FxHashSet::default(),
            is_success_callback_already_called: params.is_success_callback_already_called,
            is_finished: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    pub fn disk_slice(&self) -> Option<&DiskSlice> {
        match &self.data {
            SenderData::Disk(slice) => Some(slice),
            SenderData::Memory(_) => None,
        }
    }

    pub fn has_first_pass_data(&self) -> bool {
        !self.is_finished && self.next_first_pass_offset < self.length
    }

    pub fn has_time_critical_data(&self) -> bool {
        !self.is_finished && !self.time_critical.is_empty()
    }

    fn end_of_red_part_type(&self) -> SegmentType {
        if self.red_length == self.length {
            SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock
        }
        else {
            SegmentType::RedDataCheckpointEndOfRedPart
        }
    }

    fn build_segment(&self, segment_type: SegmentType, offset: u64, length: u64, checkpoint: Option<CheckpointSerials>) -> OutboundSegment {
        let (data, disk_data) = match &self.data {
            SenderData::Memory(data) => (data.slice(offset as usize..(offset + length) as usize), None),
            SenderData::Disk(slice) => (Bytes::new(), Some(slice.sub_slice(offset, length))),
        };

        OutboundSegment {
            segment: Segment::new(self.session_id, SegmentContent::Data(DataSegment {
                segment_type,
                client_service_id: self.client_service_id,
                offset,
                length,
                checkpoint,
                data,
            })),
            disk_data,
        }
    }

    /// Assigns a fresh checkpoint serial number and starts its timer
    fn new_checkpoint_segment(&mut self, segment_type: SegmentType, offset: u64, length: u64, report_serial_number: u64, ctx: &mut SessionContext) -> OutboundSegment {
        let serials = CheckpointSerials {
            checkpoint_serial_number: self.next_checkpoint_serial_number,
            report_serial_number,
        };
        self.next_checkpoint_serial_number += 1;

        self.start_checkpoint_timer(CheckpointTimerData { offset, length, serials, retry_count: 0 }, ctx);
        self.build_segment(segment_type, offset, length, Some(serials))
    }

    fn start_checkpoint_timer(&mut self, timer_data: CheckpointTimerData, ctx: &mut SessionContext) {
        let serial = timer_data.serials.checkpoint_serial_number;
        if !ctx.timers.checkpoint.start_timer((self.session_id, serial), ctx.now, ctx.config.round_trip_time(), timer_data) {
            warn!("{:?}: checkpoint timer for serial number {} is running already", self.session_id, serial);
            return;
        }
        self.active_checkpoint_serials.insert(serial);
    }

    pub fn next_first_pass_segment(&mut self, ctx: &mut SessionContext) -> Option<OutboundSegment> {
        if !self.has_first_pass_data() {
            return None;
        }

        let offset = self.next_first_pass_offset;
        let mtu = ctx.config.mtu_data_segment as u64;

        let result = if offset < self.red_length {
            let end = (offset + mtu).min(self.red_length);
            self.next_first_pass_offset = end;
            self.num_first_pass_red_segments += 1;

            let every_nth = ctx.config.checkpoint_every_nth_data_packet;
            if end == self.red_length {
                let segment_type = self.end_of_red_part_type();
                self.new_checkpoint_segment(segment_type, offset, end - offset, 0, ctx)
            }
            else if every_nth > 0 && self.num_first_pass_red_segments % every_nth == 0 {
                self.new_checkpoint_segment(SegmentType::RedDataCheckpoint, offset, end - offset, 0, ctx)
            }
            else {
                self.build_segment(SegmentType::RedData, offset, end - offset, None)
            }
        }
        else {
            let end = (offset + mtu).min(self.length);
            self.next_first_pass_offset = end;
            let segment_type = if end == self.length { SegmentType::GreenDataEndOfBlock } else { SegmentType::GreenData };
            self.build_segment(segment_type, offset, end - offset, None)
        };

        if self.next_first_pass_offset >= self.length {
            trace!("{:?}: initial transmission completed", self.session_id);
            ctx.notify(LtpNotice::InitialTransmissionCompleted { session_id: self.session_id });
            if self.red_length == 0 {
                self.complete(ctx);
            }
        }

        Some(result)
    }

    pub fn next_time_critical_segment(&mut self, ctx: &mut SessionContext) -> Option<OutboundSegment> {
        if self.is_finished {
            self.time_critical.clear();
            return None;
        }

        let result = match self.time_critical.pop_front()? {
            TimeCriticalItem::ReportAck { report_serial_number } => {
                OutboundSegment::control(Segment::new(self.session_id, SegmentContent::ReportAck { report_serial_number }))
            }
            TimeCriticalItem::Resend { offset, length } => {
                ctx.stats.data_segments_retransmitted += 1;
                if offset + length == self.red_length {
                    let segment_type = self.end_of_red_part_type();
                    self.new_checkpoint_segment(segment_type, offset, length, 0, ctx)
                }
                else {
                    self.build_segment(SegmentType::RedData, offset, length, None)
                }
            }
            TimeCriticalItem::ResendCheckpoint { offset, length, report_serial_number } => {
                ctx.stats.data_segments_retransmitted += 1;
                let segment_type = if offset + length == self.red_length { self.end_of_red_part_type() } else { SegmentType::RedDataCheckpoint };
                self.new_checkpoint_segment(segment_type, offset, length, report_serial_number, ctx)
            }
            TimeCriticalItem::CheckpointRetransmission(timer_data) => {
                ctx.stats.data_segments_retransmitted += 1;
                let (offset, length, serials) = (timer_data.offset, timer_data.length, timer_data.serials);
                let segment_type = if offset + length == self.red_length { self.end_of_red_part_type() } else { SegmentType::RedDataCheckpoint };
                self.start_checkpoint_timer(timer_data, ctx);
                self.build_segment(segment_type, offset, length, Some(serials))
            }
        };
        Some(result)
    }

    pub fn on_report_segment(&mut self, report: &ReportSegment, ctx: &mut SessionContext) {
        if self.is_finished {
            // the peer keeps re-sending the report until it is acknowledged
            ctx.events.push(SessionEvent::ClosedSessionSegment(Segment::new(
                self.session_id,
                SegmentContent::ReportAck { report_serial_number: report.report_serial_number })));
            return;
        }

        if ctx.timers.checkpoint.delete_timer(&(self.session_id, report.checkpoint_serial_number)).is_some() {
            self.active_checkpoint_serials.remove(&report.checkpoint_serial_number);
        }

        let report_ack = TimeCriticalItem::ReportAck { report_serial_number: report.report_serial_number };

        if !self.processed_report_serials.insert(report.report_serial_number) {
            debug!("{:?}: duplicate report segment {} - acknowledging it again", self.session_id, report.report_serial_number);
            self.time_critical.push_back(report_ack);
            ctx.events.push(SessionEvent::SenderHasTimeCriticalData { session_number: self.session_id.session_number });
            return;
        }

        if report.upper_bound > self.red_length {
            warn!("{:?}: report segment upper bound {} exceeds red part length {}", self.session_id, report.upper_bound, self.red_length);
        }

        self.acknowledged.add_report_claims(report);

        if self.acknowledged.contains(0, self.red_length) {
            debug!("{:?}: red part fully acknowledged", self.session_id);
            ctx.events.push(SessionEvent::ClosedSessionSegment(Segment::new(
                self.session_id,
                SegmentContent::ReportAck { report_serial_number: report.report_serial_number })));
            self.complete(ctx);
            return;
        }

        self.time_critical.push_back(report_ack);

        let gaps = self.acknowledged.gaps_within(report.lower_bound, report.upper_bound.min(self.red_length));
        if !gaps.is_empty() {
            trace!("{:?}: report {} leaves gaps {:?}", self.session_id, report.report_serial_number, gaps);
            let delay = ctx.config.delay_sending_data_segments;
            if delay.is_zero() {
                self.queue_resends(report.report_serial_number, &gaps, ctx);
            }
            else {
                self.delayed_resends.push((report.report_serial_number, gaps));
                // a running timer means resends for an earlier report are waiting - they go out together
                ctx.timers.delayed_send.start_timer(DelayedSendKey::SenderDataSegments(self.session_id), ctx.now, delay, ());
            }
        }

        ctx.events.push(SessionEvent::SenderHasTimeCriticalData { session_number: self.session_id.session_number });
    }

    /// Queues the gaps for re-sending in MTU sized segments. Only the very last segment is a checkpoint.
    fn queue_resends(&mut self, report_serial_number: u64, gaps: &[(u64, u64)], ctx: &mut SessionContext) {
        let mtu = ctx.config.mtu_data_segment as u64;
        let mut chunks = Vec::new();
        for &(begin, end) in gaps {
            let mut offset = begin;
            while offset < end {
                let chunk_end = (offset + mtu).min(end);
                chunks.push((offset, chunk_end - offset));
                offset = chunk_end;
            }
        }

        let num_chunks = chunks.len();
        for (i, (offset, length)) in chunks.into_iter().enumerate() {
            if i + 1 == num_chunks {
                self.time_critical.push_back(TimeCriticalItem::ResendCheckpoint { offset, length, report_serial_number });
            }
            else {
                self.time_critical.push_back(TimeCriticalItem::Resend { offset, length });
            }
        }
    }

    pub fn on_delayed_resend_timer_expired(&mut self, ctx: &mut SessionContext) {
        if self.is_finished {
            return;
        }

        for (report_serial_number, gaps) in std::mem::take(&mut self.delayed_resends) {
            // later reports may have acknowledged some of the data in the meantime
            let remaining = gaps.iter()
                .flat_map(|&(begin, end)| self.acknowledged.gaps_within(begin, end))
                .collect::<Vec<_>>();
            if !remaining.is_empty() {
                self.queue_resends(report_serial_number, &remaining, ctx);
            }
        }

        if self.has_time_critical_data() {
            ctx.events.push(SessionEvent::SenderHasTimeCriticalData { session_number: self.session_id.session_number });
        }
    }

    pub fn on_checkpoint_timer_expired(&mut self, timer_data: CheckpointTimerData, ctx: &mut SessionContext) {
        self.active_checkpoint_serials.remove(&timer_data.serials.checkpoint_serial_number);
        if self.is_finished {
            return;
        }
        ctx.stats.checkpoint_timer_expiries += 1;

        if timer_data.retry_count < ctx.config.max_retries_per_serial_number {
            debug!("{:?}: checkpoint {} timed out - re-sending (retry {})", self.session_id, timer_data.serials.checkpoint_serial_number, timer_data.retry_count + 1);
            self.time_critical.push_back(TimeCriticalItem::CheckpointRetransmission(CheckpointTimerData {
                retry_count: timer_data.retry_count + 1,
                ..timer_data
            }));
            ctx.events.push(SessionEvent::SenderHasTimeCriticalData { session_number: self.session_id.session_number });
        }
        else {
            debug!("{:?}: checkpoint {} exceeded the retry limit", self.session_id, timer_data.serials.checkpoint_serial_number);
            self.cancel(CancelSegmentReasonCode::RetransmissionLimitExceeded, true, ctx);
        }
    }

    fn complete(&mut self, ctx: &mut SessionContext) {
        if self.is_finished {
            return;
        }
        self.is_finished = true;
        self.time_critical.clear();
        ctx.stats.transmissions_completed += 1;

        ctx.notify(LtpNotice::TransmissionSessionCompleted {
            session_id: self.session_id,
            user_data: self.user_data.clone(),
        });
        if !self.is_success_callback_already_called {
            self.is_success_callback_already_called = true;
            ctx.notify(LtpNotice::SuccessfulBundleSend { user_data: self.user_data.clone() });
        }
        ctx.events.push(SessionEvent::SenderNeedsDeleted { session_number: self.session_id.session_number, cancel_reason: None });
    }

    /// Cancels the session, handing the data back to the client service. Returns false if the
    ///  session was finished already - notifications are sent only once.
    pub fn cancel(&mut self, reason: CancelSegmentReasonCode, notify_peer: bool, ctx: &mut SessionContext) -> bool {
        if self.is_finished {
            return false;
        }
        self.is_finished = true;
        self.time_critical.clear();
        self.delayed_resends.clear();
        ctx.stats.senders_cancelled += 1;

        ctx.notify(LtpNotice::TransmissionSessionCancelled { session_id: self.session_id, reason });
        ctx.notify(self.failed_bundle_send_notice());
        ctx.events.push(SessionEvent::SenderNeedsDeleted {
            session_number: self.session_id.session_number,
            cancel_reason: notify_peer.then_some(reason),
        });
        true
    }

    fn failed_bundle_send_notice(&self) -> LtpNotice {
        LtpNotice::FailedBundleSend {
            data: match &self.data {
                SenderData::Memory(data) => Some(data.clone()),
                SenderData::Disk(_) => None,
            },
            user_data: self.user_data.clone(),
            is_success_callback_already_called: self.is_success_callback_already_called,
        }
    }

    pub fn delete_timers(&mut self, timers: &mut EngineTimers) {
        for serial in self.active_checkpoint_serials.drain() {
            timers.checkpoint.delete_timer(&(self.session_id, serial));
        }
        timers.delayed_send.delete_timer(&DelayedSendKey::SenderDataSegments(self.session_id));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::config::LtpEngineConfig;
    use crate::notices::LtpNotice;
    use crate::segment::*;
    use crate::session_context::test_support::TestEnvironment;
    use crate::session_context::{DelayedSendKey, SessionEvent};
    use crate::session_id::SessionId;
    use super::*;

    const SID: SessionId = SessionId { originator_engine_id: 1, session_number: 77 };

    fn config(mtu: usize) -> LtpEngineConfig {
        let mut config = LtpEngineConfig::new(1, 2);
        config.mtu_data_segment = mtu;
        config.delay_sending_data_segments = Duration::ZERO;
        config.max_retries_per_serial_number = 2;
        config
    }

    fn sender(length: usize, red_length: u64) -> SessionSender {
        SessionSender::new(SenderParams {
            session_id: SID,
            client_service_id: 9,
            data: SenderData::Memory(Bytes::from((0..length).map(|i| i as u8).collect::<Vec<_>>())),
            length: length as u64,
            red_length,
            user_data: Bytes::from_static(b"user"),
            first_checkpoint_serial_number: 100,
            is_success_callback_already_called: false,
        })
    }

    fn data_of(segment: &OutboundSegment) -> &DataSegment {
        match &segment.segment.content {
            SegmentContent::Data(data) => data,
            other => panic!("expected data segment, got {:?}", other),
        }
    }

    fn summary(segment: &OutboundSegment) -> (SegmentType, u64, u64, Option<u64>) {
        let data = data_of(segment);
        (data.segment_type, data.offset, data.length, data.checkpoint.map(|c| c.checkpoint_serial_number))
    }

    fn report(report_serial: u64, checkpoint_serial: u64, lower: u64, upper: u64, claims: &[(u64, u64)]) -> ReportSegment {
        ReportSegment {
            report_serial_number: report_serial,
            checkpoint_serial_number: checkpoint_serial,
            upper_bound: upper,
            lower_bound: lower,
            claims: claims.iter().map(|&(offset, length)| ReceptionClaim { offset, length }).collect(),
        }
    }

    #[rstest]
    #[case::all_red(25, 25, 0, vec![
        (SegmentType::RedData, 0, 10, None),
        (SegmentType::RedData, 10, 10, None),
        (SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock, 20, 5, Some(100)),
    ])]
    #[case::red_and_green(25, 12, 0, vec![
        (SegmentType::RedData, 0, 10, None),
        (SegmentType::RedDataCheckpointEndOfRedPart, 10, 2, Some(100)),
        (SegmentType::GreenData, 12, 10, None),
        (SegmentType::GreenDataEndOfBlock, 22, 3, None),
    ])]
    #[case::all_green(15, 0, 0, vec![
        (SegmentType::GreenData, 0, 10, None),
        (SegmentType::GreenDataEndOfBlock, 10, 5, None),
    ])]
    #[case::every_second_checkpoint(45, 45, 2, vec![
        (SegmentType::RedData, 0, 10, None),
        (SegmentType::RedDataCheckpoint, 10, 10, Some(100)),
        (SegmentType::RedData, 20, 10, None),
        (SegmentType::RedDataCheckpoint, 30, 10, Some(101)),
        (SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock, 40, 5, Some(102)),
    ])]
    fn test_first_pass(#[case] length: usize, #[case] red_length: u64, #[case] every_nth: u64, #[case] expected: Vec<(SegmentType, u64, u64, Option<u64>)>) {
        let mut config = config(10);
        config.checkpoint_every_nth_data_packet = every_nth;
        let mut env = TestEnvironment::new(config);
        let mut sender = sender(length, red_length);

        let mut actual = Vec::new();
        while let Some(segment) = sender.next_first_pass_segment(&mut env.ctx()) {
            assert_eq!(data_of(&segment).data.len() as u64, data_of(&segment).length);
            actual.push(summary(&segment));
        }
        assert_eq!(actual, expected);
        assert!(!sender.has_first_pass_data());

        let num_checkpoints = expected.iter().filter(|s| s.3.is_some()).count();
        assert_eq!(env.timers.checkpoint.len(), num_checkpoints);
        assert!(env.take_notices().contains(&LtpNotice::InitialTransmissionCompleted { session_id: SID }));
    }

    #[test]
    fn test_green_only_completes_after_first_pass() {
        let mut env = TestEnvironment::new(config(10));
        let mut sender = sender(5, 0);
        assert!(sender.next_first_pass_segment(&mut env.ctx()).is_some());

        assert_eq!(env.take_notices(), vec![
            LtpNotice::InitialTransmissionCompleted { session_id: SID },
            LtpNotice::TransmissionSessionCompleted { session_id: SID, user_data: Bytes::from_static(b"user") },
            LtpNotice::SuccessfulBundleSend { user_data: Bytes::from_static(b"user") },
        ]);
        assert!(matches!(env.take_events().as_slice(), [SessionEvent::SenderNeedsDeleted { session_number: 77, cancel_reason: None }]));
        assert!(sender.is_finished());
    }

    #[test]
    fn test_full_report_completes() {
        let mut env = TestEnvironment::new(config(10));
        let mut sender = sender(20, 20);
        while sender.next_first_pass_segment(&mut env.ctx()).is_some() {}
        env.take_events();

        sender.on_report_segment(&report(5, 100, 0, 20, &[(0, 20)]), &mut env.ctx());

        assert!(env.timers.checkpoint.is_empty());
        let events = env.take_events();
        assert!(matches!(&events[0], SessionEvent::ClosedSessionSegment(s) if s.content == SegmentContent::ReportAck { report_serial_number: 5 }));
        assert!(matches!(&events[1], SessionEvent::Notice(LtpNotice::TransmissionSessionCompleted { .. })));
        assert!(matches!(&events[2], SessionEvent::Notice(LtpNotice::SuccessfulBundleSend { .. })));
        assert!(matches!(&events[3], SessionEvent::SenderNeedsDeleted { cancel_reason: None, .. }));
        assert_eq!(events.len(), 4);

        // late duplicates are only acknowledged
        sender.on_report_segment(&report(5, 100, 0, 20, &[(0, 20)]), &mut env.ctx());
        let events = env.take_events();
        assert!(matches!(events.as_slice(), [SessionEvent::ClosedSessionSegment(s)] if s.content == SegmentContent::ReportAck { report_serial_number: 5 }));
        assert_eq!(env.stats.transmissions_completed, 1);
    }

    #[test]
    fn test_report_with_gaps_triggers_resends() {
        let mut env = TestEnvironment::new(config(10));
        let mut sender = sender(40, 40);
        while sender.next_first_pass_segment(&mut env.ctx()).is_some() {}
        env.take_events();

        // 10..15 and 20..40 were lost
        sender.on_report_segment(&report(5, 100, 0, 40, &[(0, 10), (15, 5)]), &mut env.ctx());
        assert!(sender.has_time_critical_data());

        let mut produced = Vec::new();
        while let Some(segment) = sender.next_time_critical_segment(&mut env.ctx()) {
            produced.push(segment);
        }
        assert_eq!(produced[0].segment.content, SegmentContent::ReportAck { report_serial_number: 5 });
        let resends = produced[1..].iter().map(summary).collect::<Vec<_>>();
        assert_eq!(resends, vec![
            (SegmentType::RedData, 10, 5, None),
            (SegmentType::RedData, 20, 10, None),
            (SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock, 30, 10, Some(101)),
        ]);
        let last = data_of(&produced[3]);
        assert_eq!(last.checkpoint.map(|c| c.report_serial_number), Some(5));
        assert_eq!(env.stats.data_segments_retransmitted, 3);
        assert!(env.timers.checkpoint.contains(&(SID, 101)));
        assert!(!env.timers.checkpoint.contains(&(SID, 100)));
    }

    #[test]
    fn test_resend_ending_before_red_part_end_is_plain_checkpoint() {
        let mut env = TestEnvironment::new(config(10));
        let mut sender = sender(30, 30);
        while sender.next_first_pass_segment(&mut env.ctx()).is_some() {}

        sender.on_report_segment(&report(5, 100, 0, 30, &[(0, 10), (20, 10)]), &mut env.ctx());
        sender.next_time_critical_segment(&mut env.ctx());
        let resend = sender.next_time_critical_segment(&mut env.ctx()).unwrap();
        assert_eq!(summary(&resend), (SegmentType::RedDataCheckpoint, 10, 10, Some(101)));
    }

    #[test]
    fn test_duplicate_report_is_acked_but_not_acted_on() {
        let mut env = TestEnvironment::new(config(10));
        let mut sender = sender(40, 40);
        while sender.next_first_pass_segment(&mut env.ctx()).is_some() {}

        sender.on_report_segment(&report(5, 100, 0, 40, &[(0, 10)]), &mut env.ctx());
        while sender.next_time_critical_segment(&mut env.ctx()).is_some() {}
        let retransmitted = env.stats.data_segments_retransmitted;

        sender.on_report_segment(&report(5, 100, 0, 40, &[(0, 10)]), &mut env.ctx());
        let ack = sender.next_time_critical_segment(&mut env.ctx()).unwrap();
        assert_eq!(ack.segment.content, SegmentContent::ReportAck { report_serial_number: 5 });
        assert!(sender.next_time_critical_segment(&mut env.ctx()).is_none());
        assert_eq!(env.stats.data_segments_retransmitted, retransmitted);
    }

    #[test]
    fn test_delayed_resends_are_coalesced() {
        let mut config = config(10);
        config.delay_sending_data_segments = Duration::from_millis(20);
        let mut env = TestEnvironment::new(config);
        let mut sender = sender(40, 40);
        while sender.next_first_pass_segment(&mut env.ctx()).is_some() {}

        // two partial reports, e.g. a split report
        sender.on_report_segment(&report(5, 100, 0, 20, &[(0, 10)]), &mut env.ctx());
        sender.on_report_segment(&report(6, 100, 20, 40, &[(10, 10)]), &mut env.ctx());
        assert!(env.timers.delayed_send.contains(&DelayedSendKey::SenderDataSegments(SID)));

        // only the report acks are due before the timer fires
        let acks = std::iter::from_fn(|| sender.next_time_critical_segment(&mut env.ctx()))
            .map(|s| s.segment.content)
            .collect::<Vec<_>>();
        assert_eq!(acks, vec![
            SegmentContent::ReportAck { report_serial_number: 5 },
            SegmentContent::ReportAck { report_serial_number: 6 },
        ]);

        env.timers.delayed_send.delete_timer(&DelayedSendKey::SenderDataSegments(SID));
        sender.on_delayed_resend_timer_expired(&mut env.ctx());
        let resends = std::iter::from_fn(|| sender.next_time_critical_segment(&mut env.ctx()))
            .map(|s| summary(&s))
            .collect::<Vec<_>>();
        assert_eq!(resends, vec![
            (SegmentType::RedDataCheckpoint, 10, 10, Some(101)),
            (SegmentType::RedDataCheckpoint, 20, 10, Some(102)),
        ]);
    }

    #[test]
    fn test_checkpoint_retry_exhaustion() {
        let mut env = TestEnvironment::new(config(10));
        let mut sender = sender(10, 10);
        let first = sender.next_first_pass_segment(&mut env.ctx()).unwrap();
        assert_eq!(summary(&first).3, Some(100));
        env.take_events();

        for retry in 1..=2 {
            env.now += Duration::from_secs(10);
            let (_, timer_data) = env.timers.checkpoint.pop_expired(env.now).unwrap();
            sender.on_checkpoint_timer_expired(timer_data, &mut env.ctx());
            let resent = sender.next_time_critical_segment(&mut env.ctx()).unwrap();
            assert_eq!(summary(&resent), (SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock, 0, 10, Some(100)));
            assert_eq!(env.timers.checkpoint.payload(&(SID, 100)).unwrap().retry_count, retry);
            assert!(env.take_events().iter().all(|e| !matches!(e, SessionEvent::Notice(_))));
        }

        env.now += Duration::from_secs(10);
        let (_, timer_data) = env.timers.checkpoint.pop_expired(env.now).unwrap();
        sender.on_checkpoint_timer_expired(timer_data, &mut env.ctx());

        assert!(sender.is_finished());
        assert_eq!(env.stats.checkpoint_timer_expiries, 3);
        let events = env.take_events();
        assert!(matches!(&events[0], SessionEvent::Notice(LtpNotice::TransmissionSessionCancelled { reason: CancelSegmentReasonCode::RetransmissionLimitExceeded, .. })));
        assert!(matches!(&events[1], SessionEvent::Notice(LtpNotice::FailedBundleSend { data: Some(_), is_success_callback_already_called: false, .. })));
        assert!(matches!(&events[2], SessionEvent::SenderNeedsDeleted { cancel_reason: Some(CancelSegmentReasonCode::RetransmissionLimitExceeded), .. }));
    }

    #[test]
    fn test_cancel_fires_once() {
        let mut env = TestEnvironment::new(config(10));
        let mut sender = sender(10, 10);
        assert!(sender.cancel(CancelSegmentReasonCode::UserCancelled, false, &mut env.ctx()));
        assert!(!sender.cancel(CancelSegmentReasonCode::UserCancelled, false, &mut env.ctx()));
        assert!(!sender.cancel(CancelSegmentReasonCode::Unreachable, true, &mut env.ctx()));

        assert_eq!(env.take_notices().len(), 2);
        assert!(!sender.has_first_pass_data());
    }

    #[test]
    fn test_delete_timers() {
        let mut config = config(10);
        config.checkpoint_every_nth_data_packet = 1;
        let mut env = TestEnvironment::new(config);
        let mut sender = sender(30, 30);
        while sender.next_first_pass_segment(&mut env.ctx()).is_some() {}
        assert_eq!(env.timers.checkpoint.len(), 3);

        sender.delete_timers(&mut env.timers);
        assert!(env.timers.checkpoint.is_empty());
    }
}
