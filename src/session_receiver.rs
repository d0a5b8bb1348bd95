use std::collections::VecDeque;
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::disk::DiskSlice;
use crate::fragment_set::FragmentSet;
use crate::notices::LtpNotice;
use crate::segment::{CancelSegmentReasonCode, CheckpointSerials, DataSegment, ReportSegment, Segment, SegmentContent};
use crate::session_context::{DelayedSendKey, EngineTimers, ReportTimerData, SessionContext, SessionEvent};
use crate::session_id::SessionId;

pub struct ReceiverParams {
    pub session_id: SessionId,
    pub client_service_id: u64,
    pub first_report_serial_number: u64,
    /// region for the session's red data if it is kept on disk
    pub disk: Option<DiskSlice>,
    pub now: Instant,
}

/// a report that waits for the delayed send timer, possibly gathering the scopes of several checkpoints
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct DelayedReport {
    checkpoint_serial_number: u64,
    lower_bound: u64,
    upper_bound: u64,
}

pub struct SessionReceiver {
    session_id: SessionId,
    client_service_id: u64,

    received_red: FragmentSet,
    red_part_length: Option<u64>,
    is_end_of_block: bool,
    lowest_green_offset: Option<u64>,
    red_data: BytesMut,
    disk: Option<DiskSlice>,
    outstanding_disk_operations: usize,
    red_part_read_requested: bool,

    next_report_serial_number: u64,
    sent_report_bounds: FxHashMap<u64, (u64, u64)>,
    pending_reports: VecDeque<ReportTimerData>,
    active_report_serials: FxHashSet<u64>,
    delayed_report: Option<DelayedReport>,

    last_segment_received: Instant,
    red_part_delivered: bool,
    /// latch: the session is deleted exactly once
    is_finished: bool,
}

impl SessionReceiver {
    pub fn new(params: ReceiverParams) -> SessionReceiver {
        SessionReceiver {
            session_id: params.session_id,
            client_service_id: params.client_service_id,
            received_red: FragmentSet::new(),
            red_part_length: None,
            is_end_of_block: false,
            lowest_green_offset: None,
            red_data: BytesMut::new(),
            disk: params.disk,
            outstanding_disk_operations: 0,
            red_part_read_requested: false,
            next_report_serial_number: params.first_report_serial_number,
            sent_report_bounds: FxHashMap::default(),
            pending_reports: VecDeque::new(),
            active_report_serials: FxHashSet::default(),
            delayed_report: None,
            last_segment_received: params.now,
            red_part_delivered: false,
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
        self.disk.as_ref()
    }

    pub fn outstanding_disk_operations(&self) -> usize {
        self.outstanding_disk_operations
    }

    pub fn has_report_data(&self) -> bool {
        !self.is_finished && !self.pending_reports.is_empty()
    }

    /// no segments for `timeout` and no running timers that would eventually finish the session
    pub fn is_stagnant(&self, now: Instant, timeout: Duration) -> bool {
        self.active_report_serials.is_empty()
            && self.delayed_report.is_none()
            && now.saturating_duration_since(self.last_segment_received) >= timeout
    }

    /// Returns true if processing continues asynchronously, i.e. the data is being written to disk.
    ///  A [LtpNotice::PacketInFullyProcessed] is sent when that is done.
    pub fn on_data_segment(&mut self, segment: DataSegment, ctx: &mut SessionContext) -> bool {
        if self.is_finished {
            return false;
        }
        self.last_segment_received = ctx.now;

        if segment.segment_type.is_green_data() {
            self.on_green_data(segment, ctx);
            false
        }
        else {
            self.on_red_data(segment, ctx)
        }
    }

    fn on_green_data(&mut self, segment: DataSegment, ctx: &mut SessionContext) {
        let highest_red = self.received_red.highest_end().unwrap_or(0);
        if segment.offset < highest_red || self.red_part_length.is_some_and(|len| segment.offset < len) {
            warn!("{:?}: green data at offset {} overlaps the red part", self.session_id, segment.offset);
            self.cancel(CancelSegmentReasonCode::Miscolored, true, ctx);
            return;
        }

        self.lowest_green_offset = Some(self.lowest_green_offset.map_or(segment.offset, |o| o.min(segment.offset)));
        if segment.offset == 0 {
            self.red_part_length = Some(0);
        }

        let is_end_of_block = segment.segment_type.is_end_of_block();
        trace!("{:?}: green data {}..{}", self.session_id, segment.offset, segment.offset + segment.length);
        ctx.notify(LtpNotice::GreenPartSegmentArrival {
            session_id: self.session_id,
            client_service_id: segment.client_service_id,
            offset: segment.offset,
            data: segment.data,
            is_end_of_block,
        });

        if is_end_of_block && self.red_part_length.unwrap_or(0) == 0 && self.received_red.is_empty() {
            // without a red part, there is nothing to report on
            self.red_part_length = Some(0);
            self.red_part_delivered = true;
            self.check_closure(ctx);
        }
    }

    fn on_red_data(&mut self, segment: DataSegment, ctx: &mut SessionContext) -> bool {
        let begin = segment.offset;
        let end = segment.offset + segment.length;

        if self.lowest_green_offset.is_some_and(|green| end > green) || self.red_part_length.is_some_and(|len| end > len) {
            warn!("{:?}: red data {}..{} beyond the red part", self.session_id, begin, end);
            self.cancel(CancelSegmentReasonCode::Miscolored, true, ctx);
            return false;
        }
        if end > ctx.config.max_red_rx_bytes_per_session {
            warn!("{:?}: red data up to {} exceeds the configured maximum of {} bytes", self.session_id, end, ctx.config.max_red_rx_bytes_per_session);
            self.cancel(CancelSegmentReasonCode::SystemCancelled, true, ctx);
            return false;
        }
        if segment.segment_type.is_end_of_red_part() {
            if self.received_red.highest_end().is_some_and(|highest| highest > end) {
                warn!("{:?}: end of red part at {} below already received red data", self.session_id, end);
                self.cancel(CancelSegmentReasonCode::Miscolored, true, ctx);
                return false;
            }
            self.red_part_length = Some(end);
            self.is_end_of_block = segment.segment_type.is_end_of_block();
        }

        let mut is_operation_ongoing = false;
        let fills_gap = self.received_red.highest_end().is_some_and(|highest| begin < highest);
        if self.received_red.insert(begin, end) {
            if fills_gap {
                ctx.stats.gaps_filled_by_out_of_order_data += 1;
            }
            is_operation_ongoing = self.store_red_data(begin, segment.data.clone(), ctx);

            if fills_gap {
                self.on_gap_filled(ctx);
            }
        }
        else {
            trace!("{:?}: redundant red data {}..{}", self.session_id, begin, end);
            ctx.stats.redundant_data_segments += 1;
        }

        if let Some(serials) = segment.checkpoint {
            self.on_checkpoint(end, serials, ctx);
        }

        self.check_red_part_complete(ctx);
        is_operation_ongoing
    }

    fn store_red_data(&mut self, offset: u64, data: Bytes, ctx: &mut SessionContext) -> bool {
        match &self.disk {
            Some(disk) => {
                let slice = disk.sub_slice(offset, data.len() as u64);
                self.outstanding_disk_operations += 1;
                ctx.events.push(SessionEvent::ReceiverDiskWrite { session_id: self.session_id, slice, data });
                true
            }
            None => {
                let begin = offset as usize;
                let end = begin + data.len();
                if self.red_data.len() < end {
                    self.red_data.resize(end, 0);
                }
                self.red_data[begin..end].copy_from_slice(&data);
                false
            }
        }
    }

    /// out-of-order data may complete the scope of a delayed report, which is then sent right away
    fn on_gap_filled(&mut self, ctx: &mut SessionContext) {
        let Some(delayed) = self.delayed_report else {
            return;
        };
        let key = DelayedSendKey::ReceiverReport(self.session_id);
        ctx.timers.delayed_send.delete_timer(&key);

        if self.received_red.contains(delayed.lower_bound, delayed.upper_bound) {
            debug!("{:?}: scope of delayed report is complete, sending it now", self.session_id);
            self.delayed_report = None;
            self.generate_reports(delayed.checkpoint_serial_number, delayed.lower_bound, delayed.upper_bound, ctx);
        }
        else {
            ctx.timers.delayed_send.start_timer(key, ctx.now, ctx.config.delay_sending_report_segments, ());
        }
    }

    fn on_checkpoint(&mut self, checkpoint_end: u64, serials: CheckpointSerials, ctx: &mut SessionContext) {
        let (lower_bound, upper_bound) = match self.sent_report_bounds.get(&serials.report_serial_number) {
            Some(&(lower, upper)) if serials.report_serial_number != 0 => {
                // the checkpoint answers one of our reports, so that report need not be re-sent
                if ctx.timers.report.delete_timer(&(self.session_id, serials.report_serial_number)).is_some() {
                    self.active_report_serials.remove(&serials.report_serial_number);
                }
                (lower, upper.max(checkpoint_end))
            }
            _ => (0, checkpoint_end),
        };

        trace!("{:?}: checkpoint {} for {}..{}", self.session_id, serials.checkpoint_serial_number, lower_bound, upper_bound);

        let delay = ctx.config.delay_sending_report_segments;
        if !delay.is_zero() && !self.received_red.contains(lower_bound, upper_bound) {
            let merged = match self.delayed_report {
                Some(d) => DelayedReport {
                    checkpoint_serial_number: serials.checkpoint_serial_number,
                    lower_bound: d.lower_bound.min(lower_bound),
                    upper_bound: d.upper_bound.max(upper_bound),
                },
                None => DelayedReport {
                    checkpoint_serial_number: serials.checkpoint_serial_number,
                    lower_bound,
                    upper_bound,
                },
            };
            self.delayed_report = Some(merged);
            ctx.timers.delayed_send.start_timer(DelayedSendKey::ReceiverReport(self.session_id), ctx.now, delay, ());
            return;
        }

        if let Some(delayed) = self.delayed_report.take() {
            // a complete scope supersedes a gathering report
            ctx.timers.delayed_send.delete_timer(&DelayedSendKey::ReceiverReport(self.session_id));
            self.generate_reports(delayed.checkpoint_serial_number, delayed.lower_bound.min(lower_bound), delayed.upper_bound.max(upper_bound), ctx);
            return;
        }
        self.generate_reports(serials.checkpoint_serial_number, lower_bound, upper_bound, ctx);
    }

    pub fn on_delayed_report_timer_expired(&mut self, ctx: &mut SessionContext) {
        if self.is_finished {
            return;
        }
        if let Some(delayed) = self.delayed_report.take() {
            self.generate_reports(delayed.checkpoint_serial_number, delayed.lower_bound, delayed.upper_bound, ctx);
        }
    }

    /// Queues one or more reports for `[lower_bound, upper_bound)`. A scope with more claims than fit
    ///  into a single report segment is split into several reports.
    fn generate_reports(&mut self, checkpoint_serial_number: u64, lower_bound: u64, upper_bound: u64, ctx: &mut SessionContext) {
        let scopes = self.received_red.report_scopes(lower_bound, upper_bound, ctx.config.max_reception_claims_per_report());
        if scopes.len() > 1 {
            debug!("{:?}: splitting report for {}..{} into {} report segments", self.session_id, lower_bound, upper_bound, scopes.len());
        }

        for scope in scopes {
            let report_serial_number = self.next_report_serial_number;
            self.next_report_serial_number += 1;

            self.sent_report_bounds.insert(report_serial_number, (scope.lower_bound, scope.upper_bound));
            self.pending_reports.push_back(ReportTimerData {
                report: ReportSegment {
                    report_serial_number,
                    checkpoint_serial_number,
                    upper_bound: scope.upper_bound,
                    lower_bound: scope.lower_bound,
                    claims: scope.claims,
                },
                retry_count: 0,
            });
        }
        ctx.events.push(SessionEvent::ReceiverHasReportData { session_id: self.session_id });
    }

    /// Takes the next pending report for sending, starting its timer
    pub fn next_report_segment(&mut self, ctx: &mut SessionContext) -> Option<Segment> {
        if self.is_finished {
            self.pending_reports.clear();
            return None;
        }
        let timer_data = self.pending_reports.pop_front()?;
        let report = timer_data.report.clone();

        if ctx.timers.report.start_timer((self.session_id, report.report_serial_number), ctx.now, ctx.config.round_trip_time(), timer_data) {
            self.active_report_serials.insert(report.report_serial_number);
        }
        ctx.stats.report_segments_sent += 1;
        Some(Segment::new(self.session_id, SegmentContent::Report(report)))
    }

    pub fn on_report_timer_expired(&mut self, timer_data: ReportTimerData, ctx: &mut SessionContext) {
        self.active_report_serials.remove(&timer_data.report.report_serial_number);
        if self.is_finished {
            return;
        }
        ctx.stats.report_timer_expiries += 1;

        if timer_data.retry_count < ctx.config.max_retries_per_serial_number {
            debug!("{:?}: report {} timed out - re-sending (retry {})", self.session_id, timer_data.report.report_serial_number, timer_data.retry_count + 1);
            self.pending_reports.push_back(ReportTimerData {
                retry_count: timer_data.retry_count + 1,
                ..timer_data
            });
            ctx.events.push(SessionEvent::ReceiverHasReportData { session_id: self.session_id });
        }
        else {
            debug!("{:?}: report {} exceeded the retry limit", self.session_id, timer_data.report.report_serial_number);
            self.cancel(CancelSegmentReasonCode::RetransmissionLimitExceeded, true, ctx);
        }
    }

    pub fn on_report_ack(&mut self, report_serial_number: u64, ctx: &mut SessionContext) {
        if self.is_finished {
            return;
        }
        self.last_segment_received = ctx.now;

        if ctx.timers.report.delete_timer(&(self.session_id, report_serial_number)).is_none() {
            trace!("{:?}: redundant report ack {}", self.session_id, report_serial_number);
            return;
        }
        self.active_report_serials.remove(&report_serial_number);
        self.check_closure(ctx);
    }

    fn check_red_part_complete(&mut self, ctx: &mut SessionContext) {
        if self.red_part_delivered || self.is_finished {
            return;
        }
        let Some(red_part_length) = self.red_part_length else {
            return;
        };
        if red_part_length == 0 || !self.received_red.contains(0, red_part_length) {
            return;
        }

        match &self.disk {
            Some(disk) => {
                if self.outstanding_disk_operations == 0 && !self.red_part_read_requested {
                    self.red_part_read_requested = true;
                    ctx.events.push(SessionEvent::ReceiverDiskRead {
                        session_id: self.session_id,
                        slice: disk.sub_slice(0, red_part_length),
                    });
                }
            }
            None => {
                let mut data = std::mem::take(&mut self.red_data);
                data.truncate(red_part_length as usize);
                self.deliver_red_part(data.freeze(), ctx);
            }
        }
    }

    fn deliver_red_part(&mut self, data: Bytes, ctx: &mut SessionContext) {
        debug!("{:?}: red part of {} bytes received", self.session_id, data.len());
        self.red_part_delivered = true;
        ctx.stats.red_parts_delivered += 1;
        ctx.notify(LtpNotice::RedPartReception {
            session_id: self.session_id,
            client_service_id: self.client_service_id,
            data,
            is_end_of_block: self.is_end_of_block,
        });
        self.check_closure(ctx);
    }

    fn check_closure(&mut self, ctx: &mut SessionContext) {
        if self.is_finished || !self.red_part_delivered {
            return;
        }
        if !self.active_report_serials.is_empty() || !self.pending_reports.is_empty() || self.delayed_report.is_some() {
            return;
        }
        debug!("{:?}: reception completed", self.session_id);
        self.is_finished = true;
        ctx.events.push(SessionEvent::ReceiverNeedsDeleted { session_id: self.session_id, cancel_reason: None });
    }

    pub fn on_disk_write_completed(&mut self, success: bool, ctx: &mut SessionContext) {
        self.outstanding_disk_operations = self.outstanding_disk_operations.saturating_sub(1);
        ctx.notify(LtpNotice::PacketInFullyProcessed { success });

        if !success {
            self.cancel(CancelSegmentReasonCode::SystemCancelled, true, ctx);
            return;
        }
        self.check_red_part_complete(ctx);
    }

    pub fn on_disk_read_completed(&mut self, data: Option<Bytes>, ctx: &mut SessionContext) {
        if self.is_finished || self.red_part_delivered {
            return;
        }
        match data {
            Some(data) => self.deliver_red_part(data, ctx),
            None => {
                self.cancel(CancelSegmentReasonCode::SystemCancelled, true, ctx);
            }
        }
    }

    /// returns false if the session was finished already
    pub fn cancel(&mut self, reason: CancelSegmentReasonCode, notify_peer: bool, ctx: &mut SessionContext) -> bool {
        if self.is_finished {
            return false;
        }
        self.is_finished = true;
        self.pending_reports.clear();
        self.delayed_report = None;
        ctx.stats.receivers_cancelled += 1;

        ctx.notify(LtpNotice::ReceptionSessionCancelled { session_id: self.session_id, reason });
        ctx.events.push(SessionEvent::ReceiverNeedsDeleted {
            session_id: self.session_id,
            cancel_reason: notify_peer.then_some(reason),
        });
        true
    }

    pub fn delete_timers(&mut self, timers: &mut EngineTimers) {
        for serial in self.active_report_serials.drain() {
            timers.report.delete_timer(&(self.session_id, serial));
        }
        timers.delayed_send.delete_timer(&DelayedSendKey::ReceiverReport(self.session_id));
    }
}
