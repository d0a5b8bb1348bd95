use std::collections::VecDeque;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use crate::config::LtpEngineConfig;
use crate::disk::{DiskOperation, DiskOperationToken, DiskSlice, SessionDataStore};
use crate::notices::LtpNotice;
use crate::random::LtpRandomNumberGenerator;
use crate::segment::{CancelSegmentReasonCode, DataSegment, ReportSegment, Segment, SegmentContent, SegmentParseError};
use crate::session_context::{session_context, CancelTimerData, DelayedSendKey, EngineTimers, SessionEvent};
use crate::session_id::SessionId;
use crate::session_receiver::{ReceiverParams, SessionReceiver};
use crate::session_sender::{OutboundSegment, SenderData, SenderParams, SessionSender};
use crate::stats::LtpEngineStats;
use crate::timer_manager::TimerAdjustment;
use crate::token_rate_limiter::TokenRateLimiter;
use crate::unique_queue::UniqueQueue;

/// session maps are pre-sized for up to this many sessions per direction
const MAX_PREALLOCATED_SESSIONS: usize = 5000;

#[derive(Debug, Clone)]
pub struct TransmissionRequest {
    pub destination_client_service_id: u64,
    pub destination_engine_id: u64,
    pub data: Bytes,
    /// the first `red_length` bytes are transferred reliably, the rest as green data
    pub red_length: u64,
    /// opaque to the engine, handed back in notices about the transmission
    pub user_data: Bytes,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PacketPart {
    Memory(Bytes),
    /// client service data of a disk-backed session, to be read before sending
    Disk(DiskSlice),
}

impl PacketPart {
    pub fn len(&self) -> usize {
        match self {
            PacketPart::Memory(bytes) => bytes.len(),
            PacketPart::Disk(slice) => slice.len as usize,
        }
    }
}

/// A single datagram for the transport
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub parts: Vec<PacketPart>,
    pub len: usize,
    /// set if the packet contains data of a disk-backed transmission, so a failed read can be
    ///  attributed to its session
    pub disk_session_number: Option<u64>,
}

impl OutboundPacket {
    pub fn disk_slices(&self) -> impl Iterator<Item=&DiskSlice> {
        self.parts.iter()
            .filter_map(|part| match part {
                PacketPart::Disk(slice) => Some(slice),
                PacketPart::Memory(_) => None,
            })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkStatus {
    Unknown,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
struct CancelRequest {
    session_id: SessionId,
    reason: CancelSegmentReasonCode,
    is_from_sender: bool,
    retry_count: u32,
}

struct PendingDiskTransmission {
    request: TransmissionRequest,
    slice: DiskSlice,
}

/// The LTP engine for a single link to a remote engine.
///
/// This is a synchronous state machine: every entry point takes the current time and leaves
///  outbound packets, notices and disk operations behind for the caller to pick up. It is not
///  thread safe; [crate::runner] owns it from a single task and marshals everything else into
///  that task.
///
/// Packets are produced by [LtpEngine::pump_send_pipeline] in strict priority order:
///  1. deletion of finished senders
///  2. 'successful send' notices for disk-backed transmissions
///  3. promotion of finished receivers whose disk operations have completed
///  4. deletion of finished receivers
///  5. cancel segments
///  6. segments for sessions that are closed already (report acks, cancel acks)
///  7. time critical sender data (checkpoint and data retransmissions, report acks)
///  8. report segments
///  9. first-pass data
///
/// Steps 7 to 9 are subject to the token bucket if rate limiting is configured, and every packet
///  needs one of the bounded in-flight send slots.
pub struct LtpEngine {
    config: LtpEngineConfig,
    notices: mpsc::UnboundedSender<LtpNotice>,
    rng: LtpRandomNumberGenerator,

    senders: FxHashMap<u64, SessionSender>,
    receivers: FxHashMap<SessionId, SessionReceiver>,

    timers: EngineTimers,
    events: Vec<SessionEvent>,
    stats: LtpEngineStats,

    sender_deletions: VecDeque<(u64, Option<CancelSegmentReasonCode>)>,
    success_backlog: VecDeque<Bytes>,
    unsafe_receiver_deletions: VecDeque<(SessionId, Option<CancelSegmentReasonCode>)>,
    receiver_deletions: VecDeque<(SessionId, Option<CancelSegmentReasonCode>)>,
    cancel_requests: VecDeque<CancelRequest>,
    closed_session_segments: VecDeque<Segment>,
    time_critical_senders: UniqueQueue<u64>,
    receivers_needing_reports: UniqueQueue<SessionId>,
    first_pass_senders: UniqueQueue<u64>,

    recently_closed_receptions: VecDeque<SessionId>,
    recently_closed_reception_set: FxHashSet<SessionId>,

    rate_limiter: Option<TokenRateLimiter>,
    parked_packet: Option<OutboundPacket>,
    last_refill: Option<Instant>,

    num_in_flight_send_calls: usize,
    has_send_error: bool,

    link_status: LinkStatus,
    ping_session_number: Option<u64>,
    last_outbound_activity: Option<Instant>,

    disk: Option<SessionDataStore>,
    pending_disk_operations: Vec<DiskOperation>,
    pending_disk_transmissions: FxHashMap<u64, PendingDiskTransmission>,
}

impl LtpEngine {
    pub fn new(config: LtpEngineConfig, notices: mpsc::UnboundedSender<LtpNotice>) -> anyhow::Result<LtpEngine> {
        config.validate()?;

        let disk = match &config.active_session_data_on_disk {
            Some(disk_config) => Some(SessionDataStore::new(disk_config)?),
            None => None,
        };
        let rate_limiter = match config.max_send_rate_bytes_per_sec() {
            0 => None,
            rate => Some(new_rate_limiter(&config, rate)),
        };

        info!("LTP engine {} for remote engine {}", config.this_engine_id, config.remote_engine_id);
        let session_capacity = config.max_simultaneous_sessions.min(MAX_PREALLOCATED_SESSIONS);

        Ok(LtpEngine {
            rng: LtpRandomNumberGenerator::new(config.engine_index_for_random_numbers, config.force_32_bit_random_numbers),
            notices,
            senders: FxHashMap::with_capacity_and_hasher(session_capacity, Default::default()),
            receivers: FxHashMap::with_capacity_and_hasher(session_capacity, Default::default()),
            timers: EngineTimers::new(),
            events: Vec::new(),
            stats: LtpEngineStats::default(),
            sender_deletions: VecDeque::new(),
            success_backlog: VecDeque::new(),
            unsafe_receiver_deletions: VecDeque::new(),
            receiver_deletions: VecDeque::new(),
            cancel_requests: VecDeque::new(),
            closed_session_segments: VecDeque::new(),
            time_critical_senders: UniqueQueue::new(),
            receivers_needing_reports: UniqueQueue::new(),
            first_pass_senders: UniqueQueue::new(),
            recently_closed_receptions: VecDeque::new(),
            recently_closed_reception_set: FxHashSet::default(),
            rate_limiter,
            parked_packet: None,
            last_refill: None,
            num_in_flight_send_calls: 0,
            has_send_error: false,
            link_status: LinkStatus::Unknown,
            ping_session_number: None,
            last_outbound_activity: None,
            disk,
            pending_disk_operations: Vec::new(),
            pending_disk_transmissions: FxHashMap::default(),
            config,
        })
    }

    pub fn config(&self) -> &LtpEngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &LtpEngineStats {
        &self.stats
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link_status
    }

    pub fn num_active_senders(&self) -> usize {
        self.senders.len()
    }

    pub fn num_active_receivers(&self) -> usize {
        self.receivers.len()
    }

    pub fn num_in_flight_send_calls(&self) -> usize {
        self.num_in_flight_send_calls
    }

    fn notify(&self, notice: LtpNotice) {
        if self.notices.send(notice).is_err() {
            trace!("notice receiver was dropped");
        }
    }

    fn fail_request(&self, request: TransmissionRequest) {
        self.notify(LtpNotice::FailedBundleSend {
            data: Some(request.data),
            user_data: request.user_data,
            is_success_callback_already_called: false,
        });
    }

    /// Starts a new outbound session. Failures are reported through a [LtpNotice::FailedBundleSend].
    pub fn transmission_request(&mut self, request: TransmissionRequest, now: Instant) {
        if request.destination_engine_id != self.config.remote_engine_id {
            warn!("transmission request for engine {}, but this engine's peer is {}", request.destination_engine_id, self.config.remote_engine_id);
            self.fail_request(request);
            return;
        }
        if request.data.is_empty() {
            warn!("transmission request without data");
            self.fail_request(request);
            return;
        }
        if self.senders.len() + self.pending_disk_transmissions.len() >= self.config.max_simultaneous_sessions {
            warn!("refusing transmission request: {} outbound sessions are active already", self.senders.len());
            self.fail_request(request);
            return;
        }

        let senders = &self.senders;
        let pending = &self.pending_disk_transmissions;
        let ping = self.ping_session_number;
        let session_number = self.rng.next_unused_session_number(|n| senders.contains_key(&n) || pending.contains_key(&n) || ping == Some(n));

        let is_offloaded = self.config.active_session_data_on_disk.as_ref()
            .is_some_and(|d| request.data.len() as u64 >= d.threshold_bytes);
        if let (true, Some(disk)) = (is_offloaded, &mut self.disk) {
            // the session starts once the block is safely on disk
            let slice = disk.allocate(request.data.len() as u64, now);
            debug!("writing block of {} bytes for session number {:#x} to disk", request.data.len(), session_number);
            self.pending_disk_operations.push(DiskOperation::write(DiskOperationToken::SenderBlockWrite(session_number), &slice, request.data.clone()));
            self.pending_disk_transmissions.insert(session_number, PendingDiskTransmission { request, slice });
            return;
        }

        let data = SenderData::Memory(request.data.clone());
        self.start_sender(session_number, request, data, false);
    }

    fn start_sender(&mut self, session_number: u64, request: TransmissionRequest, data: SenderData, is_success_callback_already_called: bool) {
        let session_id = SessionId::new(self.config.this_engine_id, session_number);
        let sender = SessionSender::new(SenderParams {
            session_id,
            client_service_id: request.destination_client_service_id,
            data,
            length: request.data.len() as u64,
            red_length: request.red_length,
            user_data: request.user_data,
            first_checkpoint_serial_number: self.rng.next_serial_number(),
            is_success_callback_already_called,
        });
        debug!("{:?}: starting transmission of {} bytes ({} red)", session_id, request.data.len(), request.red_length.min(request.data.len() as u64));

        self.senders.insert(session_number, sender);
        self.first_pass_senders.push_back(session_number);
        self.notify(LtpNotice::SessionStart { session_id, is_sender: true });
    }

    fn on_sender_block_written(&mut self, session_number: u64, success: bool) {
        let Some(pending) = self.pending_disk_transmissions.remove(&session_number) else {
            warn!("disk write completed for unknown session number {:#x}", session_number);
            return;
        };
        if !success {
            self.release_disk_slice(&pending.slice);
            self.fail_request(pending.request);
            return;
        }
        self.success_backlog.push_back(pending.request.user_data.clone());
        self.start_sender(session_number, pending.request, SenderData::Disk(pending.slice), true);
    }

    /// Cancels an active session of either direction. Returns false if there is no such session
    ///  or it is finished already.
    pub fn cancellation_request(&mut self, session_id: SessionId, now: Instant) -> bool {
        let result = if session_id.originator_engine_id == self.config.this_engine_id {
            match self.senders.get_mut(&session_id.session_number) {
                Some(sender) => {
                    let mut ctx = session_context!(self, now);
                    sender.cancel(CancelSegmentReasonCode::UserCancelled, true, &mut ctx)
                }
                None => false,
            }
        }
        else {
            match self.receivers.get_mut(&session_id) {
                Some(receiver) => {
                    let mut ctx = session_context!(self, now);
                    receiver.cancel(CancelSegmentReasonCode::UserCancelled, true, &mut ctx)
                }
                None => false,
            }
        };

        if !result {
            debug!("{:?}: cancellation requested for unknown session", session_id);
        }
        self.process_events();
        result
    }

    /// Processes a single inbound datagram. Returns `Ok(true)` if processing continues
    ///  asynchronously - a [LtpNotice::PacketInFullyProcessed] follows when it is done.
    pub fn packet_in(&mut self, packet: Bytes, now: Instant) -> Result<bool, SegmentParseError> {
        let segment = match Segment::parse(packet) {
            Ok(segment) => segment,
            Err(e) => {
                error!("dropping malformed segment: {}", e);
                self.stats.malformed_segments += 1;
                return Err(e);
            }
        };

        let session_id = segment.session_id;
        trace!("{:?}: received {:?}", session_id, segment.content.segment_type());

        let is_operation_ongoing = match segment.content {
            SegmentContent::Data(data) => self.on_data_segment(session_id, data, now),
            SegmentContent::Report(report) => {
                self.on_report_segment(session_id, report, now);
                false
            }
            SegmentContent::ReportAck { report_serial_number } => {
                self.on_report_ack(session_id, report_serial_number, now);
                false
            }
            SegmentContent::CancelFromSender(reason) => {
                self.on_cancel_from_sender(session_id, reason, now);
                false
            }
            SegmentContent::CancelFromReceiver(reason) => {
                self.on_cancel_from_receiver(session_id, reason, now);
                false
            }
            SegmentContent::CancelAckToSender | SegmentContent::CancelAckToReceiver => {
                self.on_cancel_ack(session_id);
                false
            }
        };

        self.process_events();
        Ok(is_operation_ongoing)
    }

    fn is_outbound_session(&self, session_id: SessionId) -> bool {
        session_id.originator_engine_id == self.config.this_engine_id
    }

    fn on_data_segment(&mut self, session_id: SessionId, data: DataSegment, now: Instant) -> bool {
        if session_id.originator_engine_id != self.config.remote_engine_id {
            warn!("{:?}: data segment from unexpected engine - dropping", session_id);
            return false;
        }

        if !self.receivers.contains_key(&session_id) && !self.create_receiver(session_id, &data, now) {
            return false;
        }

        match self.receivers.get_mut(&session_id) {
            Some(receiver) => {
                let mut ctx = session_context!(self, now);
                receiver.on_data_segment(data, &mut ctx)
            }
            None => false,
        }
    }

    /// returns false if the segment is to be dropped
    fn create_receiver(&mut self, session_id: SessionId, data: &DataSegment, now: Instant) -> bool {
        if self.recently_closed_reception_set.contains(&session_id) {
            trace!("{:?}: dropping data segment for closed session", session_id);
            self.stats.rejected_recreated_sessions += 1;
            return false;
        }
        if self.timers.cancel.contains(&session_id) {
            trace!("{:?}: dropping data segment for session that is being cancelled", session_id);
            return false;
        }

        if !self.config.accepts_client_service_id(data.client_service_id) {
            warn!("{:?}: data segment for unknown client service {} - cancelling", session_id, data.client_service_id);
            self.refuse_reception(session_id, CancelSegmentReasonCode::Unreachable);
            return false;
        }
        if self.receivers.len() >= self.config.max_simultaneous_sessions {
            warn!("{:?}: {} inbound sessions are active already - cancelling", session_id, self.receivers.len());
            self.refuse_reception(session_id, CancelSegmentReasonCode::SystemCancelled);
            return false;
        }

        let disk = match &mut self.disk {
            Some(disk) => Some(disk.allocate(self.config.max_red_rx_bytes_per_session, now)),
            None => None,
        };
        debug!("{:?}: starting reception", session_id);
        self.receivers.insert(session_id, SessionReceiver::new(ReceiverParams {
            session_id,
            client_service_id: data.client_service_id,
            first_report_serial_number: self.rng.next_serial_number(),
            disk,
            now,
        }));
        self.notify(LtpNotice::SessionStart { session_id, is_sender: false });
        true
    }

    /// cancels an inbound session that never got a receiver
    fn refuse_reception(&mut self, session_id: SessionId, reason: CancelSegmentReasonCode) {
        self.remember_closed_reception(session_id);
        self.cancel_requests.push_back(CancelRequest { session_id, reason, is_from_sender: false, retry_count: 0 });
    }

    fn remember_closed_reception(&mut self, session_id: SessionId) {
        let history_size = self.config.rx_session_recreation_preventer_history_size;
        if history_size == 0 || !self.recently_closed_reception_set.insert(session_id) {
            return;
        }
        self.recently_closed_receptions.push_back(session_id);
        while self.recently_closed_receptions.len() > history_size {
            if let Some(oldest) = self.recently_closed_receptions.pop_front() {
                self.recently_closed_reception_set.remove(&oldest);
            }
        }
    }

    fn on_report_segment(&mut self, session_id: SessionId, report: ReportSegment, now: Instant) {
        self.stats.report_segments_received += 1;

        let sender = match self.is_outbound_session(session_id) {
            true => self.senders.get_mut(&session_id.session_number),
            false => None,
        };
        match sender {
            Some(sender) => {
                let mut ctx = session_context!(self, now);
                sender.on_report_segment(&report, &mut ctx);
            }
            None => {
                // the session may have completed while the report was in transit
                debug!("{:?}: report segment for unknown session - acknowledging it", session_id);
                self.closed_session_segments.push_back(Segment::new(session_id, SegmentContent::ReportAck {
                    report_serial_number: report.report_serial_number,
                }));
            }
        }
    }

    fn on_report_ack(&mut self, session_id: SessionId, report_serial_number: u64, now: Instant) {
        match self.receivers.get_mut(&session_id) {
            Some(receiver) => {
                let mut ctx = session_context!(self, now);
                receiver.on_report_ack(report_serial_number, &mut ctx);
            }
            None => trace!("{:?}: report ack for unknown session", session_id),
        }
    }

    fn on_cancel_from_sender(&mut self, session_id: SessionId, reason: CancelSegmentReasonCode, now: Instant) {
        if let Some(receiver) = self.receivers.get_mut(&session_id) {
            debug!("{:?}: reception cancelled by sender: {:?}", session_id, reason);
            let mut ctx = session_context!(self, now);
            receiver.cancel(reason, false, &mut ctx);
        }
        self.timers.cancel.delete_timer(&session_id);
        self.closed_session_segments.push_back(Segment::new(session_id, SegmentContent::CancelAckToSender));
    }

    fn on_cancel_from_receiver(&mut self, session_id: SessionId, reason: CancelSegmentReasonCode, now: Instant) {
        let sender = match self.is_outbound_session(session_id) {
            true => self.senders.get_mut(&session_id.session_number),
            false => None,
        };
        if let Some(sender) = sender {
            debug!("{:?}: transmission cancelled by receiver: {:?}", session_id, reason);
            let mut ctx = session_context!(self, now);
            sender.cancel(reason, false, &mut ctx);
        }
        self.timers.cancel.delete_timer(&session_id);
        self.closed_session_segments.push_back(Segment::new(session_id, SegmentContent::CancelAckToReceiver));
    }

    fn on_cancel_ack(&mut self, session_id: SessionId) {
        if self.timers.cancel.delete_timer(&session_id).is_none() {
            trace!("{:?}: redundant cancel ack", session_id);
            return;
        }
        if self.is_ping_session(session_id) {
            self.ping_session_number = None;
            self.set_link_status(LinkStatus::Up);
        }
    }

    fn is_ping_session(&self, session_id: SessionId) -> bool {
        self.is_outbound_session(session_id) && self.ping_session_number == Some(session_id.session_number)
    }

    fn set_link_status(&mut self, link_status: LinkStatus) {
        if self.link_status == link_status {
            return;
        }
        info!("link to engine {} is {:?}", self.config.remote_engine_id, link_status);
        self.link_status = link_status;
        self.notify(LtpNotice::OutductLinkStatusChanged { is_link_down: link_status == LinkStatus::Down });
    }

    /// Dispatches the events sessions recorded, leaving the resulting work in the engine's queues
    fn process_events(&mut self) {
        for event in std::mem::take(&mut self.events) {
            match event {
                SessionEvent::SenderNeedsDeleted { session_number, cancel_reason } => {
                    self.sender_deletions.push_back((session_number, cancel_reason));
                }
                SessionEvent::ReceiverNeedsDeleted { session_id, cancel_reason } => {
                    let has_disk_operations = self.receivers.get(&session_id)
                        .is_some_and(|r| r.outstanding_disk_operations() > 0);
                    if has_disk_operations {
                        self.unsafe_receiver_deletions.push_back((session_id, cancel_reason));
                    }
                    else {
                        self.receiver_deletions.push_back((session_id, cancel_reason));
                    }
                }
                SessionEvent::SenderHasTimeCriticalData { session_number } => {
                    self.time_critical_senders.push_back(session_number);
                }
                SessionEvent::ReceiverHasReportData { session_id } => {
                    self.receivers_needing_reports.push_back(session_id);
                }
                SessionEvent::ClosedSessionSegment(segment) => {
                    self.closed_session_segments.push_back(segment);
                }
                SessionEvent::ReceiverDiskWrite { session_id, slice, data } => {
                    self.pending_disk_operations.push(DiskOperation::write(DiskOperationToken::ReceiverSegmentWrite(session_id), &slice, data));
                }
                SessionEvent::ReceiverDiskRead { session_id, slice } => {
                    self.pending_disk_operations.push(DiskOperation::read(DiskOperationToken::ReceiverRedPartRead(session_id), &slice));
                }
                SessionEvent::Notice(notice) => self.notify(notice),
            }
        }
    }

    fn release_disk_slice(&mut self, slice: &DiskSlice) {
        if let Some(disk) = &mut self.disk {
            disk.release(slice);
            for path in disk.take_files_to_delete() {
                self.pending_disk_operations.push(DiskOperation::delete(path));
            }
        }
    }

    fn drain_sender_deletions(&mut self) {
        while let Some((session_number, cancel_reason)) = self.sender_deletions.pop_front() {
            let Some(mut sender) = self.senders.remove(&session_number) else {
                continue;
            };
            debug!("{:?}: deleting sender", sender.session_id());
            sender.delete_timers(&mut self.timers);
            if let Some(slice) = sender.disk_slice() {
                self.release_disk_slice(slice);
            }
            if let Some(reason) = cancel_reason {
                self.cancel_requests.push_back(CancelRequest { session_id: sender.session_id(), reason, is_from_sender: true, retry_count: 0 });
            }
        }
    }

    fn drain_receiver_deletions(&mut self) {
        for _ in 0..self.unsafe_receiver_deletions.len() {
            let Some(entry) = self.unsafe_receiver_deletions.pop_front() else {
                break;
            };
            let is_safe = self.receivers.get(&entry.0)
                .map_or(true, |r| r.outstanding_disk_operations() == 0);
            if is_safe {
                self.receiver_deletions.push_back(entry);
            }
            else {
                self.unsafe_receiver_deletions.push_back(entry);
            }
        }

        while let Some((session_id, cancel_reason)) = self.receiver_deletions.pop_front() {
            let Some(mut receiver) = self.receivers.remove(&session_id) else {
                continue;
            };
            debug!("{:?}: deleting receiver", session_id);
            receiver.delete_timers(&mut self.timers);
            if let Some(slice) = receiver.disk_slice() {
                self.release_disk_slice(slice);
            }
            self.remember_closed_reception(session_id);
            if let Some(reason) = cancel_reason {
                self.cancel_requests.push_back(CancelRequest { session_id, reason, is_from_sender: false, retry_count: 0 });
            }
        }
    }

    fn has_control_work(&self) -> bool {
        !self.sender_deletions.is_empty()
            || !self.success_backlog.is_empty()
            || !self.receiver_deletions.is_empty()
            || !self.cancel_requests.is_empty()
            || !self.closed_session_segments.is_empty()
    }

    /// Produces batches of packets for as many send calls as there are free in-flight slots. The
    ///  caller must report completion of each batch through [LtpEngine::on_send_packets_completed].
    pub fn pump_send_pipeline(&mut self, now: Instant) -> Vec<Vec<OutboundPacket>> {
        let mut result = Vec::new();
        while self.num_in_flight_send_calls < self.config.max_in_flight_send_system_calls {
            let mut batch = Vec::new();
            while batch.len() < self.config.max_packets_per_send_system_call {
                match self.next_packet_to_send(now) {
                    Some(packet) => batch.push(packet),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            self.num_in_flight_send_calls += 1;
            result.push(batch);
        }

        // finished sessions are cleaned up even if all send slots are taken
        self.drain_sender_deletions();
        self.drain_receiver_deletions();
        result
    }

    fn next_packet_to_send(&mut self, now: Instant) -> Option<OutboundPacket> {
        loop {
            self.drain_sender_deletions();
            while let Some(user_data) = self.success_backlog.pop_front() {
                self.notify(LtpNotice::SuccessfulBundleSend { user_data });
            }
            self.drain_receiver_deletions();

            while let Some(request) = self.cancel_requests.pop_front() {
                if let Some(packet) = self.start_cancel_segment(request, now) {
                    return Some(packet);
                }
            }

            if let Some(segment) = self.closed_session_segments.pop_front() {
                trace!("{:?}: sending {:?} for closed session", segment.session_id, segment.content.segment_type());
                return Some(to_packet(OutboundSegment::control(segment)));
            }

            if let Some(parked) = self.parked_packet.take() {
                return self.pay_for(parked);
            }
            if self.rate_limiter.as_ref().is_some_and(|r| !r.can_take_tokens()) {
                return None;
            }

            if let Some(packet) = self.next_time_critical_packet(now) {
                self.last_outbound_activity = Some(now);
                return self.pay_for(packet);
            }
            if let Some(packet) = self.next_report_packet(now) {
                return self.pay_for(packet);
            }
            if let Some(packet) = self.next_first_pass_packet(now) {
                self.last_outbound_activity = Some(now);
                return self.pay_for(packet);
            }

            // producing data may have finished sessions, which takes precedence again
            if !self.has_control_work() {
                return None;
            }
        }
    }

    fn start_cancel_segment(&mut self, request: CancelRequest, now: Instant) -> Option<OutboundPacket> {
        let timer_data = CancelTimerData {
            reason: request.reason,
            is_from_sender: request.is_from_sender,
            retry_count: request.retry_count,
        };
        if !self.timers.cancel.start_timer(request.session_id, now, self.config.round_trip_time(), timer_data) {
            trace!("{:?}: cancel segment is in progress already", request.session_id);
            return None;
        }

        debug!("{:?}: sending cancel segment {:?} (retry {})", request.session_id, request.reason, request.retry_count);
        let content = match request.is_from_sender {
            true => SegmentContent::CancelFromSender(request.reason),
            false => SegmentContent::CancelFromReceiver(request.reason),
        };
        Some(to_packet(OutboundSegment::control(Segment::new(request.session_id, content))))
    }

    /// Returns the packet if the token bucket can pay for it, parks it otherwise
    fn pay_for(&mut self, packet: OutboundPacket) -> Option<OutboundPacket> {
        if let Some(rate_limiter) = &mut self.rate_limiter {
            if !rate_limiter.take_tokens(packet.len) {
                trace!("rate limit reached - parking packet of {} bytes", packet.len);
                self.parked_packet = Some(packet);
                return None;
            }
        }
        Some(packet)
    }

    fn next_time_critical_packet(&mut self, now: Instant) -> Option<OutboundPacket> {
        while let Some(&session_number) = self.time_critical_senders.front() {
            let Some(sender) = self.senders.get_mut(&session_number) else {
                self.time_critical_senders.pop_front();
                continue;
            };
            let mut ctx = session_context!(self, now);
            let segment = sender.next_time_critical_segment(&mut ctx);
            if !sender.has_time_critical_data() {
                self.time_critical_senders.pop_front();
            }
            self.process_events();

            if let Some(segment) = segment {
                return Some(self.sender_packet(segment));
            }
        }
        None
    }

    /// Packets with disk-backed data hold a reference to their data file until the send
    ///  completes, so the file outlives the session if it finishes before its last packets are
    ///  sent.
    fn sender_packet(&mut self, segment: OutboundSegment) -> OutboundPacket {
        if let (Some(slice), Some(disk)) = (&segment.disk_data, &mut self.disk) {
            disk.retain(slice);
        }
        to_packet(segment)
    }

    fn next_report_packet(&mut self, now: Instant) -> Option<OutboundPacket> {
        while let Some(&session_id) = self.receivers_needing_reports.front() {
            let Some(receiver) = self.receivers.get_mut(&session_id) else {
                self.receivers_needing_reports.pop_front();
                continue;
            };
            let mut ctx = session_context!(self, now);
            let segment = receiver.next_report_segment(&mut ctx);
            if !receiver.has_report_data() {
                self.receivers_needing_reports.pop_front();
            }
            self.process_events();

            if let Some(segment) = segment {
                return Some(to_packet(OutboundSegment::control(segment)));
            }
        }
        None
    }

    fn next_first_pass_packet(&mut self, now: Instant) -> Option<OutboundPacket> {
        while let Some(&session_number) = self.first_pass_senders.front() {
            let Some(sender) = self.senders.get_mut(&session_number) else {
                self.first_pass_senders.pop_front();
                continue;
            };

            if self.has_send_error {
                self.first_pass_senders.pop_front();
                let mut ctx = session_context!(self, now);
                sender.cancel(CancelSegmentReasonCode::SystemCancelled, false, &mut ctx);
                self.process_events();
                continue;
            }

            let mut ctx = session_context!(self, now);
            let segment = sender.next_first_pass_segment(&mut ctx);
            if !sender.has_first_pass_data() {
                self.first_pass_senders.pop_front();
            }
            self.process_events();

            if let Some(segment) = segment {
                return Some(self.sender_packet(segment));
            }
        }
        None
    }

    /// Called exactly once per batch returned from [LtpEngine::pump_send_pipeline], with the
    ///  batch's [OutboundPacket::disk_slices] whether or not they could be read. A failure sets
    ///  a sticky error flag: first-pass data is not sent until [LtpEngine::on_transport_recovered].
    pub fn on_send_packets_completed(&mut self, result: anyhow::Result<()>, sent_disk_slices: &[DiskSlice]) {
        self.num_in_flight_send_calls = self.num_in_flight_send_calls.saturating_sub(1);
        for slice in sent_disk_slices {
            self.release_disk_slice(slice);
        }
        if let Err(e) = result {
            if !self.has_send_error {
                error!("sending to engine {} failed, dropping queued transmissions until the transport recovers: {}", self.config.remote_engine_id, e);
                self.has_send_error = true;
            }
        }
    }

    pub fn on_transport_recovered(&mut self) {
        if self.has_send_error {
            info!("transport to engine {} recovered", self.config.remote_engine_id);
            self.has_send_error = false;
        }
    }

    /// A data segment of a disk-backed transmission could not be read for sending
    pub fn on_segment_disk_read_failed(&mut self, session_number: u64, now: Instant) {
        if let Some(sender) = self.senders.get_mut(&session_number) {
            error!("{:?}: reading session data from disk failed", sender.session_id());
            let mut ctx = session_context!(self, now);
            sender.cancel(CancelSegmentReasonCode::SystemCancelled, true, &mut ctx);
        }
        self.process_events();
    }

    pub fn next_timer_expiry(&self) -> Option<Instant> {
        self.timers.next_expiry()
    }

    pub fn on_timers_expired(&mut self, now: Instant) {
        while let Some(((session_id, _), timer_data)) = self.timers.checkpoint.pop_expired(now) {
            if let Some(sender) = self.senders.get_mut(&session_id.session_number) {
                let mut ctx = session_context!(self, now);
                sender.on_checkpoint_timer_expired(timer_data, &mut ctx);
            }
            self.process_events();
        }

        while let Some(((session_id, _), timer_data)) = self.timers.report.pop_expired(now) {
            if let Some(receiver) = self.receivers.get_mut(&session_id) {
                let mut ctx = session_context!(self, now);
                receiver.on_report_timer_expired(timer_data, &mut ctx);
            }
            self.process_events();
        }

        while let Some((session_id, timer_data)) = self.timers.cancel.pop_expired(now) {
            self.on_cancel_timer_expired(session_id, timer_data);
        }

        while let Some((key, ())) = self.timers.delayed_send.pop_expired(now) {
            match key {
                DelayedSendKey::SenderDataSegments(session_id) => {
                    if let Some(sender) = self.senders.get_mut(&session_id.session_number) {
                        let mut ctx = session_context!(self, now);
                        sender.on_delayed_resend_timer_expired(&mut ctx);
                    }
                }
                DelayedSendKey::ReceiverReport(session_id) => {
                    if let Some(receiver) = self.receivers.get_mut(&session_id) {
                        let mut ctx = session_context!(self, now);
                        receiver.on_delayed_report_timer_expired(&mut ctx);
                    }
                }
            }
            self.process_events();
        }
    }

    fn on_cancel_timer_expired(&mut self, session_id: SessionId, timer_data: CancelTimerData) {
        self.stats.cancel_timer_expiries += 1;
        if timer_data.retry_count < self.config.max_retries_per_serial_number {
            self.cancel_requests.push_back(CancelRequest {
                session_id,
                reason: timer_data.reason,
                is_from_sender: timer_data.is_from_sender,
                retry_count: timer_data.retry_count + 1,
            });
            return;
        }

        debug!("{:?}: cancel segment was never acknowledged - giving up", session_id);
        if self.is_ping_session(session_id) {
            self.ping_session_number = None;
            self.set_link_status(LinkStatus::Down);
        }
    }

    /// Periodic maintenance: cancels stagnant receptions and pings the link if there was no
    ///  outbound activity for a while
    pub fn housekeeping(&mut self, now: Instant) {
        let timeout = self.config.stagnant_receiver_timeout();
        let stagnant = self.receivers.values()
            .filter(|r| !r.is_finished() && r.is_stagnant(now, timeout))
            .map(|r| r.session_id())
            .collect::<Vec<_>>();
        for session_id in stagnant {
            if let Some(receiver) = self.receivers.get_mut(&session_id) {
                debug!("{:?}: reception is stagnant - cancelling", session_id);
                let mut ctx = session_context!(self, now);
                if receiver.cancel(CancelSegmentReasonCode::UserCancelled, true, &mut ctx) {
                    ctx.stats.stagnant_receivers_cancelled += 1;
                }
            }
        }
        self.process_events();

        self.maybe_send_ping(now);
    }

    fn maybe_send_ping(&mut self, now: Instant) {
        let Some(ping_interval) = self.config.sender_ping_interval else {
            return;
        };
        let Some(last_activity) = self.last_outbound_activity else {
            self.last_outbound_activity = Some(now);
            return;
        };
        if self.ping_session_number.is_some() || now.saturating_duration_since(last_activity) < ping_interval {
            return;
        }

        let senders = &self.senders;
        let pending = &self.pending_disk_transmissions;
        let session_number = self.rng.next_unused_session_number(|n| senders.contains_key(&n) || pending.contains_key(&n));
        let session_id = SessionId::new(self.config.this_engine_id, session_number);
        debug!("{:?}: no outbound activity for {:?} - pinging", session_id, ping_interval);

        self.ping_session_number = Some(session_number);
        self.last_outbound_activity = Some(now);
        self.cancel_requests.push_back(CancelRequest {
            session_id,
            reason: CancelSegmentReasonCode::UserCancelled,
            is_from_sender: true,
            retry_count: 0,
        });
    }

    pub fn refill_rate_limiter(&mut self, now: Instant) {
        let Some(rate_limiter) = &mut self.rate_limiter else {
            return;
        };
        if let Some(last_refill) = self.last_refill {
            rate_limiter.add_time(now.saturating_duration_since(last_refill));
        }
        self.last_refill = Some(now);
    }

    /// Changes the send rate at runtime. 0 turns rate limiting off.
    pub fn set_max_send_rate_bits_per_sec(&mut self, bits_per_sec: u64) {
        self.config.max_send_rate_bits_per_sec = bits_per_sec;
        let rate = self.config.max_send_rate_bytes_per_sec();
        let window = self.config.rate_limit_refill_interval;
        let burst_window = self.config.rate_limit_burst_window();
        if rate == 0 {
            self.rate_limiter = None;
            return;
        }
        if let Some(rate_limiter) = &mut self.rate_limiter {
            rate_limiter.set_rate(rate, window, burst_window);
        }
        else {
            self.rate_limiter = Some(new_rate_limiter(&self.config, rate));
        }
    }

    /// Re-tunes the round trip estimate, shifting all running round trip timers by the difference
    pub fn set_one_way_light_and_margin_time(&mut self, one_way_light_time: Duration, one_way_margin_time: Duration) {
        let old_rtt = self.config.round_trip_time();
        self.config.one_way_light_time = one_way_light_time;
        self.config.one_way_margin_time = one_way_margin_time;
        let new_rtt = self.config.round_trip_time();

        info!("round trip time to engine {} changed from {:?} to {:?}", self.config.remote_engine_id, old_rtt, new_rtt);
        let adjustment = if new_rtt >= old_rtt {
            TimerAdjustment::Later(new_rtt - old_rtt)
        }
        else {
            TimerAdjustment::Earlier(old_rtt - new_rtt)
        };
        self.timers.adjust_round_trip_timers(adjustment);
    }

    /// disk operations to be executed, including deletion of data files that are no longer used
    pub fn take_disk_operations(&mut self) -> Vec<DiskOperation> {
        std::mem::take(&mut self.pending_disk_operations)
    }

    pub fn on_disk_operation_completed(&mut self, token: DiskOperationToken, result: anyhow::Result<Option<Bytes>>, now: Instant) {
        if let Err(e) = &result {
            error!("disk operation {:?} failed: {}", token, e);
        }

        match token {
            DiskOperationToken::SenderBlockWrite(session_number) => {
                self.on_sender_block_written(session_number, result.is_ok());
            }
            DiskOperationToken::ReceiverSegmentWrite(session_id) => {
                match self.receivers.get_mut(&session_id) {
                    Some(receiver) => {
                        let mut ctx = session_context!(self, now);
                        receiver.on_disk_write_completed(result.is_ok(), &mut ctx);
                    }
                    None => self.notify(LtpNotice::PacketInFullyProcessed { success: result.is_ok() }),
                }
            }
            DiskOperationToken::ReceiverRedPartRead(session_id) => {
                if let Some(receiver) = self.receivers.get_mut(&session_id) {
                    let mut ctx = session_context!(self, now);
                    receiver.on_disk_read_completed(result.ok().flatten(), &mut ctx);
                }
            }
            DiskOperationToken::FileDelete => {}
        }
        self.process_events();
    }
}

fn new_rate_limiter(config: &LtpEngineConfig, rate_bytes_per_second: u64) -> TokenRateLimiter {
    TokenRateLimiter::new(rate_bytes_per_second, config.rate_limit_refill_interval, config.rate_limit_burst_window())
        .with_min_capacity_bytes(config.max_segment_size() as u64)
}

fn to_packet(outbound: OutboundSegment) -> OutboundPacket {
    let OutboundSegment { segment, disk_data } = outbound;
    let disk_session_number = disk_data.as_ref().map(|_| segment.session_id.session_number);

    let parts = match disk_data {
        Some(slice) => {
            let (head, trailer) = segment.encode_framing();
            let mut parts = vec![PacketPart::Memory(head), PacketPart::Disk(slice)];
            if !trailer.is_empty() {
                parts.push(PacketPart::Memory(trailer));
            }
            parts
        }
        None => segment.encode().into_iter()
            .map(PacketPart::Memory)
            .collect(),
    };

    OutboundPacket {
        len: parts.iter().map(PacketPart::len).sum(),
        parts,
        disk_session_number,
    }
}
