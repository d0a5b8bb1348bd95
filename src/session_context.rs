use tokio::time::Instant;
use bytes::Bytes;
use crate::config::LtpEngineConfig;
use crate::disk::DiskSlice;
use crate::notices::LtpNotice;
use crate::segment::{CancelSegmentReasonCode, CheckpointSerials, ReportSegment, Segment};
use crate::session_id::SessionId;
use crate::stats::LtpEngineStats;
use crate::timer_manager::{TimerAdjustment, TimerManager};

/// A checkpoint that was sent and is waiting for a report
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CheckpointTimerData {
    pub offset: u64,
    pub length: u64,
    pub serials: CheckpointSerials,
    pub retry_count: u32,
}

/// A report that was sent and is waiting for a report acknowledgement
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReportTimerData {
    pub report: ReportSegment,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CancelTimerData {
    pub reason: CancelSegmentReasonCode,
    pub is_from_sender: bool,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DelayedSendKey {
    SenderDataSegments(SessionId),
    ReceiverReport(SessionId),
}

/// The engine's four timer pools. Checkpoint and report timers are keyed by session and serial
///  number, so a session can have several of them running at the same time.
pub struct EngineTimers {
    pub checkpoint: TimerManager<(SessionId, u64), CheckpointTimerData>,
    pub report: TimerManager<(SessionId, u64), ReportTimerData>,
    pub cancel: TimerManager<SessionId, CancelTimerData>,
    pub delayed_send: TimerManager<DelayedSendKey, ()>,
}

impl EngineTimers {
    pub fn new() -> EngineTimers {
        EngineTimers {
            checkpoint: TimerManager::new(),
            report: TimerManager::new(),
            cancel: TimerManager::new(),
            delayed_send: TimerManager::new(),
        }
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        [
            self.checkpoint.next_expiry(),
            self.report.next_expiry(),
            self.cancel.next_expiry(),
            self.delayed_send.next_expiry(),
        ].into_iter()
            .flatten()
            .min()
    }

    /// Timers that wait for a round trip are shifted, delayed sends are not
    pub fn adjust_round_trip_timers(&mut self, adjustment: TimerAdjustment) {
        self.checkpoint.adjust_running_timers(adjustment);
        self.report.adjust_running_timers(adjustment);
        self.cancel.adjust_running_timers(adjustment);
    }
}

/// Things sessions need the engine to do on their behalf
#[derive(Debug)]
pub enum SessionEvent {
    /// `cancel_reason` is set if the peer needs to be notified with a cancel segment
    SenderNeedsDeleted {
        session_number: u64,
        cancel_reason: Option<CancelSegmentReasonCode>,
    },
    ReceiverNeedsDeleted {
        session_id: SessionId,
        cancel_reason: Option<CancelSegmentReasonCode>,
    },
    SenderHasTimeCriticalData {
        session_number: u64,
    },
    ReceiverHasReportData {
        session_id: SessionId,
    },
    /// a segment that must go out even though the session that produced it is closing
    ClosedSessionSegment(Segment),
    ReceiverDiskWrite {
        session_id: SessionId,
        slice: DiskSlice,
        data: Bytes,
    },
    ReceiverDiskRead {
        session_id: SessionId,
        slice: DiskSlice,
    },
    Notice(LtpNotice),
}

/// Engine state that sessions operate on. Sessions never call back into the engine, they
///  record [SessionEvent]s that the engine processes after each call.
pub struct SessionContext<'a> {
    pub config: &'a LtpEngineConfig,
    pub now: Instant,
    pub timers: &'a mut EngineTimers,
    pub events: &'a mut Vec<SessionEvent>,
    pub stats: &'a mut LtpEngineStats,
}

impl SessionContext<'_> {
    pub fn notify(&mut self, notice: LtpNotice) {
        self.events.push(SessionEvent::Notice(notice));
    }
}

/// Borrows the engine's fields that make up a [SessionContext] individually, so the context can
///  coexist with a mutable borrow of one of the session maps
macro_rules! session_context {
    ($engine:expr, $now:expr) => {
        $crate::session_context::SessionContext {
            config: &$engine.config,
            now: $now,
            timers: &mut $engine.timers,
            events: &mut $engine.events,
            stats: &mut $engine.stats,
        }
    };
}
pub(crate) use session_context;
