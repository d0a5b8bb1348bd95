use bytes::Bytes;
use crate::segment::CancelSegmentReasonCode;
use crate::session_id::SessionId;

/// Notifications for the client service. They are delivered from the engine's event loop
///  through an unbounded channel, so a slow consumer never blocks the engine.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LtpNotice {
    SessionStart {
        session_id: SessionId,
        is_sender: bool,
    },
    /// the complete red part of an inbound session was received. This is delivered exactly once
    ///  per session.
    RedPartReception {
        session_id: SessionId,
        client_service_id: u64,
        data: Bytes,
        is_end_of_block: bool,
    },
    /// green data is delivered per segment, as it arrives and without any guarantees
    GreenPartSegmentArrival {
        session_id: SessionId,
        client_service_id: u64,
        offset: u64,
        data: Bytes,
        is_end_of_block: bool,
    },
    /// the red part of an outbound session was fully acknowledged by the peer (or the first pass
    ///  was sent for sessions without a red part)
    TransmissionSessionCompleted {
        session_id: SessionId,
        user_data: Bytes,
    },
    TransmissionSessionCancelled {
        session_id: SessionId,
        reason: CancelSegmentReasonCode,
    },
    ReceptionSessionCancelled {
        session_id: SessionId,
        reason: CancelSegmentReasonCode,
    },
    /// all data of an outbound session was sent at least once
    InitialTransmissionCompleted {
        session_id: SessionId,
    },
    OutductLinkStatusChanged {
        is_link_down: bool,
    },
    /// The block was delivered - or, for blocks that are kept on disk while they are being
    ///  transmitted, it is safely stored and the client service need not keep it anymore.
    SuccessfulBundleSend {
        user_data: Bytes,
    },
    /// The block could not be delivered. The data is handed back if the engine holds it in memory.
    ///  `is_success_callback_already_called` is set for disk-backed blocks that were reported as
    ///  successfully sent before, so the client service can undo its bookkeeping.
    FailedBundleSend {
        data: Option<Bytes>,
        user_data: Bytes,
        is_success_callback_already_called: bool,
    },
    /// processing of an inbound segment finished asynchronously after `packet_in` returned
    ///  'operation ongoing'
    PacketInFullyProcessed {
        success: bool,
    },
}
