//! The event loop that owns an [LtpEngine].
//!
//! The engine itself is a synchronous state machine. This module runs it on a single tokio task
//!  and marshals everything else into that task through an unbounded command channel: client
//!  requests and inbound packets via [EngineHandle], and completions of transport sends and disk
//!  operations, which run on spawned tasks.

use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::{select, time};
use tracing::{debug, error, info};
use crate::config::LtpEngineConfig;
use crate::disk::{read_at, DiskOperationToken, DiskSlice};
use crate::engine::{LtpEngine, OutboundPacket, PacketPart, TransmissionRequest};
use crate::notices::LtpNotice;
use crate::session_id::SessionId;
use crate::transport::LtpTransport;

#[derive(Debug)]
pub enum EngineCommand {
    TransmissionRequest(TransmissionRequest),
    CancellationRequest {
        session_id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    PacketIn(Bytes),
    SetOneWayLightAndMarginTime {
        one_way_light_time: Duration,
        one_way_margin_time: Duration,
    },
    SetMaxSendRateBitsPerSec(u64),
    TransportRecovered,
    /// a batch from [LtpEngine::pump_send_pipeline] was handed to the transport
    SendCompleted {
        result: anyhow::Result<()>,
        /// session numbers of disk-backed transmissions whose data could not be read for sending
        failed_disk_reads: Vec<u64>,
        /// the batch's disk-backed data, whose files are kept until the send completes
        disk_slices: Vec<DiskSlice>,
    },
    DiskOperationCompleted {
        token: DiskOperationToken,
        result: anyhow::Result<Option<Bytes>>,
    },
    Shutdown,
}

/// Posts commands into a running engine's event loop. All methods fail only if the loop has
///  terminated.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    fn post(&self, command: EngineCommand) -> anyhow::Result<()> {
        self.commands.send(command)
            .map_err(|_| anyhow!("the LTP engine's event loop has terminated"))
    }

    pub fn transmission_request(&self, request: TransmissionRequest) -> anyhow::Result<()> {
        self.post(EngineCommand::TransmissionRequest(request))
    }

    /// Returns false if there is no active session with this id
    pub async fn cancellation_request(&self, session_id: SessionId) -> anyhow::Result<bool> {
        let (reply, result) = oneshot::channel();
        self.post(EngineCommand::CancellationRequest { session_id, reply })?;
        Ok(result.await?)
    }

    pub fn packet_in(&self, packet: Bytes) -> anyhow::Result<()> {
        self.post(EngineCommand::PacketIn(packet))
    }

    pub fn set_one_way_light_and_margin_time(&self, one_way_light_time: Duration, one_way_margin_time: Duration) -> anyhow::Result<()> {
        self.post(EngineCommand::SetOneWayLightAndMarginTime { one_way_light_time, one_way_margin_time })
    }

    pub fn set_max_send_rate_bits_per_sec(&self, bits_per_sec: u64) -> anyhow::Result<()> {
        self.post(EngineCommand::SetMaxSendRateBitsPerSec(bits_per_sec))
    }

    pub fn transport_recovered(&self) -> anyhow::Result<()> {
        self.post(EngineCommand::TransportRecovered)
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.post(EngineCommand::Shutdown)
    }
}

/// Starts an engine on its own task. This must be called from within a tokio runtime.
///
/// The loop terminates on [EngineHandle::shutdown], or when all handles are dropped and no
///  send or disk operation is in flight.
pub fn start_engine(config: LtpEngineConfig, transport: Arc<dyn LtpTransport>) -> anyhow::Result<(EngineHandle, mpsc::UnboundedReceiver<LtpNotice>, JoinHandle<()>)> {
    let (notices_send, notices_recv) = mpsc::unbounded_channel();
    let engine = LtpEngine::new(config, notices_send)?;

    let (commands_send, commands_recv) = mpsc::unbounded_channel();
    let completions = commands_send.downgrade();
    let join_handle = tokio::spawn(run_engine_loop(engine, transport, completions, commands_recv));

    Ok((EngineHandle { commands: commands_send }, notices_recv, join_handle))
}

async fn run_engine_loop(mut engine: LtpEngine, transport: Arc<dyn LtpTransport>, completions: mpsc::WeakUnboundedSender<EngineCommand>, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
    info!("starting event loop for LTP engine {}", engine.config().this_engine_id);

    let mut housekeeping_ticks = time::interval(engine.config().housekeeping_interval);
    housekeeping_ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut refill_ticks = time::interval(engine.config().rate_limit_refill_interval.max(Duration::from_millis(1)));
    refill_ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        let next_timer_expiry = engine.next_timer_expiry();

        select! {
            command = commands.recv() => {
                match command {
                    None | Some(EngineCommand::Shutdown) => break,
                    Some(command) => on_command(&mut engine, command),
                }
            }
            _ = sleep_until_expiry(next_timer_expiry) => {
                engine.on_timers_expired(Instant::now());
            }
            _ = housekeeping_ticks.tick() => {
                engine.housekeeping(Instant::now());
            }
            _ = refill_ticks.tick() => {
                engine.refill_rate_limiter(Instant::now());
            }
        }

        dispatch(&mut engine, &transport, &completions);
    }

    info!("event loop for LTP engine {} terminated", engine.config().this_engine_id);
}

async fn sleep_until_expiry(expiry: Option<Instant>) {
    match expiry {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn on_command(engine: &mut LtpEngine, command: EngineCommand) {
    let now = Instant::now();
    match command {
        EngineCommand::TransmissionRequest(request) => engine.transmission_request(request, now),
        EngineCommand::CancellationRequest { session_id, reply } => {
            let result = engine.cancellation_request(session_id, now);
            let _ = reply.send(result);
        }
        EngineCommand::PacketIn(packet) => {
            // malformed packets are logged and counted by the engine
            let _ = engine.packet_in(packet, now);
        }
        EngineCommand::SetOneWayLightAndMarginTime { one_way_light_time, one_way_margin_time } => {
            engine.set_one_way_light_and_margin_time(one_way_light_time, one_way_margin_time);
        }
        EngineCommand::SetMaxSendRateBitsPerSec(bits_per_sec) => engine.set_max_send_rate_bits_per_sec(bits_per_sec),
        EngineCommand::TransportRecovered => engine.on_transport_recovered(),
        EngineCommand::SendCompleted { result, failed_disk_reads, disk_slices } => {
            for session_number in failed_disk_reads {
                engine.on_segment_disk_read_failed(session_number, now);
            }
            engine.on_send_packets_completed(result, &disk_slices);
        }
        EngineCommand::DiskOperationCompleted { token, result } => engine.on_disk_operation_completed(token, result, now),
        EngineCommand::Shutdown => {}
    }
}

/// Hands outbound packets to the transport and starts pending disk operations, each on its own
///  task that posts its completion back into the loop
fn dispatch(engine: &mut LtpEngine, transport: &Arc<dyn LtpTransport>, completions: &mpsc::WeakUnboundedSender<EngineCommand>) {
    let Some(completions) = completions.upgrade() else {
        debug!("all engine handles were dropped - not starting new operations");
        return;
    };

    for batch in engine.pump_send_pipeline(Instant::now()) {
        let transport = transport.clone();
        let completions = completions.clone();
        let disk_slices = batch.iter()
            .flat_map(|p| p.disk_slices().cloned())
            .collect::<Vec<_>>();
        tokio::spawn(async move {
            let (packets, failed_disk_reads) = resolve_batch(batch).await;
            let result = match packets.is_empty() {
                true => Ok(()),
                false => transport.send_packets(&packets).await,
            };
            let _ = completions.send(EngineCommand::SendCompleted { result, failed_disk_reads, disk_slices });
        });
    }

    for operation in engine.take_disk_operations() {
        let completions = completions.clone();
        tokio::spawn(async move {
            let token = operation.token;
            let result = operation.execute().await;
            let _ = completions.send(EngineCommand::DiskOperationCompleted { token, result });
        });
    }
}

/// Reads the disk-backed parts of a batch's packets. Packets whose data can not be read are
///  dropped and reported by session number.
async fn resolve_batch(batch: Vec<OutboundPacket>) -> (Vec<Vec<Bytes>>, Vec<u64>) {
    let mut packets = Vec::with_capacity(batch.len());
    let mut failed_disk_reads = Vec::new();

    'packets: for packet in batch {
        let mut parts = Vec::with_capacity(packet.parts.len());
        for part in packet.parts {
            match part {
                PacketPart::Memory(bytes) => parts.push(bytes),
                PacketPart::Disk(slice) => match read_at(slice.path.clone(), slice.offset, slice.len).await {
                    Ok(bytes) => parts.push(bytes),
                    Err(e) => {
                        error!("reading segment data from {:?} failed: {}", slice.path, e);
                        failed_disk_reads.extend(packet.disk_session_number);
                        continue 'packets;
                    }
                },
            }
        }
        packets.push(parts);
    }
    (packets, failed_disk_reads)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Instant};
    use crate::config::LtpEngineConfig;
    use crate::disk::DiskSlice;
    use crate::notices::LtpNotice;
    use crate::segment::CancelSegmentReasonCode;
    use crate::session_id::SessionId;
    use crate::transport::{LtpTransport, MockLtpTransport};
    use super::*;

    const USER_DATA: Bytes = Bytes::from_static(b"ud");

    fn request(len: usize) -> TransmissionRequest {
        TransmissionRequest {
            destination_client_service_id: 1,
            destination_engine_id: 2,
            data: Bytes::from(vec![5u8; len]),
            red_length: len as u64,
            user_data: USER_DATA,
        }
    }

    async fn wait_for(notices: &mut mpsc::UnboundedReceiver<LtpNotice>, predicate: impl Fn(&LtpNotice) -> bool) -> LtpNotice {
        timeout(Duration::from_secs(60), async {
            loop {
                let notice = notices.recv().await.unwrap();
                if predicate(&notice) {
                    return notice;
                }
            }
        }).await.unwrap()
    }

    /// delivers packets straight into another engine's event loop
    struct ForwardingTransport {
        peer: Mutex<Option<EngineHandle>>,
    }

    #[async_trait]
    impl LtpTransport for ForwardingTransport {
        async fn send_packet(&self, parts: &[Bytes]) -> anyhow::Result<()> {
            let mut packet = BytesMut::new();
            for part in parts {
                packet.extend_from_slice(part);
            }
            let peer = self.peer.lock().unwrap().clone();
            if let Some(peer) = peer {
                peer.packet_in(packet.freeze())?;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_engines() {
        let transport_a = Arc::new(ForwardingTransport { peer: Mutex::new(None) });
        let transport_b = Arc::new(ForwardingTransport { peer: Mutex::new(None) });

        let (handle_a, mut notices_a, join_a) = start_engine(LtpEngineConfig::new(1, 2), transport_a.clone()).unwrap();
        let (handle_b, mut notices_b, join_b) = start_engine(LtpEngineConfig::new(2, 1), transport_b.clone()).unwrap();
        *transport_a.peer.lock().unwrap() = Some(handle_b.clone());
        *transport_b.peer.lock().unwrap() = Some(handle_a.clone());

        handle_a.transmission_request(request(20_000)).unwrap();

        let received = wait_for(&mut notices_b, |n| matches!(n, LtpNotice::RedPartReception { .. })).await;
        let LtpNotice::RedPartReception { data, is_end_of_block, .. } = received else {
            panic!("unexpected notice");
        };
        assert_eq!(data, Bytes::from(vec![5u8; 20_000]));
        assert!(is_end_of_block);

        wait_for(&mut notices_a, |n| matches!(n, LtpNotice::TransmissionSessionCompleted { .. })).await;
        assert_eq!(
            wait_for(&mut notices_a, |n| matches!(n, LtpNotice::SuccessfulBundleSend { .. })).await,
            LtpNotice::SuccessfulBundleSend { user_data: USER_DATA },
        );

        handle_a.shutdown().unwrap();
        handle_b.shutdown().unwrap();
        join_a.await.unwrap();
        join_b.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_is_retransmitted_by_timer() {
        let (sent_send, mut sent_recv) = mpsc::unbounded_channel();
        let mut transport = MockLtpTransport::new();
        transport.expect_send_packets()
            .returning(move |packets| {
                sent_send.send((Instant::now(), packets.to_vec())).unwrap();
                Ok(())
            });

        let config = LtpEngineConfig::new(1, 2);
        let rtt = config.round_trip_time();
        let (handle, _notices, _join) = start_engine(config, Arc::new(transport)).unwrap();
        handle.transmission_request(request(100)).unwrap();

        let (first_sent, first) = sent_recv.recv().await.unwrap();
        let (second_sent, second) = sent_recv.recv().await.unwrap();
        assert_eq!(first, second);
        assert!(second_sent - first_sent >= rtt);
        assert!(second_sent - first_sent < rtt + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_fails_later_requests() {
        let mut transport = MockLtpTransport::new();
        transport.expect_send_packets()
            .returning(|_| Err(anyhow!("network is unreachable")));

        let (handle, mut notices, _join) = start_engine(LtpEngineConfig::new(1, 2), Arc::new(transport)).unwrap();
        handle.transmission_request(request(100)).unwrap();
        wait_for(&mut notices, |n| matches!(n, LtpNotice::InitialTransmissionCompleted { .. })).await;
        time::sleep(Duration::from_millis(10)).await;

        handle.transmission_request(request(100)).unwrap();
        let cancelled = wait_for(&mut notices, |n| matches!(n, LtpNotice::TransmissionSessionCancelled { .. })).await;
        assert!(matches!(cancelled, LtpNotice::TransmissionSessionCancelled { reason: CancelSegmentReasonCode::SystemCancelled, .. }));
        assert!(matches!(notices.recv().await, Some(LtpNotice::FailedBundleSend { data: Some(_), .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_request() {
        let mut transport = MockLtpTransport::new();
        transport.expect_send_packets()
            .returning(|_| Ok(()));

        let (handle, mut notices, _join) = start_engine(LtpEngineConfig::new(1, 2), Arc::new(transport)).unwrap();
        assert!(!handle.cancellation_request(SessionId::new(1, 17)).await.unwrap());

        handle.transmission_request(request(100_000)).unwrap();
        let LtpNotice::SessionStart { session_id, .. } = wait_for(&mut notices, |n| matches!(n, LtpNotice::SessionStart { .. })).await else {
            panic!("unexpected notice");
        };
        assert!(handle.cancellation_request(session_id).await.unwrap());
        assert!(!handle.cancellation_request(session_id).await.unwrap());
        assert_eq!(
            wait_for(&mut notices, |n| matches!(n, LtpNotice::TransmissionSessionCancelled { .. })).await,
            LtpNotice::TransmissionSessionCancelled { session_id, reason: CancelSegmentReasonCode::UserCancelled },
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown() {
        let transport = MockLtpTransport::new();
        let (handle, _notices, join) = start_engine(LtpEngineConfig::new(1, 2), Arc::new(transport)).unwrap();
        handle.shutdown().unwrap();
        join.await.unwrap();
        assert!(handle.packet_in(Bytes::from_static(&[0])).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ends_when_handles_are_dropped() {
        let transport = MockLtpTransport::new();
        let (handle, _notices, join) = start_engine(LtpEngineConfig::new(1, 2), Arc::new(transport)).unwrap();
        drop(handle);
        timeout(Duration::from_secs(10), join).await.unwrap().unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = LtpEngineConfig::new(1, 2);
        config.max_in_flight_send_system_calls = 0;
        assert!(start_engine(config, Arc::new(MockLtpTransport::new())).is_err());
    }

    #[tokio::test]
    async fn test_resolve_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("data.bin"));
        crate::disk::write_at(path.clone(), 0, Bytes::from_static(b"0123456789")).await.unwrap();

        let readable = DiskSlice { file_index: 0, path: path.clone(), offset: 2, len: 3 };
        let beyond_end = DiskSlice { file_index: 0, path, offset: 8, len: 5 };
        let batch = vec![
            OutboundPacket {
                parts: vec![PacketPart::Memory(Bytes::from_static(b"h")), PacketPart::Disk(readable)],
                len: 4,
                disk_session_number: Some(3),
            },
            OutboundPacket {
                parts: vec![PacketPart::Memory(Bytes::from_static(b"h")), PacketPart::Disk(beyond_end)],
                len: 6,
                disk_session_number: Some(4),
            },
            OutboundPacket {
                parts: vec![PacketPart::Memory(Bytes::from_static(b"ra"))],
                len: 2,
                disk_session_number: None,
            },
        ];

        let (packets, failed_disk_reads) = resolve_batch(batch).await;
        assert_eq!(packets, vec![
            vec![Bytes::from_static(b"h"), Bytes::from_static(b"234")],
            vec![Bytes::from_static(b"ra")],
        ]);
        assert_eq!(failed_disk_reads, vec![4]);
    }
}
