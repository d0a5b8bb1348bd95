//! An implementation of the Licklider Transmission Protocol (LTP, RFC 5326) for moving blocks of
//!  client service data between two engines over a datagram channel with long or intermittent
//!  round trip times.
//!
//! ## Overview
//!
//! A block is transferred in a *session* that is identified by the originating engine's id and a
//!  random session number. The block consists of a *red* part that is transferred reliably and
//!  a *green* part (possibly empty) that is sent once without any acknowledgement:
//!
//! * The sender sends all data segments once ('first pass'). The last red segment is a
//!   *checkpoint*, optionally every Nth red segment is one as well.
//! * The receiver answers every checkpoint with one or more *report segments* that claim the
//!   byte ranges it has received. The sender acknowledges each report and re-sends only the
//!   gaps, the last of them as a new checkpoint.
//! * This repeats until a report claims the entire red part. Checkpoints, reports and cancel
//!   segments are each guarded by a timer of one round trip time and re-sent up to a configured
//!   number of times; after that, the session is cancelled.
//!
//! Either side can cancel a session with a reason code, and the peer acknowledges the
//!  cancellation.
//!
//! ## Structure
//!
//! * [engine::LtpEngine] is a synchronous state machine for a single link to a remote engine.
//!   It owns the sending and receiving sessions and the timers, and decides
//!   which packet goes out next in a fixed priority order.
//! * [runner] runs an engine on a tokio task, and [runner::EngineHandle] posts requests and
//!   inbound packets into it.
//! * [transport::LtpTransport] is the abstraction for the datagram channel, with a UDP
//!   implementation.
//! * Block data can optionally be kept on disk while sessions are active ([disk]), which bounds
//!   memory usage for many concurrent large sessions.
//!
//! ## Segments
//!
//! The wire format follows RFC 5326; all numbers are SDNVs (self-delimiting numeric values, 7
//!  bits per byte with the high bit set on all but the last byte):
//!
//! ```ascii
//! 0: version (4 bits, 0) | segment type flags (4 bits)
//! *: session originator engine id
//! *: session number
//! *: header extension count (4 bits) | trailer extension count (4 bits) - one byte
//! *: header extensions
//! *: segment content, depending on the segment type
//! *: trailer extensions
//! ```

pub mod config;
pub mod disk;
pub mod engine;
mod fragment_set;
pub mod notices;
pub mod random;
pub mod runner;
pub mod segment;
mod session_context;
pub mod session_id;
mod session_receiver;
mod session_sender;
pub mod stats;
pub mod timer_manager;
pub mod token_rate_limiter;
pub mod transport;
mod unique_queue;

pub use config::{DiskOffloadConfig, LtpEngineConfig};
pub use engine::{LinkStatus, LtpEngine, TransmissionRequest};
pub use notices::LtpNotice;
pub use runner::{start_engine, EngineHandle};
pub use segment::CancelSegmentReasonCode;
pub use session_id::SessionId;
pub use transport::{LtpTransport, UdpTransport};
